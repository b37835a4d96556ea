pub mod hydrator;
pub mod merge;

pub use hydrator::{DefinitionHydrator, STRIPPED_DEFINITION_FIELDS};
pub use merge::deep_merge;
