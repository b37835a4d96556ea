pub mod logger;
pub mod record;
pub mod store;

pub use logger::{full_record_key, ExecutionLogger};
pub use record::{
    metadata_sort_key, step_sort_key, ExecutionMetadataRecord, FinalStatusUpdate, FullStepRecord,
    StepEventStatus, StepExecutionRecord, METADATA_SORT_KEY,
};
pub use store::{
    ExecutionLogError, ExecutionLogStore, InMemoryExecutionLogStore, SqliteExecutionLogStore,
};
