pub mod error;
pub mod flow;
pub mod prompt;
pub mod step;
pub mod store;
pub mod system_steps;
pub mod version;

pub use error::DefinitionError;
pub use flow::FlowDefinition;
pub use prompt::PromptTemplate;
pub use step::{
    AggregationConfig, AggregationStrategy, ApiCallConfig, DelayPosition, EmailBodyFormat,
    EmailConfig, InferenceParameters, LlmInvocationConfig, MappingSource, ModuleStepConfig,
    OnErrorConfig, ParallelBranchConfig, ParallelForkConfig, ResolvedStep, StepBase,
    StepDefinition, StepDelay, StepInstance, StepPayload, StepPosition, StepRetryConfig, StepType,
    SubFlowConfig, Transition, WaitForEventConfig,
};
pub use store::{DefinitionStore, FileDefinitionStore, InMemoryDefinitionStore};
pub use system_steps::{is_system_step_id, system_step_definition, SYSTEM_STEP_PREFIX};
pub use version::DefinitionVersion;
