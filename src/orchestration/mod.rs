pub mod branch;
pub mod conditions;
pub mod continuation;
pub mod delay;
pub mod driver;
pub mod error;
pub mod finalizer;
pub mod initializer;
pub mod json_path;
pub mod mapping;
pub mod redrive;
pub mod sandbox;
pub mod starter;
pub mod state;
pub mod step_processor;
pub mod template;
pub mod transitions;

pub use branch::{BranchOutcome, BranchSpec, ForkPlan};
pub use conditions::{ConditionEvaluator, JsonPathConditionEvaluator};
pub use continuation::{
    Continuation, ContinuationError, ContinuationStore, InMemoryContinuationStore,
    SqliteContinuationStore,
};
pub use delay::{RecordingSleeper, Sleeper, ThreadSleeper};
pub use driver::{LocalOrchestrator, RunOutcome};
pub use error::{ErrorInfo, ErrorKind, StepError};
pub use finalizer::FlowFinalizer;
pub use initializer::FlowInitializer;
pub use redrive::{RedriveController, RedriveError};
pub use sandbox::{SandboxController, SandboxStepRequest, SandboxStepResult};
pub use starter::{FlowStarter, QueuedFlowStarter};
pub use state::{
    FlowRuntimeState, FlowStatus, FlowTriggerInput, ProcessorInput, ProcessorOutput, SfnAction,
};
pub use step_processor::{StepProcessor, StepTrace};
pub use transitions::{resolve_next_step, NextStep};
