pub mod api_call;
pub mod bom_extract;
pub mod compose_object;
pub mod csv;
pub mod data_join;
pub mod data_load;
pub mod email;
pub mod llm_invocation;
pub mod no_op;
pub mod parallel_fork;
pub mod registry;
pub mod sub_flow;
pub mod wait_for_event;

pub use email::{EmailTransport, OutboxEmailTransport, OutgoingEmail};
pub use registry::{
    HandlerDependencies, StepControl, StepHandler, StepHandlerOutput, StepHandlerRegistry,
    WaitRequest,
};
