use super::{StepHandler, StepHandlerOutput};
use crate::definition::ResolvedStep;
use crate::orchestration::error::StepError;
use crate::orchestration::state::FlowRuntimeState;
use serde_json::{Map, Value};

/// Echoes its input.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpHandler;

impl StepHandler for NoOpHandler {
    fn handle(
        &self,
        _step: &ResolvedStep,
        input: &Map<String, Value>,
        _state: &FlowRuntimeState,
    ) -> Result<StepHandlerOutput, StepError> {
        Ok(StepHandlerOutput::data(Value::Object(input.clone())))
    }
}
