use super::{StepHandler, StepHandlerOutput};
use crate::definition::{ResolvedStep, StepPayload};
use crate::orchestration::error::StepError;
use crate::orchestration::starter::FlowStarter;
use crate::orchestration::state::{FlowRuntimeState, FlowTriggerInput};
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Starts a child flow and returns without waiting for it.
pub struct SubFlowHandler {
    starter: Arc<dyn FlowStarter>,
}

impl SubFlowHandler {
    pub fn new(starter: Arc<dyn FlowStarter>) -> Self {
        Self { starter }
    }
}

/// `initialContextData` from the input when present, otherwise the whole input.
fn child_context(input: &Map<String, Value>) -> Map<String, Value> {
    match input.get("initialContextData") {
        Some(Value::Object(context)) => context.clone(),
        _ => input.clone(),
    }
}

impl StepHandler for SubFlowHandler {
    fn handle(
        &self,
        step: &ResolvedStep,
        input: &Map<String, Value>,
        state: &FlowRuntimeState,
    ) -> Result<StepHandlerOutput, StepError> {
        let StepPayload::StartSubFlow(config) = &step.payload else {
            return Err(StepError::permanent("sub-flow handler needs a START_SUB_FLOW step"));
        };
        if config.sub_flow_definition_id.trim().is_empty() {
            return Err(StepError::permanent("subFlowDefinitionId must be set"));
        }
        if state.is_sandbox() {
            return Ok(StepHandlerOutput::data(json!({
                "subFlowExecutionId": null,
                "subFlowDefinitionId": config.sub_flow_definition_id,
                "skipped": true,
            })));
        }

        let mut trigger = FlowTriggerInput::new(
            config.sub_flow_definition_id.clone(),
            config.sub_flow_version,
        )
        .with_context(child_context(input))
        .with_trigger_source(format!(
            "sub-flow:{}:{}",
            state.flow_execution_id, step.step_instance_id
        ));
        trigger.enable_execution_logs = Some(state.enable_execution_logs);

        let child_id = self.starter.start_flow(trigger)?;
        tracing::info!(
            flow_execution_id = %state.flow_execution_id,
            step_instance_id = %step.step_instance_id,
            sub_flow_execution_id = %child_id,
            sub_flow_definition_id = %config.sub_flow_definition_id,
            "started sub-flow"
        );
        Ok(StepHandlerOutput::data(json!({
            "subFlowExecutionId": child_id,
            "subFlowDefinitionId": config.sub_flow_definition_id,
        })))
    }
}
