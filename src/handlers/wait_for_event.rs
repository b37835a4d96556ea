use super::{StepControl, StepHandler, StepHandlerOutput, WaitRequest};
use crate::definition::{ResolvedStep, StepPayload};
use crate::orchestration::error::StepError;
use crate::orchestration::mapping::{build_mapping_context, FLOW_RUNTIME_KEY};
use crate::orchestration::state::FlowRuntimeState;
use crate::orchestration::template::render_against;
use serde_json::{json, Map, Value};

/// Suspends the flow until an event with the rendered correlation key
/// arrives. The key template sees the step input plus `_flow_runtime`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WaitForEventHandler;

impl StepHandler for WaitForEventHandler {
    fn handle(
        &self,
        step: &ResolvedStep,
        input: &Map<String, Value>,
        state: &FlowRuntimeState,
    ) -> Result<StepHandlerOutput, StepError> {
        let StepPayload::WaitForExternalEvent(config) = &step.payload else {
            return Err(StepError::permanent(
                "wait handler needs a WAIT_FOR_EXTERNAL_EVENT step",
            ));
        };

        let mut context = input.clone();
        if let Some(runtime) = build_mapping_context(state).get(FLOW_RUNTIME_KEY) {
            context.insert(FLOW_RUNTIME_KEY.to_string(), runtime.clone());
        }
        let correlation_key =
            render_against(&config.correlation_key_template, &Value::Object(context)).map_err(
                |reason| StepError::permanent(format!("correlationKeyTemplate: {reason}")),
            )?;
        let correlation_key = correlation_key.trim().to_string();
        if correlation_key.is_empty() {
            return Err(StepError::permanent("correlation key rendered empty"));
        }

        Ok(StepHandlerOutput::data(json!({
            "correlationKey": correlation_key,
            "timeoutSeconds": config.timeout_seconds,
        }))
        .with_control(StepControl::Wait(WaitRequest {
            correlation_key,
            timeout_seconds: config.timeout_seconds,
        })))
    }
}
