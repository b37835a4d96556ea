use super::error::{ErrorInfo, StepError};
use super::state::{
    FlowRuntimeState, FlowStatus, ProcessorInput, ProcessorOutput, RuntimeInternal, SfnAction,
};
use super::step_processor::{StepProcessor, StepTrace};
use crate::definition::DefinitionVersion;
use crate::shared::now_rfc3339;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxStepRequest {
    pub flow_definition_id: String,
    #[serde(default)]
    pub flow_version: DefinitionVersion,
    pub step_instance_id: String,
    #[serde(default)]
    pub context: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxStepResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<ProcessorOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_info: Option<ErrorInfo>,
    pub trace: StepTrace,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendered_prompt: Option<String>,
}

impl SandboxStepResult {
    pub fn succeeded(&self) -> bool {
        self.error_info.is_none()
    }
}

/// Runs one step of a flow against a caller-supplied context. Nothing is
/// written to the execution log and step outputs are never offloaded.
pub struct SandboxController {
    processor: Arc<StepProcessor>,
}

impl SandboxController {
    pub fn new(processor: Arc<StepProcessor>) -> Self {
        Self { processor }
    }

    pub fn execute_step(
        &self,
        request: SandboxStepRequest,
    ) -> Result<SandboxStepResult, StepError> {
        let flow = self
            .processor
            .definitions()
            .load_flow_definition(&request.flow_definition_id, request.flow_version)?;
        flow.step(&request.step_instance_id)
            .map_err(|err| StepError::from(err).in_step(&request.step_instance_id))?;

        let state = FlowRuntimeState {
            flow_execution_id: format!("sandbox-{}", uuid::Uuid::new_v4()),
            flow_definition_id: flow.id.clone(),
            flow_definition_version: flow.version,
            current_step_instance_id: Some(request.step_instance_id.clone()),
            status: FlowStatus::Running,
            start_time: now_rfc3339(),
            current_context_data: request.context,
            step_retry_attempts: BTreeMap::new(),
            internal: RuntimeInternal {
                sandbox_mode: true,
                ..RuntimeInternal::default()
            },
            execution_overrides: None,
            enable_execution_logs: false,
            error_info: None,
        };
        tracing::info!(
            flow_definition_id = %flow.id,
            flow_definition_version = flow.version,
            step_instance_id = %request.step_instance_id,
            "sandbox step execution"
        );

        let (result, trace) = self.processor.process_traced(ProcessorInput {
            runtime_state: state,
            sfn_action: SfnAction::ProcessStep,
        });
        let rendered_prompt = trace
            .meta
            .as_ref()
            .and_then(|meta| meta.get("renderedPrompt"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let (output, error_info) = match result {
            Ok(output) => (Some(output), None),
            Err(error) => (None, Some(error.error_info())),
        };
        Ok(SandboxStepResult {
            output,
            error_info,
            trace,
            rendered_prompt,
        })
    }
}
