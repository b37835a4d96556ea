use super::error::StepError;
use super::mapping::FLOW_RUNTIME_KEY;
use super::starter::FlowStarter;
use super::state::{
    ExecutionOverrides, FlowRuntimeState, FlowStatus, FlowTriggerInput, RuntimeInternal,
};
use crate::definition::DefinitionVersion;
use crate::execution_log::{ExecutionLogError, ExecutionLogStore, StepEventStatus};
use crate::shared::now_rfc3339;
use crate::storage::{BlobStoreError, PayloadOffloader};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum RedriveError {
    #[error("no execution metadata for flow execution `{flow_execution_id}`")]
    MetadataNotFound { flow_execution_id: String },
    #[error("no STARTED record for step `{step_instance_id}` in execution `{flow_execution_id}`")]
    StepRecordNotFound {
        flow_execution_id: String,
        step_instance_id: String,
    },
    #[error("STARTED record for step `{step_instance_id}` has no full record pointer")]
    FullRecordNotFound { step_instance_id: String },
    #[error("full record for step `{step_instance_id}` carries no inputMappingContext")]
    InputContextNotFound { step_instance_id: String },
    #[error("initial input of `{flow_execution_id}` is not a valid trigger: {reason}")]
    InvalidInitialInput {
        flow_execution_id: String,
        reason: String,
    },
    #[error("full step records cannot be read without a blob store")]
    BlobStoreMissing,
    #[error(transparent)]
    Log(#[from] ExecutionLogError),
    #[error(transparent)]
    Blob(#[from] BlobStoreError),
    #[error("failed to submit redrive: {0}")]
    Submit(StepError),
}

impl RedriveError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::MetadataNotFound { .. }
                | Self::StepRecordNotFound { .. }
                | Self::FullRecordNotFound { .. }
                | Self::InputContextNotFound { .. }
        )
    }
}

impl From<RedriveError> for StepError {
    fn from(value: RedriveError) -> Self {
        match value {
            RedriveError::Submit(inner) => inner,
            RedriveError::Log(_) => Self::transient(value.to_string()),
            other => Self::permanent(other.to_string()),
        }
    }
}

/// Rebuilds runs from the execution log and resubmits them.
pub struct RedriveController {
    logs: Arc<dyn ExecutionLogStore>,
    offloader: Option<Arc<PayloadOffloader>>,
    starter: Arc<dyn FlowStarter>,
}

impl RedriveController {
    pub fn new(
        logs: Arc<dyn ExecutionLogStore>,
        offloader: Option<Arc<PayloadOffloader>>,
        starter: Arc<dyn FlowStarter>,
    ) -> Self {
        Self {
            logs,
            offloader,
            starter,
        }
    }

    /// Restarts the run from scratch with its original trigger input.
    pub fn simple_redrive(&self, original_flow_execution_id: &str) -> Result<String, RedriveError> {
        let metadata = self.logs.get_metadata(original_flow_execution_id)?.ok_or_else(|| {
            RedriveError::MetadataNotFound {
                flow_execution_id: original_flow_execution_id.to_string(),
            }
        })?;
        let mut trigger: FlowTriggerInput =
            serde_json::from_value(metadata.initial_input_payload.clone()).map_err(|err| {
                RedriveError::InvalidInitialInput {
                    flow_execution_id: original_flow_execution_id.to_string(),
                    reason: err.to_string(),
                }
            })?;
        trigger.flow_execution_id = None;
        trigger.redrive_of_flow_execution_id = Some(original_flow_execution_id.to_string());
        trigger.trigger_source = Some("redrive".to_string());

        let new_id = self.starter.start_flow(trigger).map_err(RedriveError::Submit)?;
        tracing::info!(
            original_flow_execution_id,
            flow_execution_id = %new_id,
            "simple redrive submitted"
        );
        Ok(new_id)
    }

    /// Resumes mid-flow at `step_instance_id` with the context that step
    /// originally saw, or with `context_override` when given.
    pub fn stateful_redrive(
        &self,
        original_flow_execution_id: &str,
        step_instance_id: &str,
        context_override: Option<Map<String, Value>>,
    ) -> Result<String, RedriveError> {
        let metadata = self.logs.get_metadata(original_flow_execution_id)?.ok_or_else(|| {
            RedriveError::MetadataNotFound {
                flow_execution_id: original_flow_execution_id.to_string(),
            }
        })?;
        let context = match context_override {
            Some(context) => context,
            None => self.logged_input_context(original_flow_execution_id, step_instance_id)?,
        };

        let state = FlowRuntimeState {
            flow_execution_id: original_flow_execution_id.to_string(),
            flow_definition_id: metadata.flow_definition_id.clone(),
            flow_definition_version: metadata.flow_definition_version,
            current_step_instance_id: Some(step_instance_id.to_string()),
            status: FlowStatus::Running,
            start_time: now_rfc3339(),
            current_context_data: context,
            step_retry_attempts: BTreeMap::new(),
            internal: RuntimeInternal {
                is_stateful_redrive: true,
                original_flow_execution_id: Some(original_flow_execution_id.to_string()),
                ..RuntimeInternal::default()
            },
            execution_overrides: None,
            enable_execution_logs: metadata.enable_execution_logs,
            error_info: None,
        };
        let mut trigger = FlowTriggerInput::new(
            metadata.flow_definition_id,
            DefinitionVersion::Number(metadata.flow_definition_version),
        )
        .with_trigger_source("stateful-redrive");
        trigger.enable_execution_logs = Some(metadata.enable_execution_logs);
        trigger.redrive_of_flow_execution_id = Some(original_flow_execution_id.to_string());
        trigger.execution_overrides = Some(ExecutionOverrides {
            start_step_instance_id: None,
            start_from_state: Some(Box::new(state)),
        });

        let new_id = self.starter.start_flow(trigger).map_err(RedriveError::Submit)?;
        tracing::info!(
            original_flow_execution_id,
            step_instance_id,
            flow_execution_id = %new_id,
            "stateful redrive submitted"
        );
        Ok(new_id)
    }

    fn logged_input_context(
        &self,
        flow_execution_id: &str,
        step_instance_id: &str,
    ) -> Result<Map<String, Value>, RedriveError> {
        let record = self
            .logs
            .latest_step_record(flow_execution_id, step_instance_id, StepEventStatus::Started)?
            .ok_or_else(|| RedriveError::StepRecordNotFound {
                flow_execution_id: flow_execution_id.to_string(),
                step_instance_id: step_instance_id.to_string(),
            })?;
        let pointer = record
            .full_record_s3_pointer
            .ok_or_else(|| RedriveError::FullRecordNotFound {
                step_instance_id: step_instance_id.to_string(),
            })?;
        let offloader = self.offloader.as_ref().ok_or(RedriveError::BlobStoreMissing)?;
        let full = offloader.resolve_pointer(&pointer)?;
        let Some(Value::Object(mut context)) = full.get("inputMappingContext").cloned() else {
            return Err(RedriveError::InputContextNotFound {
                step_instance_id: step_instance_id.to_string(),
            });
        };
        context.remove(FLOW_RUNTIME_KEY);
        Ok(context)
    }
}
