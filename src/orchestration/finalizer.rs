use super::error::StepError;
use super::state::{FlowRuntimeState, FlowStatus};
use crate::execution_log::{ExecutionLogger, FinalStatusUpdate};
use crate::shared::now_rfc3339;
use crate::storage::{PayloadOffloader, S3Pointer};
use serde_json::Value;
use std::sync::Arc;

pub fn final_context_key(flow_execution_id: &str) -> String {
    format!("flow_executions/{flow_execution_id}/final_context.json")
}

/// Marks a run terminal, snapshots its context to blob storage and updates
/// the metadata record. Only terminal fields are touched.
pub struct FlowFinalizer {
    offloader: Option<Arc<PayloadOffloader>>,
    logger: ExecutionLogger,
}

impl FlowFinalizer {
    pub fn new(offloader: Option<Arc<PayloadOffloader>>, logger: ExecutionLogger) -> Self {
        Self { offloader, logger }
    }

    pub fn finalize(
        &self,
        mut state: FlowRuntimeState,
        error: Option<&StepError>,
    ) -> FlowRuntimeState {
        state.status = match error {
            Some(_) => FlowStatus::Failed,
            None => FlowStatus::Completed,
        };
        state.error_info = error.map(StepError::error_info);
        state.internal.pending_wait = None;
        state.internal.pending_fork = None;

        match error {
            Some(error) => tracing::warn!(
                flow_execution_id = %state.flow_execution_id,
                error_name = error.error_name(),
                step_instance_id = error.step_instance_id.as_deref().unwrap_or(""),
                error = %error.message,
                "flow failed"
            ),
            None => tracing::info!(
                flow_execution_id = %state.flow_execution_id,
                "flow completed"
            ),
        }

        if !state.logs_enabled() {
            return state;
        }
        let pointer = self.snapshot_context(&state);
        self.logger.update_final_status(&FinalStatusUpdate {
            flow_execution_id: state.flow_execution_id.clone(),
            status: state.status,
            end_time: now_rfc3339(),
            final_context_data_s3_pointer: pointer,
            error_info: state.error_info.clone(),
        });
        state
    }

    fn snapshot_context(&self, state: &FlowRuntimeState) -> Option<S3Pointer> {
        let offloader = self.offloader.as_ref()?;
        let context = Value::Object(state.current_context_data.clone());
        match offloader.put_json(&final_context_key(&state.flow_execution_id), &context) {
            Ok(pointer) => Some(pointer),
            Err(err) => {
                tracing::warn!(
                    flow_execution_id = %state.flow_execution_id,
                    error = %err,
                    "failed to store final context snapshot"
                );
                None
            }
        }
    }
}
