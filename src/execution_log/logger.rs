use super::record::{
    ExecutionMetadataRecord, FinalStatusUpdate, FullStepRecord, StepExecutionRecord,
};
use super::ExecutionLogStore;
use crate::storage::PayloadOffloader;
use std::sync::Arc;

/// Blob key for the full record of one step event.
pub fn full_record_key(record: &StepExecutionRecord) -> String {
    let step_dir = match &record.branch_id {
        Some(branch_id) => format!("{}/{}", record.step_instance_id, branch_id),
        None => record.step_instance_id.clone(),
    };
    format!(
        "execution_logs/{}/steps/{}/{}-{}.json",
        record.flow_execution_id,
        step_dir,
        record.attempt_number,
        record.status.as_str().to_ascii_lowercase()
    )
}

/// Fire-and-forget client over the execution log. Failures are reported
/// through `tracing` and never reach the caller.
#[derive(Clone, Default)]
pub struct ExecutionLogger {
    store: Option<Arc<dyn ExecutionLogStore>>,
    offloader: Option<Arc<PayloadOffloader>>,
}

impl ExecutionLogger {
    pub fn new(
        store: Arc<dyn ExecutionLogStore>,
        offloader: Option<Arc<PayloadOffloader>>,
    ) -> Self {
        Self {
            store: Some(store),
            offloader,
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub fn store(&self) -> Option<&Arc<dyn ExecutionLogStore>> {
        self.store.as_ref()
    }

    pub fn create_metadata_record(&self, record: &ExecutionMetadataRecord) {
        let Some(store) = &self.store else {
            return;
        };
        match store.put_metadata(record) {
            Ok(true) => {}
            Ok(false) => tracing::debug!(
                flow_execution_id = %record.flow_execution_id,
                "metadata record already present"
            ),
            Err(err) => tracing::warn!(
                flow_execution_id = %record.flow_execution_id,
                error = %err,
                "failed to create execution metadata record"
            ),
        }
    }

    /// Writes the full record to blob storage, then appends the minimal
    /// record pointing at it.
    pub fn log_step_execution(&self, full: FullStepRecord) {
        let Some(store) = &self.store else {
            return;
        };
        let mut minimal = full.summary.clone();

        if let Some(offloader) = &self.offloader {
            let key = full_record_key(&minimal);
            match serde_json::to_value(&full)
                .map_err(|err| err.to_string())
                .and_then(|value| offloader.put_json(&key, &value).map_err(|e| e.to_string()))
            {
                Ok(pointer) => minimal.full_record_s3_pointer = Some(pointer),
                Err(err) => tracing::warn!(
                    flow_execution_id = %minimal.flow_execution_id,
                    step_instance_id = %minimal.step_instance_id,
                    error = %err,
                    "failed to store full step record"
                ),
            }

            if let Some(output) = minimal.output_data.take() {
                let prefix = key.trim_end_matches(".json").to_string() + "/fields";
                minimal.output_data = match offloader.offload_large_fields(output, &prefix) {
                    Ok(compact) => Some(compact),
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to offload step output fields");
                        None
                    }
                };
            }
        } else if minimal.output_data.is_some() {
            minimal.output_data = None;
        }

        if let Err(err) = store.append_step_record(&minimal) {
            tracing::warn!(
                flow_execution_id = %minimal.flow_execution_id,
                step_instance_id = %minimal.step_instance_id,
                status = %minimal.status,
                error = %err,
                "failed to append step execution record"
            );
        }
    }

    pub fn update_final_status(&self, update: &FinalStatusUpdate) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(err) = store.update_final_status(update) {
            tracing::warn!(
                flow_execution_id = %update.flow_execution_id,
                status = %update.status,
                error = %err,
                "failed to update final execution status"
            );
        }
    }
}
