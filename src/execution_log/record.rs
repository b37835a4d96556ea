use crate::definition::StepType;
use crate::orchestration::error::ErrorInfo;
use crate::orchestration::state::FlowStatus;
use crate::storage::S3Pointer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const METADATA_SORT_KEY: &str = "METADATA";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepEventStatus {
    Started,
    Completed,
    Failed,
    Waiting,
    Forked,
}

impl StepEventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "STARTED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Waiting => "WAITING",
            Self::Forked => "FORKED",
        }
    }
}

impl std::fmt::Display for StepEventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row per flow execution, written once and later updated only on its
/// terminal fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetadataRecord {
    pub flow_execution_id: String,
    pub flow_definition_id: String,
    pub flow_definition_version: u32,
    pub status: FlowStatus,
    pub start_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(default)]
    pub initial_input_payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_source: Option<String>,
    #[serde(default = "default_enable_execution_logs")]
    pub enable_execution_logs: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redrive_of_flow_execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_context_data_s3_pointer: Option<S3Pointer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_info: Option<ErrorInfo>,
}

fn default_enable_execution_logs() -> bool {
    true
}

/// The minimal per-event record kept in the log table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepExecutionRecord {
    pub flow_execution_id: String,
    pub step_instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_definition_id: Option<String>,
    pub step_type: StepType,
    pub attempt_number: u32,
    pub status: StepEventStatus,
    pub event_timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_info: Option<ErrorInfo>,
    /// Handler output with oversized fields replaced by pointer wrappers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_record_s3_pointer: Option<S3Pointer>,
}

/// Everything the step saw and produced. Stored in blob storage; the log
/// table only keeps a pointer to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullStepRecord {
    #[serde(flatten)]
    pub summary: StepExecutionRecord,
    #[serde(default)]
    pub input_mapping_context: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_mapping_result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalStatusUpdate {
    pub flow_execution_id: String,
    pub status: FlowStatus,
    pub end_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_context_data_s3_pointer: Option<S3Pointer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_info: Option<ErrorInfo>,
}

pub fn metadata_sort_key() -> &'static str {
    METADATA_SORT_KEY
}

/// `STEP#{timestamp}#{stepInstanceId}#{attempt}#{status}`, suffixed with
/// `#{branchId}` for events emitted inside a parallel branch.
pub fn step_sort_key(record: &StepExecutionRecord) -> String {
    let key = format!(
        "STEP#{}#{}#{}#{}",
        record.event_timestamp, record.step_instance_id, record.attempt_number, record.status
    );
    match &record.branch_id {
        Some(branch_id) => format!("{key}#{branch_id}"),
        None => key,
    }
}
