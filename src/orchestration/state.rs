use super::branch::ForkPlan;
use super::error::ErrorInfo;
use crate::definition::DefinitionVersion;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowStatus {
    Running,
    Completed,
    Failed,
}

impl FlowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signal returned to whatever drives the processor loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SfnAction {
    ProcessStep,
    Wait,
    Fork,
    Finalize,
}

impl SfnAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProcessStep => "PROCESS_STEP",
            Self::Wait => "WAIT",
            Self::Fork => "FORK",
            Self::Finalize => "FINALIZE",
        }
    }
}

impl std::fmt::Display for SfnAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingWait {
    pub correlation_key: String,
    pub token: String,
    pub step_instance_id: String,
    pub requested_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchContext {
    pub branch_id: String,
    pub fork_step_instance_id: String,
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_step_instance_id: Option<String>,
}

/// Bookkeeping that travels with the state but is never addressable by
/// mappings or conditions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeInternal {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub sandbox_mode: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_stateful_redrive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_flow_execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_handler_result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_wait: Option<PendingWait>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_fork: Option<ForkPlan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<BranchContext>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_step_instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_from_state: Option<Box<FlowRuntimeState>>,
}

/// The value threaded through every processor invocation. It is replaced
/// wholesale on each step and must stay fully serializable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowRuntimeState {
    pub flow_execution_id: String,
    pub flow_definition_id: String,
    pub flow_definition_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_instance_id: Option<String>,
    pub status: FlowStatus,
    pub start_time: String,
    #[serde(default)]
    pub current_context_data: Map<String, Value>,
    #[serde(default)]
    pub step_retry_attempts: BTreeMap<String, u32>,
    #[serde(rename = "_internal", default)]
    pub internal: RuntimeInternal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_overrides: Option<ExecutionOverrides>,
    #[serde(default = "default_enable_execution_logs")]
    pub enable_execution_logs: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_info: Option<ErrorInfo>,
}

fn default_enable_execution_logs() -> bool {
    true
}

impl FlowRuntimeState {
    pub fn is_sandbox(&self) -> bool {
        self.internal.sandbox_mode
    }

    pub fn branch_id(&self) -> Option<&str> {
        self.internal.branch.as_ref().map(|b| b.branch_id.as_str())
    }

    pub fn retry_attempts(&self, step_instance_id: &str) -> u32 {
        self.step_retry_attempts
            .get(step_instance_id)
            .copied()
            .unwrap_or(0)
    }

    /// Attempt number of the next execution of the step, starting at 1.
    pub fn attempt_number(&self, step_instance_id: &str) -> u32 {
        self.retry_attempts(step_instance_id).saturating_add(1)
    }

    pub fn record_retry(&mut self, step_instance_id: &str) -> u32 {
        let count = self
            .step_retry_attempts
            .entry(step_instance_id.to_string())
            .or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Whether execution logs should be written for this state.
    pub fn logs_enabled(&self) -> bool {
        self.enable_execution_logs && !self.internal.sandbox_mode
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowTriggerInput {
    pub flow_definition_id: String,
    #[serde(default)]
    pub flow_version: DefinitionVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_execution_id: Option<String>,
    #[serde(default)]
    pub initial_context_data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_execution_logs: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_overrides: Option<ExecutionOverrides>,
    /// Set when this run re-executes an earlier one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redrive_of_flow_execution_id: Option<String>,
}

impl FlowTriggerInput {
    pub fn new(flow_definition_id: impl Into<String>, flow_version: DefinitionVersion) -> Self {
        Self {
            flow_definition_id: flow_definition_id.into(),
            flow_version,
            flow_execution_id: None,
            initial_context_data: Map::new(),
            trigger_source: None,
            enable_execution_logs: None,
            execution_overrides: None,
            redrive_of_flow_execution_id: None,
        }
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.initial_context_data = context;
        self
    }

    pub fn with_trigger_source(mut self, source: impl Into<String>) -> Self {
        self.trigger_source = Some(source.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorInput {
    pub runtime_state: FlowRuntimeState,
    #[serde(default = "default_input_action")]
    pub sfn_action: SfnAction,
}

fn default_input_action() -> SfnAction {
    SfnAction::ProcessStep
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorOutput {
    pub runtime_state: FlowRuntimeState,
    pub sfn_action: SfnAction,
}

impl ProcessorOutput {
    pub fn new(runtime_state: FlowRuntimeState, sfn_action: SfnAction) -> Self {
        Self {
            runtime_state,
            sfn_action,
        }
    }
}
