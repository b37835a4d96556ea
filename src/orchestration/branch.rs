use super::error::{ErrorInfo, StepError};
use super::state::{BranchContext, FlowRuntimeState, RuntimeInternal};
use crate::definition::{AggregationConfig, AggregationStrategy};
use crate::hydration::deep_merge;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchSpec {
    pub branch_id: String,
    pub start_step_instance_id: String,
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// Fan-out produced by a PARALLEL_FORK_MANAGER step and parked in
/// `_internal.pendingFork` until every branch has reported back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkPlan {
    pub fork_step_instance_id: String,
    pub branches: Vec<BranchSpec>,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    pub item_variable: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

impl ForkPlan {
    /// Where the aggregate lands in the parent context.
    pub fn output_path(&self) -> String {
        self.aggregation
            .output_path
            .clone()
            .unwrap_or_else(|| format!("steps_output.{}", self.fork_step_instance_id))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchOutcome {
    pub branch_id: String,
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_info: Option<ErrorInfo>,
}

impl BranchOutcome {
    pub fn succeeded(spec: &BranchSpec, output: Value) -> Self {
        Self {
            branch_id: spec.branch_id.clone(),
            index: spec.index,
            output: Some(output),
            error_info: None,
        }
    }

    pub fn failed(spec: &BranchSpec, error: &StepError) -> Self {
        Self {
            branch_id: spec.branch_id.clone(),
            index: spec.index,
            output: None,
            error_info: Some(error.error_info()),
        }
    }
}

/// The state a single branch starts from: the parent's context plus the
/// branch item, fresh retry counters and no pending control.
pub fn build_branch_state(
    parent: &FlowRuntimeState,
    plan: &ForkPlan,
    spec: &BranchSpec,
) -> FlowRuntimeState {
    let mut context = parent.current_context_data.clone();
    if let Some(item) = &spec.item {
        context.insert(plan.item_variable.clone(), item.clone());
    }
    FlowRuntimeState {
        flow_execution_id: parent.flow_execution_id.clone(),
        flow_definition_id: parent.flow_definition_id.clone(),
        flow_definition_version: parent.flow_definition_version,
        current_step_instance_id: Some(spec.start_step_instance_id.clone()),
        status: parent.status,
        start_time: parent.start_time.clone(),
        current_context_data: context,
        step_retry_attempts: BTreeMap::new(),
        internal: RuntimeInternal {
            sandbox_mode: parent.internal.sandbox_mode,
            is_stateful_redrive: parent.internal.is_stateful_redrive,
            original_flow_execution_id: parent.internal.original_flow_execution_id.clone(),
            branch: Some(BranchContext {
                branch_id: spec.branch_id.clone(),
                fork_step_instance_id: plan.fork_step_instance_id.clone(),
                index: spec.index,
                last_step_instance_id: None,
            }),
            ..RuntimeInternal::default()
        },
        execution_overrides: None,
        enable_execution_logs: parent.enable_execution_logs,
        error_info: None,
    }
}

/// Output of the last step the branch completed, or `null` if it ran none.
pub fn branch_result(state: &FlowRuntimeState) -> Value {
    let last = state
        .internal
        .branch
        .as_ref()
        .and_then(|branch| branch.last_step_instance_id.as_deref());
    last.and_then(|step_id| {
        state
            .current_context_data
            .get("steps_output")
            .and_then(|outputs| outputs.get(step_id))
            .cloned()
    })
    .unwrap_or(Value::Null)
}

/// Combines branch outcomes in declaration order, independent of the order
/// they finished in.
pub fn aggregate(plan: &ForkPlan, mut outcomes: Vec<BranchOutcome>) -> Result<Value, StepError> {
    outcomes.sort_by_key(|outcome| outcome.index);

    if plan.aggregation.fail_on_branch_error {
        if let Some(failed) = outcomes.iter().find(|o| o.error_info.is_some()) {
            let info = failed.error_info.as_ref().map(StepError::from_error_info);
            let error = info.unwrap_or_else(|| StepError::permanent("branch failed"));
            return Err(StepError {
                message: format!("branch `{}` failed: {}", failed.branch_id, error.message),
                step_instance_id: Some(plan.fork_step_instance_id.clone()),
                ..error
            });
        }
    }

    match plan.aggregation.strategy {
        AggregationStrategy::CollectArray => Ok(Value::Array(
            outcomes
                .into_iter()
                .map(|outcome| match (outcome.output, outcome.error_info) {
                    (_, Some(info)) => json!({"branchId": outcome.branch_id, "errorInfo": info}),
                    (Some(output), None) => output,
                    (None, None) => Value::Null,
                })
                .collect(),
        )),
        AggregationStrategy::MergeObjects => {
            let mut merged = Value::Object(Map::new());
            for outcome in outcomes {
                match outcome.output {
                    Some(Value::Object(object)) => {
                        merged = deep_merge(merged, Value::Object(object));
                    }
                    Some(other) => {
                        if let Value::Object(target) = &mut merged {
                            target.insert(outcome.branch_id, other);
                        }
                    }
                    None => {}
                }
            }
            Ok(merged)
        }
    }
}
