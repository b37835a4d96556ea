use super::{StepControl, StepHandler, StepHandlerOutput};
use crate::definition::{ParallelForkConfig, ResolvedStep, StepPayload};
use crate::orchestration::branch::{BranchSpec, ForkPlan};
use crate::orchestration::error::StepError;
use crate::orchestration::json_path::get_path;
use crate::orchestration::state::FlowRuntimeState;
use serde_json::{json, Map, Value};

/// Plans the fan-out. Branches themselves are run by whoever drives the
/// processor once it sees the FORK action.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParallelForkHandler;

/// One branch per declared branch when `itemsPath` is unset; otherwise one
/// branch per (item, declared branch) pair with ids `<branchId>-<itemIndex>`.
pub fn plan_branches(
    config: &ParallelForkConfig,
    input: &Map<String, Value>,
) -> Result<Vec<BranchSpec>, StepError> {
    if config.parallel_branches.is_empty() {
        return Err(StepError::permanent("parallelBranches must not be empty"));
    }

    let Some(items_path) = &config.items_path else {
        return Ok(config
            .parallel_branches
            .iter()
            .enumerate()
            .map(|(index, branch)| BranchSpec {
                branch_id: branch.branch_id.clone(),
                start_step_instance_id: branch.step_instance_id.clone(),
                index,
                item: None,
                condition: branch.condition.clone(),
            })
            .collect());
    };

    let root = Value::Object(input.clone());
    let items = get_path(&root, items_path)
        .map_err(|err| StepError::permanent(err.to_string()))?
        .and_then(Value::as_array)
        .ok_or_else(|| {
            StepError::permanent(format!("itemsPath `{items_path}` did not resolve to an array"))
        })?;

    let mut specs = Vec::with_capacity(items.len() * config.parallel_branches.len());
    for (item_index, item) in items.iter().enumerate() {
        for branch in &config.parallel_branches {
            specs.push(BranchSpec {
                branch_id: format!("{}-{item_index}", branch.branch_id),
                start_step_instance_id: branch.step_instance_id.clone(),
                index: specs.len(),
                item: Some(item.clone()),
                condition: branch.condition.clone(),
            });
        }
    }
    Ok(specs)
}

impl StepHandler for ParallelForkHandler {
    fn handle(
        &self,
        step: &ResolvedStep,
        input: &Map<String, Value>,
        _state: &FlowRuntimeState,
    ) -> Result<StepHandlerOutput, StepError> {
        let StepPayload::ParallelForkManager(config) = &step.payload else {
            return Err(StepError::permanent(
                "fork handler needs a PARALLEL_FORK_MANAGER step",
            ));
        };
        let branches = plan_branches(config, input)?;
        let plan = ForkPlan {
            fork_step_instance_id: step.step_instance_id.clone(),
            branches,
            aggregation: config.aggregation_config.clone(),
            item_variable: config.item_variable.clone(),
            max_concurrency: config.max_concurrency,
        };
        Ok(StepHandlerOutput::data(json!({
            "branchCount": plan.branches.len(),
            "branchIds": plan.branches.iter().map(|b| b.branch_id.as_str()).collect::<Vec<_>>(),
        }))
        .with_control(StepControl::Fork(plan)))
    }
}
