use super::conditions::ConditionEvaluator;
use super::error::StepError;
use crate::definition::Transition;
use crate::storage::PayloadOffloader;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextStep {
    Step(String),
    Complete,
}

impl NextStep {
    pub fn step_instance_id(&self) -> Option<&str> {
        match self {
            Self::Step(id) => Some(id),
            Self::Complete => None,
        }
    }
}

/// First true condition in declared order wins, then the default, then
/// completion. Declaration order is the only tie-break. Offloaded values in
/// `context` are read back through `offloader` when one is given.
pub fn resolve_next_step(
    transitions: &[Transition],
    default_next_step_instance_id: Option<&str>,
    context: &Value,
    evaluator: &dyn ConditionEvaluator,
    offloader: Option<&PayloadOffloader>,
) -> Result<NextStep, StepError> {
    for transition in transitions {
        if evaluator.evaluate_resolving(&transition.condition, context, offloader)? {
            tracing::debug!(
                condition = %transition.condition,
                next = %transition.next_step_instance_id,
                "transition matched"
            );
            return Ok(NextStep::Step(transition.next_step_instance_id.clone()));
        }
    }
    Ok(match default_next_step_instance_id {
        Some(next) => NextStep::Step(next.to_string()),
        None => NextStep::Complete,
    })
}
