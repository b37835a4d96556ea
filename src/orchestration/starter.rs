use super::error::StepError;
use super::state::FlowTriggerInput;
use crate::shared::new_flow_execution_id;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Submits a new flow execution to whatever runs flows. Returns the
/// execution id the run will use.
pub trait FlowStarter: Send + Sync {
    fn start_flow(&self, trigger: FlowTriggerInput) -> Result<String, StepError>;
}

/// Collects submitted triggers for a driver to pick up later.
#[derive(Debug, Default)]
pub struct QueuedFlowStarter {
    queue: Mutex<VecDeque<FlowTriggerInput>>,
}

impl QueuedFlowStarter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<FlowTriggerInput> {
        self.queue
            .lock()
            .map(|mut queue| queue.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().map(|queue| queue.len()).unwrap_or(0)
    }
}

impl FlowStarter for QueuedFlowStarter {
    fn start_flow(&self, mut trigger: FlowTriggerInput) -> Result<String, StepError> {
        let flow_execution_id = trigger
            .flow_execution_id
            .get_or_insert_with(new_flow_execution_id)
            .clone();
        self.queue
            .lock()
            .map_err(|_| StepError::transient("flow start queue lock poisoned"))?
            .push_back(trigger);
        tracing::info!(flow_execution_id = %flow_execution_id, "queued flow start");
        Ok(flow_execution_id)
    }
}
