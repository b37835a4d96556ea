use super::branch::{branch_result, build_branch_state, BranchOutcome, BranchSpec, ForkPlan};
use super::continuation::{Continuation, ContinuationStore};
use super::delay::{Sleeper, ThreadSleeper};
use super::error::{ErrorKind, StepError};
use super::finalizer::FlowFinalizer;
use super::initializer::FlowInitializer;
use super::starter::QueuedFlowStarter;
use super::state::{
    FlowRuntimeState, FlowStatus, FlowTriggerInput, ProcessorInput, ProcessorOutput, SfnAction,
};
use super::step_processor::StepProcessor;
use crate::config::{OrchestratorSettings, StepRetrySettings};
use crate::shared::now_rfc3339;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Where a run stopped after the driver stopped calling the processor.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(FlowRuntimeState),
    Failed {
        state: FlowRuntimeState,
        error: StepError,
    },
    Waiting {
        state: FlowRuntimeState,
        correlation_key: String,
    },
}

impl RunOutcome {
    pub fn state(&self) -> &FlowRuntimeState {
        match self {
            Self::Completed(state) => state,
            Self::Failed { state, .. } | Self::Waiting { state, .. } => state,
        }
    }

    pub fn flow_execution_id(&self) -> &str {
        &self.state().flow_execution_id
    }

    pub fn status(&self) -> FlowStatus {
        self.state().status
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::Waiting { .. })
    }
}

enum Pause {
    Finished(FlowRuntimeState),
    Failed(FlowRuntimeState, StepError),
    Waiting(FlowRuntimeState),
}

/// Retry policy applied by the driver to transient failures. A step's
/// `onError.retries` replaces the configured default.
#[derive(Debug, Clone, Copy, PartialEq)]
struct TransientRetry {
    max_attempts: u32,
    interval_ms: u64,
    backoff_rate: f64,
}

impl TransientRetry {
    fn delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let millis = self.interval_ms as f64 * self.backoff_rate.max(1.0).powi(exponent);
        Duration::from_millis(millis.min(u64::MAX as f64) as u64)
    }
}

impl From<&StepRetrySettings> for TransientRetry {
    fn from(value: &StepRetrySettings) -> Self {
        Self {
            max_attempts: value.max_attempts.max(1),
            interval_ms: value.interval_ms,
            backoff_rate: value.backoff_rate,
        }
    }
}

/// In-process stand-in for the durable orchestrator: it loops the
/// processor, retries transient failures, runs fork branches on scoped
/// threads and parks waiting flows in a [`ContinuationStore`].
pub struct LocalOrchestrator {
    processor: Arc<StepProcessor>,
    initializer: FlowInitializer,
    finalizer: FlowFinalizer,
    continuations: Arc<dyn ContinuationStore>,
    starter: Arc<QueuedFlowStarter>,
    settings: OrchestratorSettings,
    sleeper: Arc<dyn Sleeper>,
}

impl LocalOrchestrator {
    pub fn new(
        processor: Arc<StepProcessor>,
        initializer: FlowInitializer,
        finalizer: FlowFinalizer,
        continuations: Arc<dyn ContinuationStore>,
        starter: Arc<QueuedFlowStarter>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            processor,
            initializer,
            finalizer,
            continuations,
            starter,
            settings,
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn processor(&self) -> &Arc<StepProcessor> {
        &self.processor
    }

    pub fn starter(&self) -> &Arc<QueuedFlowStarter> {
        &self.starter
    }

    pub fn continuations(&self) -> &Arc<dyn ContinuationStore> {
        &self.continuations
    }

    /// Initializes and runs a flow until it completes, fails or waits.
    pub fn start(&self, trigger: FlowTriggerInput) -> Result<RunOutcome, StepError> {
        let state = self.initializer.initialize(trigger)?;
        Ok(self.drive(ProcessorOutput::new(state, SfnAction::ProcessStep)))
    }

    /// Runs every queued trigger, including ones queued by the runs
    /// themselves, until the queue is empty.
    pub fn run_queued(&self) -> Vec<Result<RunOutcome, StepError>> {
        let mut outcomes = Vec::new();
        let mut rounds = 0u32;
        loop {
            let batch = self.starter.drain();
            if batch.is_empty() {
                break;
            }
            rounds += 1;
            if rounds > self.settings.max_cycles {
                tracing::warn!(pending = batch.len(), "queued flow starts keep growing; stopping");
                break;
            }
            outcomes.extend(batch.into_iter().map(|trigger| self.start(trigger)));
        }
        outcomes
    }

    /// Hands an external event to the flow parked on `correlation_key`.
    pub fn deliver_event(
        &self,
        correlation_key: &str,
        payload: Value,
    ) -> Result<RunOutcome, StepError> {
        let continuation = self.continuations.take(correlation_key)?.ok_or_else(|| {
            StepError::permanent(format!(
                "no flow is waiting on correlation key `{correlation_key}`"
            ))
        })?;
        let before = continuation.state.clone();
        match self.processor.resume_after_event(continuation.state, payload) {
            Ok(output) => Ok(self.drive(output)),
            Err(error) => Ok(self.fail(before, error)),
        }
    }

    /// Fails every parked flow whose wait timeout has passed at `now`,
    /// routing through the waiting step's `onError` when it has one.
    pub fn expire_waits(&self, now: DateTime<Utc>) -> Result<Vec<RunOutcome>, StepError> {
        let mut outcomes = Vec::new();
        for parked in self.continuations.list()? {
            let Some(wait) = parked.state.internal.pending_wait.as_ref() else {
                continue;
            };
            let Some(timeout) = wait.timeout_seconds else {
                continue;
            };
            let Ok(requested) = DateTime::parse_from_rfc3339(&wait.requested_at) else {
                continue;
            };
            let window =
                chrono::Duration::seconds(i64::from(u32::try_from(timeout).unwrap_or(u32::MAX)));
            let expired = requested
                .with_timezone(&Utc)
                .checked_add_signed(window)
                .is_some_and(|deadline| now >= deadline);
            if !expired {
                continue;
            }
            let Some(continuation) = self.continuations.take(&parked.correlation_key)? else {
                continue;
            };
            let mut state = continuation.state;
            let step_id = wait.step_instance_id.clone();
            state.internal.pending_wait = None;
            let error = StepError::permanent(format!(
                "timed out after {timeout}s waiting for `{}`",
                continuation.correlation_key
            ))
            .in_step(&step_id);
            let before = state.clone();
            outcomes.push(match self.processor.apply_error_handler(state, error) {
                Ok(output) => self.drive(output),
                Err(error) => self.fail(before, error),
            });
        }
        Ok(outcomes)
    }

    /// Continues from a processor output, finalizing or parking the run.
    pub fn drive(&self, output: ProcessorOutput) -> RunOutcome {
        match self.run_until_pause(output) {
            Pause::Finished(state) => RunOutcome::Completed(self.finalizer.finalize(state, None)),
            Pause::Failed(state, error) => self.fail(state, error),
            Pause::Waiting(state) => self.park(state),
        }
    }

    fn fail(&self, state: FlowRuntimeState, error: StepError) -> RunOutcome {
        let state = self.finalizer.finalize(state, Some(&error));
        RunOutcome::Failed { state, error }
    }

    fn park(&self, state: FlowRuntimeState) -> RunOutcome {
        let Some(wait) = state.internal.pending_wait.clone() else {
            return self.fail(state, StepError::permanent("WAIT returned without a pending wait"));
        };
        let continuation = Continuation {
            correlation_key: wait.correlation_key.clone(),
            token: wait.token.clone(),
            flow_execution_id: state.flow_execution_id.clone(),
            created_at: now_rfc3339(),
            state,
        };
        if let Err(err) = self.continuations.park(&continuation) {
            let error = StepError::from(err).in_step(&wait.step_instance_id);
            return self.fail(continuation.state, error);
        }
        tracing::info!(
            flow_execution_id = %continuation.flow_execution_id,
            correlation_key = %wait.correlation_key,
            "flow parked"
        );
        RunOutcome::Waiting {
            state: continuation.state,
            correlation_key: wait.correlation_key,
        }
    }

    fn run_until_pause(&self, mut output: ProcessorOutput) -> Pause {
        let mut cycles = 0u32;
        loop {
            match output.sfn_action {
                SfnAction::Finalize => return Pause::Finished(output.runtime_state),
                SfnAction::Wait => return Pause::Waiting(output.runtime_state),
                SfnAction::Fork => {
                    let outcomes = self.run_fork(&output.runtime_state);
                    let before = output.runtime_state.clone();
                    output = match self.processor.complete_fork(output.runtime_state, outcomes) {
                        Ok(next) => next,
                        Err(error) => return Pause::Failed(before, error),
                    };
                }
                SfnAction::ProcessStep => {
                    cycles += 1;
                    if cycles > self.settings.max_cycles {
                        let error = StepError::permanent(format!(
                            "flow exceeded {} processor cycles",
                            self.settings.max_cycles
                        ));
                        return Pause::Failed(output.runtime_state, error);
                    }
                    output = match self.process_with_retry(output.runtime_state) {
                        Ok(next) => next,
                        Err((state, error)) => return Pause::Failed(state, error),
                    };
                }
            }
        }
    }

    fn retry_policy(&self, state: &FlowRuntimeState) -> TransientRetry {
        let step_override = state
            .current_step_instance_id
            .as_deref()
            .and_then(|step_id| self.processor.resolve_step(state, step_id).ok())
            .and_then(|step| step.retry_config());
        let mut policy = TransientRetry::from(&self.settings.step_retry);
        if let Some(retries) = step_override {
            policy.max_attempts = retries.max_attempts.max(1);
            policy.interval_ms = retries.interval_ms.unwrap_or(policy.interval_ms);
            policy.backoff_rate = retries.backoff_rate.unwrap_or(policy.backoff_rate);
        }
        policy
    }

    fn process_with_retry(
        &self,
        mut state: FlowRuntimeState,
    ) -> Result<ProcessorOutput, (FlowRuntimeState, StepError)> {
        let mut cached_policy: Option<TransientRetry> = None;
        loop {
            let before = state.clone();
            let error = match self.processor.process(ProcessorInput {
                runtime_state: state,
                sfn_action: SfnAction::ProcessStep,
            }) {
                Ok(output) => return Ok(output),
                Err(error) => error,
            };
            if error.kind != ErrorKind::Transient {
                return Err((before, error));
            }

            let policy = *cached_policy.get_or_insert_with(|| self.retry_policy(&before));
            state = before;
            let step_id = error
                .step_instance_id
                .clone()
                .or_else(|| state.current_step_instance_id.clone())
                .unwrap_or_default();
            let attempt = state.attempt_number(&step_id);
            if attempt >= policy.max_attempts {
                tracing::warn!(
                    flow_execution_id = %state.flow_execution_id,
                    step_instance_id = %step_id,
                    attempts = attempt,
                    error = %error.message,
                    "transient retries exhausted"
                );
                let fallback = state.clone();
                return self
                    .processor
                    .apply_error_handler(state, error)
                    .map_err(|error| (fallback, error));
            }
            let retry = state.record_retry(&step_id);
            let delay = policy.delay(retry);
            tracing::warn!(
                flow_execution_id = %state.flow_execution_id,
                step_instance_id = %step_id,
                retry,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error.message,
                "transient step failure, retrying"
            );
            self.sleeper.sleep(delay);
        }
    }

    fn run_fork(&self, parent: &FlowRuntimeState) -> Vec<BranchOutcome> {
        let Some(plan) = parent.internal.pending_fork.as_ref() else {
            return Vec::new();
        };
        let limit = plan
            .max_concurrency
            .unwrap_or(self.settings.max_branch_concurrency)
            .max(1);

        let mut outcomes = Vec::with_capacity(plan.branches.len());
        for chunk in plan.branches.chunks(limit) {
            std::thread::scope(|scope| {
                let handles: Vec<_> = chunk
                    .iter()
                    .map(|spec| (spec, scope.spawn(move || self.run_branch(parent, plan, spec))))
                    .collect();
                for (spec, handle) in handles {
                    outcomes.push(handle.join().unwrap_or_else(|_| {
                        BranchOutcome::failed(spec, &StepError::permanent("branch thread panicked"))
                    }));
                }
            });
        }
        outcomes
    }

    fn run_branch(
        &self,
        parent: &FlowRuntimeState,
        plan: &ForkPlan,
        spec: &BranchSpec,
    ) -> BranchOutcome {
        let state = build_branch_state(parent, plan, spec);
        tracing::debug!(
            flow_execution_id = %state.flow_execution_id,
            branch_id = %spec.branch_id,
            start = %spec.start_step_instance_id,
            "branch started"
        );
        match self.run_until_pause(ProcessorOutput::new(state, SfnAction::ProcessStep)) {
            Pause::Finished(state) => BranchOutcome::succeeded(spec, branch_result(&state)),
            Pause::Failed(_, error) => BranchOutcome::failed(spec, &error),
            Pause::Waiting(state) => {
                let step_id = state
                    .internal
                    .pending_wait
                    .as_ref()
                    .map(|wait| wait.step_instance_id.clone())
                    .unwrap_or_default();
                let error = StepError::permanent(
                    "waiting for an external event inside a parallel branch is not supported",
                )
                .in_step(&step_id);
                BranchOutcome::failed(spec, &error)
            }
        }
    }
}
