use super::branch::{aggregate, BranchOutcome, ForkPlan};
use super::conditions::{ConditionEvaluator, JsonPathConditionEvaluator};
use super::delay::{Sleeper, ThreadSleeper};
use super::error::{ErrorKind, StepError};
use super::json_path::set_in_map;
use super::mapping::{apply_output_mappings, build_mapping_context, build_step_input, MappingEvent};
use super::state::{FlowRuntimeState, PendingWait, ProcessorInput, ProcessorOutput, SfnAction};
use super::transitions::{resolve_next_step, NextStep};
use crate::definition::{
    DefinitionStore, DefinitionVersion, DelayPosition, FlowDefinition, ResolvedStep,
};
use crate::execution_log::{ExecutionLogger, FullStepRecord, StepEventStatus, StepExecutionRecord};
use crate::handlers::{StepControl, StepHandlerOutput, StepHandlerRegistry, WaitRequest};
use crate::hydration::DefinitionHydrator;
use crate::shared::now_rfc3339;
use crate::storage::PayloadOffloader;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// In-state attempts for content-retryable failures when the step sets no
/// `onError.retries`.
pub const DEFAULT_CONTENT_RETRY_ATTEMPTS: u32 = 3;

pub const STEPS_OUTPUT_KEY: &str = "steps_output";

/// What happened inside one processor invocation, for sandbox and debugging.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepTrace {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping_context: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mapping_events: Vec<MappingEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapped_input: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler_output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

struct StepRun<'a> {
    step: &'a ResolvedStep,
    attempt: u32,
    started: Instant,
}

/// Advances a [`FlowRuntimeState`] by exactly one step per call. Holds no
/// per-flow state between calls.
pub struct StepProcessor {
    definitions: Arc<dyn DefinitionStore>,
    hydrator: DefinitionHydrator,
    registry: Arc<StepHandlerRegistry>,
    evaluator: Arc<dyn ConditionEvaluator>,
    offloader: Option<Arc<PayloadOffloader>>,
    logger: ExecutionLogger,
    sleeper: Arc<dyn Sleeper>,
    content_retry_attempts: u32,
}

impl StepProcessor {
    pub fn new(definitions: Arc<dyn DefinitionStore>, registry: Arc<StepHandlerRegistry>) -> Self {
        Self {
            hydrator: DefinitionHydrator::new(Arc::clone(&definitions)),
            definitions,
            registry,
            evaluator: Arc::new(JsonPathConditionEvaluator),
            offloader: None,
            logger: ExecutionLogger::disabled(),
            sleeper: Arc::new(ThreadSleeper),
            content_retry_attempts: DEFAULT_CONTENT_RETRY_ATTEMPTS,
        }
    }

    pub fn with_condition_evaluator(mut self, evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_offloader(mut self, offloader: Arc<PayloadOffloader>) -> Self {
        self.offloader = Some(offloader);
        self
    }

    pub fn with_logger(mut self, logger: ExecutionLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_content_retry_attempts(mut self, attempts: u32) -> Self {
        self.content_retry_attempts = attempts.max(1);
        self
    }

    pub fn definitions(&self) -> &Arc<dyn DefinitionStore> {
        &self.definitions
    }

    pub fn offloader(&self) -> Option<&Arc<PayloadOffloader>> {
        self.offloader.as_ref()
    }

    pub fn logger(&self) -> &ExecutionLogger {
        &self.logger
    }

    pub fn process(&self, input: ProcessorInput) -> Result<ProcessorOutput, StepError> {
        self.process_traced(input).0
    }

    /// Like [`Self::process`] but also returns the mapping events, mapped
    /// input and raw handler result of the step that ran.
    pub fn process_traced(
        &self,
        input: ProcessorInput,
    ) -> (Result<ProcessorOutput, StepError>, StepTrace) {
        let mut trace = StepTrace::default();
        let ProcessorInput {
            runtime_state: state,
            sfn_action,
        } = input;

        if sfn_action != SfnAction::ProcessStep {
            return (Ok(ProcessorOutput::new(state, sfn_action)), trace);
        }
        if state.status.is_terminal() || state.current_step_instance_id.is_none() {
            return (Ok(ProcessorOutput::new(state, SfnAction::Finalize)), trace);
        }
        let result = self.process_step(state, &mut trace);
        (result, trace)
    }

    fn load_flow(&self, state: &FlowRuntimeState) -> Result<FlowDefinition, StepError> {
        Ok(self.definitions.load_flow_definition(
            &state.flow_definition_id,
            DefinitionVersion::Number(state.flow_definition_version),
        )?)
    }

    /// Loads and hydrates one step of the state's flow version.
    pub fn resolve_step(
        &self,
        state: &FlowRuntimeState,
        step_instance_id: &str,
    ) -> Result<ResolvedStep, StepError> {
        let flow = self.load_flow(state)?;
        let instance = flow
            .step(step_instance_id)
            .map_err(|err| StepError::from(err).in_step(step_instance_id))?;
        self.hydrator.hydrate(instance)
    }

    fn process_step(
        &self,
        state: FlowRuntimeState,
        trace: &mut StepTrace,
    ) -> Result<ProcessorOutput, StepError> {
        let Some(step_id) = state.current_step_instance_id.clone() else {
            return Ok(ProcessorOutput::new(state, SfnAction::Finalize));
        };
        trace.step_instance_id = Some(step_id.clone());
        let step = self.resolve_step(&state, &step_id)?;
        let run = StepRun {
            step: &step,
            attempt: state.attempt_number(&step_id),
            started: Instant::now(),
        };

        let mapping_context = build_mapping_context(&state);
        trace.mapping_context = Some(mapping_context.clone());
        tracing::info!(
            flow_execution_id = %state.flow_execution_id,
            step_instance_id = %step_id,
            step_type = %step.step_type(),
            attempt = run.attempt,
            branch_id = state.branch_id().unwrap_or(""),
            "processing step"
        );
        self.log_event(&state, &run, StepEventStatus::Started, |record| {
            record.input_mapping_context = mapping_context.clone();
        });

        let handled = self.run_handler(&state, &step, &mapping_context, trace);
        match handled {
            Ok(output) => self.on_success(state, &run, output, trace),
            Err(error) => {
                let error = error.in_step(&step_id);
                self.log_event(&state, &run, StepEventStatus::Failed, |record| {
                    record.summary.error_info = Some(error.error_info());
                    record.input_mapping_result = trace.mapped_input.clone().map(Value::Object);
                });
                self.on_failure(state, &step, run.attempt, error)
            }
        }
    }

    fn run_handler(
        &self,
        state: &FlowRuntimeState,
        step: &ResolvedStep,
        mapping_context: &Value,
        trace: &mut StepTrace,
    ) -> Result<StepHandlerOutput, StepError> {
        let mapped = build_step_input(&step.base, mapping_context, self.offloader.as_deref())?;
        trace.mapping_events = mapped.events;
        trace.mapped_input = Some(mapped.input.clone());

        self.delay(state, step, DelayPosition::Before);
        let output = self.registry.dispatch(step, &mapped.input, state)?;
        trace.handler_output = Some(output.output_data.clone());
        trace.meta = output.meta.clone();
        Ok(output)
    }

    fn delay(&self, state: &FlowRuntimeState, step: &ResolvedStep, position: DelayPosition) {
        if state.is_sandbox() {
            return;
        }
        if let Some(delay) = step.delay.filter(|delay| delay.position == position) {
            if delay.milliseconds > 0 {
                self.sleeper.sleep(Duration::from_millis(delay.milliseconds));
            }
        }
    }

    fn on_success(
        &self,
        mut state: FlowRuntimeState,
        run: &StepRun<'_>,
        output: StepHandlerOutput,
        trace: &mut StepTrace,
    ) -> Result<ProcessorOutput, StepError> {
        let step = run.step;
        let StepHandlerOutput {
            output_data,
            meta,
            control,
        } = output;

        let stored = self.store_step_output(&mut state, step, run.attempt, &output_data)?;
        let events = apply_output_mappings(
            &step.base.output_mappings,
            &output_data,
            &mut state.current_context_data,
            self.offloader.as_deref(),
        )
        .map_err(|err| err.in_step(&step.step_instance_id))?;
        trace.mapping_events.extend(events);
        state.internal.last_handler_result = Some(stored.clone());
        state.step_retry_attempts.remove(&step.step_instance_id);
        if let Some(branch) = state.internal.branch.as_mut() {
            branch.last_step_instance_id = Some(step.step_instance_id.clone());
        }

        match control {
            Some(StepControl::Wait(request)) => {
                self.log_event(&state, run, StepEventStatus::Waiting, |record| {
                    record.summary.output_data = Some(output_data.clone());
                    record.meta = meta.clone();
                });
                Ok(self.suspend(state, step, request))
            }
            Some(StepControl::Fork(plan)) => {
                let plan = self.filter_branches(&state, plan)?;
                self.log_event(&state, run, StepEventStatus::Forked, |record| {
                    record.summary.output_data = Some(output_data.clone());
                    record.meta = meta.clone();
                });
                tracing::info!(
                    flow_execution_id = %state.flow_execution_id,
                    step_instance_id = %step.step_instance_id,
                    branches = plan.branches.len(),
                    "forking"
                );
                state.internal.pending_fork = Some(plan);
                Ok(ProcessorOutput::new(state, SfnAction::Fork))
            }
            None => {
                self.delay(&state, step, DelayPosition::After);
                self.log_event(&state, run, StepEventStatus::Completed, |record| {
                    record.summary.output_data = Some(output_data.clone());
                    record.input_mapping_result = trace.mapped_input.clone().map(Value::Object);
                    record.meta = meta.clone();
                });
                self.advance(state, step)
            }
        }
    }

    /// Writes the handler output at `steps_output.<stepInstanceId>`, offloading
    /// it when large unless the step or sandbox mode forbids writes.
    fn store_step_output(
        &self,
        state: &mut FlowRuntimeState,
        step: &ResolvedStep,
        attempt: u32,
        output: &Value,
    ) -> Result<Value, StepError> {
        let stored = match &self.offloader {
            Some(offloader) if !step.disable_s3_offload && !state.is_sandbox() => {
                let mut prefix = format!(
                    "flow_executions/{}/steps_output/{}",
                    state.flow_execution_id, step.step_instance_id
                );
                if let Some(branch_id) = state.branch_id() {
                    prefix.push('/');
                    prefix.push_str(branch_id);
                }
                prefix.push_str(&format!("/{attempt}"));
                offloader
                    .offload_if_large(output.clone(), &prefix)
                    .map_err(|err| StepError::from(err).in_step(&step.step_instance_id))?
            }
            _ => output.clone(),
        };
        set_in_map(
            &mut state.current_context_data,
            &format!("{STEPS_OUTPUT_KEY}.{}", step.step_instance_id),
            stored.clone(),
        )
        .map_err(|err| StepError::permanent(err.to_string()).in_step(&step.step_instance_id))?;
        Ok(stored)
    }

    fn suspend(
        &self,
        mut state: FlowRuntimeState,
        step: &ResolvedStep,
        request: WaitRequest,
    ) -> ProcessorOutput {
        tracing::info!(
            flow_execution_id = %state.flow_execution_id,
            step_instance_id = %step.step_instance_id,
            correlation_key = %request.correlation_key,
            "waiting for external event"
        );
        state.internal.pending_wait = Some(PendingWait {
            correlation_key: request.correlation_key,
            token: uuid::Uuid::new_v4().to_string(),
            step_instance_id: step.step_instance_id.clone(),
            requested_at: now_rfc3339(),
            timeout_seconds: request.timeout_seconds,
        });
        ProcessorOutput::new(state, SfnAction::Wait)
    }

    /// Drops branches whose condition is false for the context the branch
    /// would start with.
    fn filter_branches(
        &self,
        state: &FlowRuntimeState,
        mut plan: ForkPlan,
    ) -> Result<ForkPlan, StepError> {
        let base = build_mapping_context(state);
        let mut kept = Vec::with_capacity(plan.branches.len());
        for spec in plan.branches {
            let Some(condition) = spec.condition.as_deref() else {
                kept.push(spec);
                continue;
            };
            let mut context = base.clone();
            if let (Some(item), Value::Object(object)) = (&spec.item, &mut context) {
                object.insert(plan.item_variable.clone(), item.clone());
            }
            if self
                .evaluator
                .evaluate_resolving(condition, &context, self.offloader.as_deref())?
            {
                kept.push(spec);
            } else {
                tracing::debug!(branch_id = %spec.branch_id, condition, "branch skipped");
            }
        }
        plan.branches = kept;
        Ok(plan)
    }

    /// Resolves the step's transitions against the updated context.
    fn advance(
        &self,
        mut state: FlowRuntimeState,
        step: &ResolvedStep,
    ) -> Result<ProcessorOutput, StepError> {
        let context = build_mapping_context(&state);
        let next = resolve_next_step(
            &step.transitions,
            step.default_next_step_instance_id.as_deref(),
            &context,
            self.evaluator.as_ref(),
            self.offloader.as_deref(),
        )
        .map_err(|err| err.in_step(&step.step_instance_id))?;
        match next {
            NextStep::Step(next_id) => {
                state.current_step_instance_id = Some(next_id);
                Ok(ProcessorOutput::new(state, SfnAction::ProcessStep))
            }
            NextStep::Complete => {
                state.current_step_instance_id = None;
                Ok(ProcessorOutput::new(state, SfnAction::Finalize))
            }
        }
    }

    fn on_failure(
        &self,
        mut state: FlowRuntimeState,
        step: &ResolvedStep,
        attempt: u32,
        error: StepError,
    ) -> Result<ProcessorOutput, StepError> {
        match error.kind {
            ErrorKind::Transient => Err(error),
            ErrorKind::ContentRetryable => {
                let max_attempts = step
                    .retry_config()
                    .map(|retries| retries.max_attempts)
                    .unwrap_or(self.content_retry_attempts);
                if attempt < max_attempts {
                    let retries = state.record_retry(&step.step_instance_id);
                    tracing::warn!(
                        flow_execution_id = %state.flow_execution_id,
                        step_instance_id = %step.step_instance_id,
                        attempt,
                        retries,
                        error = %error.message,
                        "content check failed, retrying step"
                    );
                    return Ok(ProcessorOutput::new(state, SfnAction::ProcessStep));
                }
                self.route_failure(state, step, error)
            }
            ErrorKind::Permanent => self.route_failure(state, step, error),
        }
    }

    /// Routes a failure through the current step's `onError` block. Used by
    /// drivers once they have given up retrying a transient error.
    pub fn apply_error_handler(
        &self,
        state: FlowRuntimeState,
        error: StepError,
    ) -> Result<ProcessorOutput, StepError> {
        let step_id = error
            .step_instance_id
            .clone()
            .or_else(|| state.current_step_instance_id.clone());
        let Some(step_id) = step_id else {
            return Err(error);
        };
        let step = match self.resolve_step(&state, &step_id) {
            Ok(step) => step,
            Err(_) => return Err(error),
        };
        self.route_failure(state, &step, error)
    }

    fn route_failure(
        &self,
        mut state: FlowRuntimeState,
        step: &ResolvedStep,
        error: StepError,
    ) -> Result<ProcessorOutput, StepError> {
        let Some(on_error) = step.on_error().filter(|config| config.routes_errors()) else {
            return Err(error);
        };
        let error_path = on_error
            .error_output_path
            .clone()
            .unwrap_or_else(|| format!("{STEPS_OUTPUT_KEY}.{}_error", step.step_instance_id));
        let info = serde_json::to_value(error.error_info()).unwrap_or_else(|_| json!({}));
        set_in_map(&mut state.current_context_data, &error_path, info)
            .map_err(|err| StepError::permanent(err.to_string()).in_step(&step.step_instance_id))?;
        state.step_retry_attempts.remove(&step.step_instance_id);

        tracing::warn!(
            flow_execution_id = %state.flow_execution_id,
            step_instance_id = %step.step_instance_id,
            error_name = error.error_name(),
            error = %error.message,
            error_output_path = %error_path,
            "step failed, taking onError route"
        );
        match &on_error.fallback_step_instance_id {
            Some(fallback) => {
                state.current_step_instance_id = Some(fallback.clone());
                Ok(ProcessorOutput::new(state, SfnAction::ProcessStep))
            }
            None => self.advance(state, step),
        }
    }

    /// Folds the outcomes of every branch of the pending fork into the
    /// context and moves past the fork step.
    pub fn complete_fork(
        &self,
        mut state: FlowRuntimeState,
        outcomes: Vec<BranchOutcome>,
    ) -> Result<ProcessorOutput, StepError> {
        let Some(plan) = state.internal.pending_fork.take() else {
            return Err(StepError::permanent("no fork is pending on this state"));
        };
        let step = self.resolve_step(&state, &plan.fork_step_instance_id)?;
        let run = StepRun {
            step: &step,
            attempt: state.attempt_number(&step.step_instance_id),
            started: Instant::now(),
        };

        let aggregated = match aggregate(&plan, outcomes) {
            Ok(value) => value,
            Err(error) => {
                self.log_event(&state, &run, StepEventStatus::Failed, |record| {
                    record.summary.error_info = Some(error.error_info());
                });
                return self.route_failure(state, &step, error);
            }
        };
        set_in_map(&mut state.current_context_data, &plan.output_path(), aggregated.clone())
            .map_err(|err| StepError::permanent(err.to_string()).in_step(&step.step_instance_id))?;
        if let Some(branch) = state.internal.branch.as_mut() {
            branch.last_step_instance_id = Some(step.step_instance_id.clone());
        }
        self.log_event(&state, &run, StepEventStatus::Completed, |record| {
            record.summary.output_data = Some(aggregated.clone());
        });
        self.advance(state, &step)
    }

    /// Resumes a state parked by a WAIT_FOR_EXTERNAL_EVENT step. The event
    /// payload becomes the step's output.
    pub fn resume_after_event(
        &self,
        mut state: FlowRuntimeState,
        payload: Value,
    ) -> Result<ProcessorOutput, StepError> {
        let Some(wait) = state.internal.pending_wait.take() else {
            return Err(StepError::permanent("no external event is awaited by this state"));
        };
        let step = self.resolve_step(&state, &wait.step_instance_id)?;
        let run = StepRun {
            step: &step,
            attempt: state.attempt_number(&step.step_instance_id),
            started: Instant::now(),
        };

        let stored = self.store_step_output(&mut state, &step, run.attempt, &payload)?;
        apply_output_mappings(
            &step.base.output_mappings,
            &payload,
            &mut state.current_context_data,
            self.offloader.as_deref(),
        )
        .map_err(|err| err.in_step(&step.step_instance_id))?;
        state.internal.last_handler_result = Some(stored);
        tracing::info!(
            flow_execution_id = %state.flow_execution_id,
            step_instance_id = %step.step_instance_id,
            correlation_key = %wait.correlation_key,
            "external event received"
        );
        self.log_event(&state, &run, StepEventStatus::Completed, |record| {
            record.summary.output_data = Some(payload.clone());
        });
        self.advance(state, &step)
    }

    fn log_event(
        &self,
        state: &FlowRuntimeState,
        run: &StepRun<'_>,
        status: StepEventStatus,
        fill: impl FnOnce(&mut FullStepRecord),
    ) {
        if !state.logs_enabled() || !self.logger.is_enabled() {
            return;
        }
        let duration_ms = (status != StepEventStatus::Started)
            .then(|| u64::try_from(run.started.elapsed().as_millis()).unwrap_or(u64::MAX));
        let mut record = FullStepRecord {
            summary: StepExecutionRecord {
                flow_execution_id: state.flow_execution_id.clone(),
                step_instance_id: run.step.step_instance_id.clone(),
                step_definition_id: run.step.step_definition_id.clone(),
                step_type: run.step.step_type(),
                attempt_number: run.attempt,
                status,
                event_timestamp: now_rfc3339(),
                duration_ms,
                branch_id: state.branch_id().map(str::to_string),
                error_info: None,
                output_data: None,
                full_record_s3_pointer: None,
            },
            input_mapping_context: Value::Null,
            input_mapping_result: None,
            meta: None,
        };
        fill(&mut record);
        self.logger.log_step_execution(record);
    }
}
