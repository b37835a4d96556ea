use super::error::StepError;
use super::mapping::FLOW_RUNTIME_KEY;
use super::state::{FlowRuntimeState, FlowStatus, FlowTriggerInput, RuntimeInternal};
use crate::definition::DefinitionStore;
use crate::execution_log::{ExecutionLogger, ExecutionMetadataRecord};
use crate::shared::{new_flow_execution_id, now_rfc3339};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const FLOW_VARIABLES_KEY: &str = "flow_variables";

/// Builds the first [`FlowRuntimeState`] of a run and writes its metadata
/// record.
pub struct FlowInitializer {
    definitions: Arc<dyn DefinitionStore>,
    logger: ExecutionLogger,
}

impl FlowInitializer {
    pub fn new(definitions: Arc<dyn DefinitionStore>, logger: ExecutionLogger) -> Self {
        Self {
            definitions,
            logger,
        }
    }

    pub fn initialize(&self, mut trigger: FlowTriggerInput) -> Result<FlowRuntimeState, StepError> {
        let flow_execution_id = trigger
            .flow_execution_id
            .get_or_insert_with(new_flow_execution_id)
            .clone();
        let start_from_state = trigger
            .execution_overrides
            .as_mut()
            .and_then(|overrides| overrides.start_from_state.take());

        let state = match start_from_state {
            Some(state) => self.from_supplied_state(&trigger, flow_execution_id, *state),
            None => self.from_definition(&trigger, flow_execution_id)?,
        };
        tracing::info!(
            flow_execution_id = %state.flow_execution_id,
            flow_definition_id = %state.flow_definition_id,
            flow_definition_version = state.flow_definition_version,
            start_step = state.current_step_instance_id.as_deref().unwrap_or(""),
            stateful_redrive = state.internal.is_stateful_redrive,
            "flow initialized"
        );

        if state.logs_enabled() {
            let initial_input_payload =
                serde_json::to_value(&trigger).unwrap_or(Value::Object(Map::new()));
            self.logger.create_metadata_record(&ExecutionMetadataRecord {
                flow_execution_id: state.flow_execution_id.clone(),
                flow_definition_id: state.flow_definition_id.clone(),
                flow_definition_version: state.flow_definition_version,
                status: FlowStatus::Running,
                start_time: state.start_time.clone(),
                end_time: None,
                initial_input_payload,
                trigger_source: trigger.trigger_source.clone(),
                enable_execution_logs: state.enable_execution_logs,
                redrive_of_flow_execution_id: trigger
                    .redrive_of_flow_execution_id
                    .clone()
                    .or_else(|| state.internal.original_flow_execution_id.clone()),
                final_context_data_s3_pointer: None,
                error_info: None,
            });
        }
        Ok(state)
    }

    /// A caller-built state bypasses definition-driven bootstrapping.
    fn from_supplied_state(
        &self,
        trigger: &FlowTriggerInput,
        flow_execution_id: String,
        mut state: FlowRuntimeState,
    ) -> FlowRuntimeState {
        let original = state.flow_execution_id.clone();
        state.flow_execution_id = flow_execution_id;
        state.status = FlowStatus::Running;
        state.start_time = now_rfc3339();
        state.error_info = None;
        state.execution_overrides = None;
        state.current_context_data.remove(FLOW_RUNTIME_KEY);
        state.internal = RuntimeInternal {
            sandbox_mode: state.internal.sandbox_mode,
            is_stateful_redrive: true,
            original_flow_execution_id: state
                .internal
                .original_flow_execution_id
                .take()
                .or(Some(original)),
            ..RuntimeInternal::default()
        };
        if let Some(enabled) = trigger.enable_execution_logs {
            state.enable_execution_logs = enabled;
        }
        state
    }

    fn from_definition(
        &self,
        trigger: &FlowTriggerInput,
        flow_execution_id: String,
    ) -> Result<FlowRuntimeState, StepError> {
        let flow = self
            .definitions
            .load_flow_definition(&trigger.flow_definition_id, trigger.flow_version)?;

        let start_step = trigger
            .execution_overrides
            .as_ref()
            .and_then(|overrides| overrides.start_step_instance_id.clone())
            .unwrap_or_else(|| flow.start_step_instance_id.clone());
        flow.step(&start_step)
            .map_err(|err| StepError::from(err).in_step(&start_step))?;

        let mut context = trigger.initial_context_data.clone();
        if !flow.flow_variables.is_empty() && !context.contains_key(FLOW_VARIABLES_KEY) {
            context.insert(
                FLOW_VARIABLES_KEY.to_string(),
                Value::Object(flow.flow_variables.clone()),
            );
        }

        Ok(FlowRuntimeState {
            flow_execution_id,
            flow_definition_id: flow.id.clone(),
            flow_definition_version: flow.version,
            current_step_instance_id: Some(start_step),
            status: FlowStatus::Running,
            start_time: now_rfc3339(),
            current_context_data: context,
            step_retry_attempts: BTreeMap::new(),
            internal: RuntimeInternal::default(),
            execution_overrides: trigger.execution_overrides.clone(),
            enable_execution_logs: trigger
                .enable_execution_logs
                .unwrap_or(flow.enable_execution_logs),
            error_info: None,
        })
    }
}
