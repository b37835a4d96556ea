use super::email::{EmailHandler, EmailTransport};
use super::{
    api_call::ApiCallHandler, bom_extract::BomExtractHandler, compose_object::ComposeObjectHandler,
    data_join::DataJoinHandler, data_load::DataLoadHandler, llm_invocation::LlmInvocationHandler,
    no_op::NoOpHandler, parallel_fork::ParallelForkHandler, sub_flow::SubFlowHandler,
    wait_for_event::WaitForEventHandler,
};
use crate::definition::{DefinitionStore, ResolvedStep, StepPayload, StepType};
use crate::orchestration::branch::ForkPlan;
use crate::orchestration::error::StepError;
use crate::orchestration::starter::FlowStarter;
use crate::orchestration::state::FlowRuntimeState;
use crate::provider::LlmAdapterFactory;
use crate::shared::{normalize_module_identifier, HttpClient};
use crate::storage::PayloadOffloader;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitRequest {
    pub correlation_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

/// Flow control a handler can ask of the processor in place of a plain
/// transition.
#[derive(Debug, Clone, PartialEq)]
pub enum StepControl {
    Wait(WaitRequest),
    Fork(ForkPlan),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepHandlerOutput {
    pub output_data: Value,
    pub meta: Option<Value>,
    pub control: Option<StepControl>,
}

impl StepHandlerOutput {
    pub fn data(output_data: Value) -> Self {
        Self {
            output_data,
            meta: None,
            control: None,
        }
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn with_control(mut self, control: StepControl) -> Self {
        self.control = Some(control);
        self
    }
}

pub trait StepHandler: Send + Sync {
    fn handle(
        &self,
        step: &ResolvedStep,
        input: &Map<String, Value>,
        state: &FlowRuntimeState,
    ) -> Result<StepHandlerOutput, StepError>;
}

/// Collaborators the built-in handlers need.
#[derive(Clone)]
pub struct HandlerDependencies {
    pub definitions: Arc<dyn DefinitionStore>,
    pub adapters: Arc<LlmAdapterFactory>,
    pub http: Arc<dyn HttpClient>,
    pub offloader: Option<Arc<PayloadOffloader>>,
    pub email_transport: Arc<dyn EmailTransport>,
    pub flow_starter: Arc<dyn FlowStarter>,
    pub max_attachment_bytes: usize,
}

/// One handler per step type plus a module table for module-dispatched
/// types. Every step type has a field, so a missing handler cannot compile.
pub struct StepHandlerRegistry {
    no_op: Arc<dyn StepHandler>,
    llm_invocation: Arc<dyn StepHandler>,
    data_load: Arc<dyn StepHandler>,
    api_call: Arc<dyn StepHandler>,
    email: Arc<dyn StepHandler>,
    start_sub_flow: Arc<dyn StepHandler>,
    parallel_fork: Arc<dyn StepHandler>,
    wait_for_event: Arc<dyn StepHandler>,
    modules: BTreeMap<String, Arc<dyn StepHandler>>,
}

impl StepHandlerRegistry {
    pub fn with_builtins(deps: HandlerDependencies) -> Self {
        let mut registry = Self {
            no_op: Arc::new(NoOpHandler),
            llm_invocation: Arc::new(LlmInvocationHandler::new(
                Arc::clone(&deps.definitions),
                Arc::clone(&deps.adapters),
            )),
            data_load: Arc::new(DataLoadHandler::new(deps.offloader.clone())),
            api_call: Arc::new(ApiCallHandler::new(Arc::clone(&deps.http))),
            email: Arc::new(EmailHandler::new(
                Arc::clone(&deps.email_transport),
                deps.offloader.clone(),
                deps.max_attachment_bytes,
            )),
            start_sub_flow: Arc::new(SubFlowHandler::new(Arc::clone(&deps.flow_starter))),
            parallel_fork: Arc::new(ParallelForkHandler),
            wait_for_event: Arc::new(WaitForEventHandler),
            modules: BTreeMap::new(),
        };
        registry.register_module("system/data-join", Arc::new(DataJoinHandler));
        registry.register_module("system/compose-object", Arc::new(ComposeObjectHandler));
        registry.register_module("system/bom-extract", Arc::new(BomExtractHandler));
        registry
    }

    pub fn register_module(&mut self, module_identifier: &str, handler: Arc<dyn StepHandler>) {
        self.modules
            .insert(normalize_module_identifier(module_identifier), handler);
    }

    /// Swaps the handler for a non-module step type.
    pub fn replace_handler(
        &mut self,
        step_type: StepType,
        handler: Arc<dyn StepHandler>,
    ) -> Result<(), StepError> {
        let slot = match step_type {
            StepType::NoOp => &mut self.no_op,
            StepType::LlmInvocation => &mut self.llm_invocation,
            StepType::DataLoad => &mut self.data_load,
            StepType::ApiCall => &mut self.api_call,
            StepType::Email => &mut self.email,
            StepType::StartSubFlow => &mut self.start_sub_flow,
            StepType::ParallelForkManager => &mut self.parallel_fork,
            StepType::WaitForExternalEvent => &mut self.wait_for_event,
            StepType::DataTransformation | StepType::CustomLogic => {
                return Err(StepError::permanent(format!(
                    "{step_type} handlers are registered per module identifier"
                )))
            }
        };
        *slot = handler;
        Ok(())
    }

    pub fn handler_for(&self, step: &ResolvedStep) -> Result<Arc<dyn StepHandler>, StepError> {
        let handler = match &step.payload {
            StepPayload::NoOp => &self.no_op,
            StepPayload::LlmInvocation(_) => &self.llm_invocation,
            StepPayload::DataLoad => &self.data_load,
            StepPayload::ApiCall(_) => &self.api_call,
            StepPayload::Email(_) => &self.email,
            StepPayload::StartSubFlow(_) => &self.start_sub_flow,
            StepPayload::ParallelForkManager(_) => &self.parallel_fork,
            StepPayload::WaitForExternalEvent(_) => &self.wait_for_event,
            StepPayload::DataTransformation(config) | StepPayload::CustomLogic(config) => {
                let key = normalize_module_identifier(&config.module_identifier);
                return self.modules.get(&key).cloned().ok_or_else(|| {
                    StepError::permanent(format!(
                        "no handler registered for module `{}`",
                        config.module_identifier
                    ))
                    .in_step(&step.step_instance_id)
                });
            }
        };
        Ok(Arc::clone(handler))
    }

    pub fn dispatch(
        &self,
        step: &ResolvedStep,
        input: &Map<String, Value>,
        state: &FlowRuntimeState,
    ) -> Result<StepHandlerOutput, StepError> {
        self.handler_for(step)?
            .handle(step, input, state)
            .map_err(|err| err.in_step(&step.step_instance_id))
    }
}
