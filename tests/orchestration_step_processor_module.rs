use allma::config::ProviderSettings;
use allma::definition::{
    DefinitionVersion, FlowDefinition, InMemoryDefinitionStore, ResolvedStep, StepType,
};
use allma::execution_log::ExecutionLogger;
use allma::handlers::{
    HandlerDependencies, OutboxEmailTransport, StepHandler, StepHandlerOutput, StepHandlerRegistry,
};
use allma::orchestration::{
    ConditionEvaluator, ErrorKind, FlowInitializer, FlowRuntimeState, FlowTriggerInput,
    ProcessorInput, QueuedFlowStarter, SfnAction, StepError, StepProcessor,
};
use allma::provider::LlmAdapterFactory;
use allma::shared::{HttpClient, HttpError, HttpRequest, HttpResponse};
use allma::storage::{InMemoryBlobStore, PayloadOffloader};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

struct OfflineHttp;

impl HttpClient for OfflineHttp {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, HttpError> {
        Err(HttpError::Transport {
            url: request.url.clone(),
            reason: "offline".to_string(),
        })
    }
}

/// Fails with a content error until it has been called `succeed_on` times.
struct FlakyScore {
    calls: AtomicU32,
    succeed_on: u32,
}

impl StepHandler for FlakyScore {
    fn handle(
        &self,
        _step: &ResolvedStep,
        input: &Map<String, Value>,
        _state: &FlowRuntimeState,
    ) -> Result<StepHandlerOutput, StepError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call < self.succeed_on {
            return Err(StepError::content_retryable("score missing"));
        }
        Ok(StepHandlerOutput::data(json!({"score": input.get("value").cloned()})))
    }
}

struct Tagged;

impl StepHandler for Tagged {
    fn handle(
        &self,
        step: &ResolvedStep,
        _input: &Map<String, Value>,
        _state: &FlowRuntimeState,
    ) -> Result<StepHandlerOutput, StepError> {
        Ok(StepHandlerOutput::data(json!({"visited": step.step_instance_id})))
    }
}

/// Returns a score padded well past a small offload threshold.
struct PaddedScore;

impl StepHandler for PaddedScore {
    fn handle(
        &self,
        _step: &ResolvedStep,
        _input: &Map<String, Value>,
        _state: &FlowRuntimeState,
    ) -> Result<StepHandlerOutput, StepError> {
        Ok(StepHandlerOutput::data(json!({"score": 10, "pad": "x".repeat(500)})))
    }
}

struct OnlyNamed(&'static str);

impl ConditionEvaluator for OnlyNamed {
    fn evaluate(&self, condition: &str, _context: &Value) -> Result<bool, StepError> {
        Ok(condition == self.0)
    }
}

struct Setup {
    definitions: Arc<InMemoryDefinitionStore>,
    registry: StepHandlerRegistry,
    _outbox: TempDir,
}

fn scoring_flow() -> Value {
    json!({
        "id": "scoring",
        "version": 1,
        "isPublished": true,
        "startStepInstanceId": "score",
        "steps": {
            "score": {
                "stepInstanceId": "score",
                "stepType": "DATA_TRANSFORMATION",
                "moduleIdentifier": "acme/score",
                "inputMappings": {"value": "$.value"},
                "transitions": [
                    {"condition": "first", "nextStepInstanceId": "high"},
                    {"condition": "second", "nextStepInstanceId": "low"}
                ]
            },
            "high": {"stepInstanceId": "high", "stepType": "NO_OP"},
            "low": {"stepInstanceId": "low", "stepType": "NO_OP"}
        }
    })
}

fn routing_flow() -> Value {
    json!({
        "id": "routing",
        "version": 1,
        "isPublished": true,
        "startStepInstanceId": "measure",
        "steps": {
            "measure": {
                "stepInstanceId": "measure",
                "stepType": "DATA_TRANSFORMATION",
                "moduleIdentifier": "acme/measure",
                "transitions": [
                    {
                        "condition": "$.steps_output.measure.score > 5",
                        "nextStepInstanceId": "fanout"
                    }
                ],
                "defaultNextStepInstanceId": "low"
            },
            "fanout": {
                "stepInstanceId": "fanout",
                "stepType": "PARALLEL_FORK_MANAGER",
                "parallelBranches": [
                    {
                        "branchId": "big",
                        "stepInstanceId": "high",
                        "condition": "$.steps_output.measure.score > 5"
                    },
                    {
                        "branchId": "small",
                        "stepInstanceId": "low",
                        "condition": "$.steps_output.measure.score <= 5"
                    }
                ]
            },
            "high": {"stepInstanceId": "high", "stepType": "NO_OP"},
            "low": {"stepInstanceId": "low", "stepType": "NO_OP"}
        }
    })
}

fn setup() -> Setup {
    setup_with(scoring_flow())
}

fn setup_with(flow: Value) -> Setup {
    let flow: FlowDefinition = serde_json::from_value(flow).expect("flow json");
    let definitions = Arc::new(InMemoryDefinitionStore::new().with_flow(flow).expect("flow"));
    let http: Arc<dyn HttpClient> = Arc::new(OfflineHttp);
    let outbox = tempdir().expect("tempdir");
    let registry = StepHandlerRegistry::with_builtins(HandlerDependencies {
        definitions: definitions.clone(),
        adapters: Arc::new(LlmAdapterFactory::new(ProviderSettings::default(), http.clone())),
        http,
        offloader: None,
        email_transport: Arc::new(OutboxEmailTransport::new(outbox.path())),
        flow_starter: Arc::new(QueuedFlowStarter::new()),
        max_attachment_bytes: 1024,
    });
    Setup {
        definitions,
        registry,
        _outbox: outbox,
    }
}

fn initial_state(definitions: &Arc<InMemoryDefinitionStore>) -> FlowRuntimeState {
    start_state(definitions, "scoring")
}

fn start_state(definitions: &Arc<InMemoryDefinitionStore>, flow_id: &str) -> FlowRuntimeState {
    let mut context = Map::new();
    context.insert("value".to_string(), json!(0.4));
    let trigger =
        FlowTriggerInput::new(flow_id, DefinitionVersion::Number(1)).with_context(context);
    FlowInitializer::new(definitions.clone(), ExecutionLogger::disabled())
        .initialize(trigger)
        .expect("initialize")
}

fn step(state: FlowRuntimeState) -> ProcessorInput {
    ProcessorInput {
        runtime_state: state,
        sfn_action: SfnAction::ProcessStep,
    }
}

#[test]
fn step_processor_module_uses_registered_modules_and_injected_evaluator() {
    let mut setup = setup();
    setup.registry.register_module(
        "Acme_Score",
        Arc::new(FlakyScore {
            calls: AtomicU32::new(0),
            succeed_on: 1,
        }),
    );
    setup
        .registry
        .replace_handler(StepType::NoOp, Arc::new(Tagged))
        .expect("replace no-op");
    let processor = StepProcessor::new(setup.definitions.clone(), Arc::new(setup.registry))
        .with_condition_evaluator(Arc::new(OnlyNamed("second")));

    let output = processor
        .process(step(initial_state(&setup.definitions)))
        .expect("score step");
    assert_eq!(output.sfn_action, SfnAction::ProcessStep);
    assert_eq!(output.runtime_state.current_step_instance_id.as_deref(), Some("low"));
    assert_eq!(
        output.runtime_state.current_context_data["steps_output"]["score"],
        json!({"score": 0.4})
    );

    let output = processor.process(step(output.runtime_state)).expect("low step");
    assert_eq!(output.sfn_action, SfnAction::Finalize);
    assert_eq!(
        output.runtime_state.current_context_data["steps_output"]["low"],
        json!({"visited": "low"})
    );
}

#[test]
fn step_processor_module_content_retries_are_bounded_by_configured_attempts() {
    let mut setup = setup();
    setup.registry.register_module(
        "acme/score",
        Arc::new(FlakyScore {
            calls: AtomicU32::new(0),
            succeed_on: 10,
        }),
    );
    let processor = StepProcessor::new(setup.definitions.clone(), Arc::new(setup.registry))
        .with_content_retry_attempts(2);

    let retried = processor
        .process(step(initial_state(&setup.definitions)))
        .expect("first attempt is retried in state");
    assert_eq!(retried.sfn_action, SfnAction::ProcessStep);
    assert_eq!(retried.runtime_state.current_step_instance_id.as_deref(), Some("score"));
    assert_eq!(retried.runtime_state.retry_attempts("score"), 1);

    let error = processor
        .process(step(retried.runtime_state))
        .expect_err("second attempt exhausts retries");
    assert_eq!(error.kind, ErrorKind::ContentRetryable);
    assert_eq!(error.step_instance_id.as_deref(), Some("score"));
}

#[test]
fn step_processor_module_module_step_types_cannot_be_replaced_wholesale() {
    let mut setup = setup();
    let error = setup
        .registry
        .replace_handler(StepType::DataTransformation, Arc::new(Tagged))
        .expect_err("module dispatched");
    assert_eq!(error.kind, ErrorKind::Permanent);
}

#[test]
fn step_processor_module_conditions_read_through_offloaded_outputs() {
    let mut setup = setup_with(routing_flow());
    setup.registry.register_module("acme/measure", Arc::new(PaddedScore));
    let blobs = Arc::new(InMemoryBlobStore::new());
    let offloader = Arc::new(PayloadOffloader::new(blobs.clone(), "traces").with_threshold(100));
    let processor = StepProcessor::new(setup.definitions.clone(), Arc::new(setup.registry))
        .with_offloader(offloader);

    let measured = processor
        .process(step(start_state(&setup.definitions, "routing")))
        .expect("measure step");
    let stored = &measured.runtime_state.current_context_data["steps_output"]["measure"];
    assert!(stored.get("_s3_output_pointer").is_some(), "output was offloaded: {stored}");
    assert_eq!(blobs.put_count(), 1);
    assert_eq!(measured.sfn_action, SfnAction::ProcessStep);
    assert_eq!(
        measured.runtime_state.current_step_instance_id.as_deref(),
        Some("fanout")
    );

    let forked = processor.process(step(measured.runtime_state)).expect("fork step");
    assert_eq!(forked.sfn_action, SfnAction::Fork);
    let plan = forked
        .runtime_state
        .internal
        .pending_fork
        .as_ref()
        .expect("pending fork");
    let branches: Vec<&str> = plan.branches.iter().map(|b| b.branch_id.as_str()).collect();
    assert_eq!(branches, vec!["big"]);
}
