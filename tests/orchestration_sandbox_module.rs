use allma::app::engine::{Engine, EngineParts};
use allma::config::Settings;
use allma::definition::{
    DefinitionVersion, FlowDefinition, InMemoryDefinitionStore, PromptTemplate,
};
use allma::execution_log::InMemoryExecutionLogStore;
use allma::handlers::OutboxEmailTransport;
use allma::orchestration::{
    ErrorKind, FlowTriggerInput, InMemoryContinuationStore, SandboxStepRequest, SfnAction,
};
use allma::shared::{HttpClient, HttpError, HttpRequest, HttpResponse};
use allma::storage::InMemoryBlobStore;
use serde_json::{json, Map, Value};
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

struct Fixture {
    engine: Engine,
    logs: Arc<InMemoryExecutionLogStore>,
    blobs: Arc<InMemoryBlobStore>,
    _outbox: TempDir,
}

fn fixture() -> Fixture {
    let flow: FlowDefinition = serde_json::from_value(json!({
        "id": "support",
        "version": 1,
        "isPublished": true,
        "startStepInstanceId": "classify",
        "steps": {
            "classify": {
                "stepInstanceId": "classify",
                "stepType": "LLM_INVOCATION",
                "llmProvider": "mock",
                "modelId": "mock-model",
                "promptTemplateId": "classify",
                "promptTemplateVersion": 1,
                "jsonOutputMode": true,
                "inputMappings": {"text": "$.ticket.body"},
                "delay": {"milliseconds": 5, "position": "before"},
                "defaultNextStepInstanceId": "escalate"
            },
            "escalate": {
                "stepInstanceId": "escalate",
                "stepType": "START_SUB_FLOW",
                "subFlowDefinitionId": "escalation",
                "subFlowVersion": 1
            }
        }
    }))
    .expect("flow json");
    let prompt = PromptTemplate {
        id: "classify".to_string(),
        version: 1,
        name: "Classify".to_string(),
        content: "Classify this ticket: {{text}}".to_string(),
        is_published: true,
        description: None,
    };
    let definitions = InMemoryDefinitionStore::new()
        .with_prompt(prompt)
        .expect("prompt")
        .with_flow(flow)
        .expect("flow");

    let mut settings = Settings::default();
    settings.offload.threshold_bytes = 16;
    let logs = Arc::new(InMemoryExecutionLogStore::new());
    let blobs = Arc::new(InMemoryBlobStore::new());
    let outbox = tempdir().expect("tempdir");
    let engine = Engine::assemble(
        settings,
        EngineParts {
            definitions: Arc::new(definitions),
            blobs: blobs.clone(),
            log_store: logs.clone(),
            continuations: Arc::new(InMemoryContinuationStore::new()),
            email_transport: Arc::new(OutboxEmailTransport::new(outbox.path())),
            http: Arc::new(OfflineHttp),
        },
    );
    Fixture {
        engine,
        logs,
        blobs,
        _outbox: outbox,
    }
}

fn request(step: &str, context: Value) -> SandboxStepRequest {
    let Value::Object(context) = context else {
        panic!("context must be an object");
    };
    SandboxStepRequest {
        flow_definition_id: "support".to_string(),
        flow_version: DefinitionVersion::Number(1),
        step_instance_id: step.to_string(),
        context,
    }
}

#[test]
fn sandbox_module_runs_one_step_without_side_effects() {
    let fixture = fixture();

    let result = fixture
        .engine
        .sandbox()
        .execute_step(request("classify", json!({"ticket": {"body": "refund please"}})))
        .expect("sandbox");

    assert!(result.succeeded());
    assert_eq!(
        result.rendered_prompt.as_deref(),
        Some("Classify this ticket: refund please")
    );
    let output = result.output.expect("output");
    assert_eq!(output.sfn_action, SfnAction::ProcessStep);
    assert_eq!(
        output.runtime_state.current_step_instance_id.as_deref(),
        Some("escalate")
    );
    assert_eq!(
        output.runtime_state.current_context_data["steps_output"]["classify"],
        json!({"llm_response": {"prompt": "Classify this ticket: refund please"}})
    );
    assert_eq!(
        result.trace.mapped_input,
        Some(Map::from_iter([("text".to_string(), json!("refund please"))]))
    );

    assert_eq!(fixture.logs.write_count(), 0);
    assert_eq!(fixture.blobs.put_count(), 0);
}

#[test]
fn sandbox_module_skips_sub_flow_starts() {
    let fixture = fixture();

    let result = fixture
        .engine
        .sandbox()
        .execute_step(request("escalate", json!({})))
        .expect("sandbox");

    let output = result.output.expect("output");
    assert_eq!(output.sfn_action, SfnAction::Finalize);
    assert_eq!(
        output.runtime_state.current_context_data["steps_output"]["escalate"],
        json!({"subFlowExecutionId": null, "subFlowDefinitionId": "escalation", "skipped": true})
    );
    assert_eq!(fixture.logs.write_count(), 0);
}

#[test]
fn sandbox_module_reports_step_failures_as_error_info() {
    let fixture = fixture();

    let result = fixture
        .engine
        .sandbox()
        .execute_step(request("classify", json!({})))
        .expect("sandbox");

    assert!(!result.succeeded());
    assert!(result.output.is_none());
    let error = result.error_info.expect("error info");
    assert_eq!(error.kind(), Some(ErrorKind::Permanent));
    assert_eq!(error.step_instance_id.as_deref(), Some("classify"));
    assert!(error.error_message.contains("could not be rendered"));
}

#[test]
fn sandbox_module_rejects_unknown_steps() {
    let fixture = fixture();
    let error = fixture
        .engine
        .sandbox()
        .execute_step(request("refund", json!({})))
        .err()
        .expect("unknown step");
    assert_eq!(error.step_instance_id.as_deref(), Some("refund"));
}

#[test]
fn sandbox_module_contrasts_with_a_real_run() {
    let fixture = fixture();
    let mut context = Map::new();
    context.insert("ticket".to_string(), json!({"body": "refund please"}));

    fixture
        .engine
        .run(FlowTriggerInput::new("support", DefinitionVersion::Number(1)).with_context(context))
        .expect("run");

    assert!(fixture.logs.write_count() > 0);
    assert!(fixture.blobs.put_count() > 0);
}
