use allma::app::engine::{Engine, EngineParts};
use allma::config::Settings;
use allma::definition::{DefinitionVersion, FlowDefinition, InMemoryDefinitionStore};
use allma::execution_log::{ExecutionLogStore, InMemoryExecutionLogStore, StepEventStatus};
use allma::handlers::OutboxEmailTransport;
use allma::orchestration::{
    ErrorKind, FlowStatus, FlowTriggerInput, InMemoryContinuationStore, QueuedFlowStarter,
    RedriveController, RedriveError, RunOutcome,
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
    _outbox: TempDir,
}

fn fixture() -> Fixture {
    let flow: FlowDefinition = serde_json::from_value(json!({
        "id": "orders",
        "version": 3,
        "isPublished": true,
        "startStepInstanceId": "enrich",
        "steps": {
            "enrich": {
                "stepInstanceId": "enrich",
                "stepDefinitionId": "system-compose-object",
                "inputMappings": {"order": "$.order"},
                "customConfig": {"structure": {"customer": "{{order.customer}}"}},
                "defaultNextStepInstanceId": "charge"
            },
            "charge": {
                "stepInstanceId": "charge",
                "stepDefinitionId": "system-compose-object",
                "inputMappings": {"order": "$.order", "enriched": "$.steps_output.enrich"},
                "customConfig": {"structure": {
                    "receipt": "Charged {{enriched.customer}} {{order.total}}"
                }}
            }
        }
    }))
    .expect("flow json");
    let logs = Arc::new(InMemoryExecutionLogStore::new());
    let outbox = tempdir().expect("tempdir");
    let engine = Engine::assemble(
        Settings::default(),
        EngineParts {
            definitions: Arc::new(InMemoryDefinitionStore::new().with_flow(flow).expect("flow")),
            blobs: Arc::new(InMemoryBlobStore::new()),
            log_store: logs.clone(),
            continuations: Arc::new(InMemoryContinuationStore::new()),
            email_transport: Arc::new(OutboxEmailTransport::new(outbox.path())),
            http: Arc::new(OfflineHttp),
        },
    );
    Fixture {
        engine,
        logs,
        _outbox: outbox,
    }
}

fn failed_run(fixture: &Fixture) -> String {
    let mut context = Map::new();
    context.insert("order".to_string(), json!({"customer": "acme"}));
    let outcome = fixture
        .engine
        .run(FlowTriggerInput::new("orders", DefinitionVersion::Number(3)).with_context(context))
        .expect("run")
        .outcome;
    let RunOutcome::Failed { error, .. } = &outcome else {
        panic!("expected the charge step to fail, got {outcome:?}");
    };
    assert_eq!(error.step_instance_id.as_deref(), Some("charge"));
    outcome.flow_execution_id().to_string()
}

fn executed_steps(logs: &InMemoryExecutionLogStore, flow_execution_id: &str) -> Vec<String> {
    logs.list_step_records(flow_execution_id)
        .expect("records")
        .into_iter()
        .filter(|record| record.status == StepEventStatus::Started)
        .map(|record| record.step_instance_id)
        .collect()
}

#[test]
fn redrive_module_simple_redrive_replays_the_original_trigger() {
    let fixture = fixture();
    let original = failed_run(&fixture);

    let redriven = fixture.engine.simple_redrive(&original).expect("redrive").outcome;

    assert_ne!(redriven.flow_execution_id(), original);
    assert_eq!(redriven.status(), FlowStatus::Failed);
    assert_eq!(
        executed_steps(&fixture.logs, redriven.flow_execution_id()),
        vec!["enrich".to_string(), "charge".to_string()]
    );
    let metadata = fixture
        .logs
        .get_metadata(redriven.flow_execution_id())
        .expect("metadata")
        .expect("present");
    assert_eq!(metadata.redrive_of_flow_execution_id.as_deref(), Some(original.as_str()));
    assert_eq!(metadata.trigger_source.as_deref(), Some("redrive"));
    assert_eq!(
        metadata.initial_input_payload["initialContextData"]["order"]["customer"],
        json!("acme")
    );
}

#[test]
fn redrive_module_stateful_redrive_resumes_at_the_failed_step() {
    let fixture = fixture();
    let original = failed_run(&fixture);

    let redriven = fixture
        .engine
        .stateful_redrive(&original, "charge", None)
        .expect("redrive")
        .outcome;

    assert_eq!(redriven.status(), FlowStatus::Failed);
    assert_eq!(
        executed_steps(&fixture.logs, redriven.flow_execution_id()),
        vec!["charge".to_string()]
    );
    let context = &redriven.state().current_context_data;
    assert_eq!(context["steps_output"]["enrich"], json!({"customer": "acme"}));
    assert!(!context.contains_key("_flow_runtime"));

    let metadata = fixture
        .logs
        .get_metadata(redriven.flow_execution_id())
        .expect("metadata")
        .expect("present");
    assert_eq!(metadata.redrive_of_flow_execution_id.as_deref(), Some(original.as_str()));
    assert_eq!(metadata.trigger_source.as_deref(), Some("stateful-redrive"));
}

#[test]
fn redrive_module_stateful_redrive_with_a_corrected_context_completes() {
    let fixture = fixture();
    let original = failed_run(&fixture);

    let Value::Object(corrected) = json!({
        "order": {"customer": "acme", "total": 12},
        "steps_output": {"enrich": {"customer": "Acme Ltd"}}
    }) else {
        unreachable!()
    };
    let redriven = fixture
        .engine
        .stateful_redrive(&original, "charge", Some(corrected))
        .expect("redrive")
        .outcome;

    let RunOutcome::Completed(state) = redriven else {
        panic!("expected completion, got {redriven:?}");
    };
    assert_eq!(
        state.current_context_data["steps_output"]["charge"],
        json!({"receipt": "Charged Acme Ltd 12"})
    );
    assert!(state.internal.is_stateful_redrive);
    assert_eq!(state.internal.original_flow_execution_id.as_deref(), Some(original.as_str()));
}

#[test]
fn redrive_module_rejects_unknown_executions_and_steps() {
    let fixture = fixture();
    let original = failed_run(&fixture);

    let unknown = fixture
        .engine
        .simple_redrive("no-such-execution")
        .err()
        .expect("unknown execution");
    assert_eq!(unknown.kind, ErrorKind::Permanent);
    assert!(unknown.message.contains("no execution metadata"));

    let never_ran = fixture
        .engine
        .stateful_redrive(&original, "refund", None)
        .err()
        .expect("step never started");
    assert!(never_ran.message.contains("no STARTED record for step `refund`"));
}

#[test]
fn redrive_module_classifies_lookup_failures() {
    let fixture = fixture();
    let original = failed_run(&fixture);
    let log_store: Arc<dyn ExecutionLogStore> = fixture.logs.clone();
    let starter = Arc::new(QueuedFlowStarter::new());
    let controller = RedriveController::new(log_store, None, starter.clone());

    let missing = controller
        .simple_redrive("no-such-execution")
        .err()
        .expect("missing metadata");
    assert!(missing.is_not_found());

    let without_blobs = controller
        .stateful_redrive(&original, "charge", None)
        .err()
        .expect("pointer cannot be read");
    assert!(matches!(without_blobs, RedriveError::BlobStoreMissing));
    assert!(!without_blobs.is_not_found());
    assert_eq!(starter.pending(), 0);

    let new_id = controller.simple_redrive(&original).expect("submit");
    let queued = starter.drain();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].flow_execution_id.as_deref(), Some(new_id.as_str()));
    assert_eq!(
        queued[0].redrive_of_flow_execution_id.as_deref(),
        Some(original.as_str())
    );
}
