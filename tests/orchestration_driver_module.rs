use allma::config::{OrchestratorSettings, ProviderSettings};
use allma::definition::{DefinitionVersion, FlowDefinition, InMemoryDefinitionStore, PromptTemplate};
use allma::execution_log::{
    ExecutionLogStore, ExecutionLogger, InMemoryExecutionLogStore, StepEventStatus,
};
use allma::handlers::{HandlerDependencies, OutboxEmailTransport, StepHandlerRegistry};
use allma::orchestration::{
    ContinuationStore, ErrorKind, FlowFinalizer, FlowInitializer, FlowStatus, FlowTriggerInput,
    InMemoryContinuationStore, LocalOrchestrator, QueuedFlowStarter, RecordingSleeper, RunOutcome,
    StepProcessor,
};
use allma::provider::{
    LlmAdapterFactory, LlmGenerationResponse, LlmProviderKind, MockLlmAdapter, ProviderError,
};
use allma::shared::{HttpClient, HttpError, HttpRequest, HttpResponse};
use allma::storage::{InMemoryBlobStore, PayloadOffloader};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

struct OfflineHttp;

impl HttpClient for OfflineHttp {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, HttpError> {
        Err(HttpError::Transport {
            url: request.url.clone(),
            reason: "network disabled in tests".to_string(),
        })
    }
}

struct Harness {
    _outbox: TempDir,
    logs: Arc<InMemoryExecutionLogStore>,
    continuations: Arc<InMemoryContinuationStore>,
    starter: Arc<QueuedFlowStarter>,
    sleeper: Arc<RecordingSleeper>,
    llm: Arc<MockLlmAdapter>,
    orchestrator: LocalOrchestrator,
}

fn harness_with(flows: Vec<Value>, llm: MockLlmAdapter, settings: OrchestratorSettings) -> Harness {
    let definitions = InMemoryDefinitionStore::new()
        .with_prompt(PromptTemplate {
            id: "classify".to_string(),
            version: 1,
            name: "Classify ticket".to_string(),
            content: "Classify this ticket: {{text}}".to_string(),
            is_published: true,
            description: None,
        })
        .expect("prompt");
    for flow in flows {
        let flow: FlowDefinition = serde_json::from_value(flow).expect("flow json");
        definitions.put_flow(flow).expect("put flow");
    }
    let definitions = Arc::new(definitions);

    let outbox = tempdir().expect("tempdir");
    let blobs = Arc::new(InMemoryBlobStore::new());
    let offloader = Arc::new(PayloadOffloader::new(blobs, "traces").with_threshold(512));
    let logs = Arc::new(InMemoryExecutionLogStore::new());
    let logger = ExecutionLogger::new(logs.clone(), Some(offloader.clone()));
    let continuations = Arc::new(InMemoryContinuationStore::new());
    let starter = Arc::new(QueuedFlowStarter::new());
    let sleeper = Arc::new(RecordingSleeper::new());
    let llm = Arc::new(llm);
    let http: Arc<dyn HttpClient> = Arc::new(OfflineHttp);

    let adapters = Arc::new(
        LlmAdapterFactory::new(ProviderSettings::default(), http.clone())
            .with_adapter(LlmProviderKind::Mock, llm.clone()),
    );
    let registry = StepHandlerRegistry::with_builtins(HandlerDependencies {
        definitions: definitions.clone(),
        adapters,
        http,
        offloader: Some(offloader.clone()),
        email_transport: Arc::new(OutboxEmailTransport::new(outbox.path())),
        flow_starter: starter.clone(),
        max_attachment_bytes: 1024,
    });
    let processor = Arc::new(
        StepProcessor::new(definitions.clone(), Arc::new(registry))
            .with_offloader(offloader.clone())
            .with_logger(logger.clone())
            .with_sleeper(sleeper.clone()),
    );
    let orchestrator = LocalOrchestrator::new(
        processor,
        FlowInitializer::new(definitions, logger.clone()),
        FlowFinalizer::new(Some(offloader), logger),
        continuations.clone(),
        starter.clone(),
        settings,
    )
    .with_sleeper(sleeper.clone());

    Harness {
        _outbox: outbox,
        logs,
        continuations,
        starter,
        sleeper,
        llm,
        orchestrator,
    }
}

fn harness(flows: Vec<Value>) -> Harness {
    harness_with(flows, MockLlmAdapter::new(), OrchestratorSettings::default())
}

fn flow(id: &str, start: &str, steps: Value) -> Value {
    let mut steps = steps;
    if let Value::Object(map) = &mut steps {
        for (key, step) in map.iter_mut() {
            if let Value::Object(step) = step {
                step.insert("stepInstanceId".to_string(), json!(key));
            }
        }
    }
    json!({
        "id": id,
        "version": 1,
        "name": id,
        "isPublished": true,
        "startStepInstanceId": start,
        "steps": steps
    })
}

fn trigger(flow_id: &str, context: Value) -> FlowTriggerInput {
    let Value::Object(context) = context else {
        panic!("context must be an object");
    };
    FlowTriggerInput::new(flow_id, DefinitionVersion::Number(1)).with_context(context)
}

fn completed(outcome: RunOutcome) -> allma::orchestration::FlowRuntimeState {
    match outcome {
        RunOutcome::Completed(state) => state,
        other => panic!("expected completion, got {other:?}"),
    }
}

fn output<'a>(state: &'a allma::orchestration::FlowRuntimeState, step: &str) -> &'a Value {
    state
        .current_context_data
        .get("steps_output")
        .and_then(|outputs| outputs.get(step))
        .unwrap_or(&Value::Null)
}

fn llm_step(next: Option<&str>) -> Value {
    let mut step = json!({
        "stepType": "LLM_INVOCATION",
        "llmProvider": "mock",
        "modelId": "mock-model",
        "promptTemplateId": "classify",
        "promptTemplateVersion": 1,
        "jsonOutputMode": true,
        "inputMappings": {"text": "$.ticket.body"}
    });
    if let (Some(next), Value::Object(map)) = (next, &mut step) {
        map.insert("defaultNextStepInstanceId".to_string(), json!(next));
    }
    step
}

#[test]
fn driver_module_runs_linear_flow_with_transitions() {
    let h = harness(vec![flow(
        "greet",
        "compose",
        json!({
            "compose": {
                "stepType": "DATA_TRANSFORMATION",
                "moduleIdentifier": "system/compose-object",
                "inputMappings": {"name": "$.user.name", "count": "$.user.count"},
                "customConfig": {"structure": {"greeting": "Hello {{name}}", "count": "{{count}}"}},
                "defaultNextStepInstanceId": "route"
            },
            "route": {
                "stepType": "NO_OP",
                "transitions": [
                    {"condition": "$.steps_output.compose.count > 2", "nextStepInstanceId": "big"}
                ],
                "defaultNextStepInstanceId": "small"
            },
            "big": {"stepType": "NO_OP"},
            "small": {"stepType": "NO_OP"}
        }),
    )]);

    let outcome = h
        .orchestrator
        .start(trigger("greet", json!({"user": {"name": "Ada", "count": 3}})))
        .expect("start");
    let state = completed(outcome);

    assert_eq!(state.status, FlowStatus::Completed);
    assert_eq!(output(&state, "compose"), &json!({"greeting": "Hello Ada", "count": 3}));
    assert!(state.current_context_data["steps_output"].get("big").is_some());
    assert!(state.current_context_data["steps_output"].get("small").is_none());
    assert!(!state.current_context_data.contains_key("_flow_runtime"));

    let metadata = h
        .logs
        .get_metadata(&state.flow_execution_id)
        .expect("metadata")
        .expect("metadata present");
    assert_eq!(metadata.status, FlowStatus::Completed);
    assert!(metadata.final_context_data_s3_pointer.is_some());

    let records = h.logs.list_step_records(&state.flow_execution_id).expect("records");
    let completed_steps: Vec<&str> = records
        .iter()
        .filter(|record| record.status == StepEventStatus::Completed)
        .map(|record| record.step_instance_id.as_str())
        .collect();
    assert_eq!(completed_steps.len(), 3);
    assert!(records
        .iter()
        .filter(|record| record.status == StepEventStatus::Started)
        .all(|record| record.full_record_s3_pointer.is_some()));
}

#[test]
fn driver_module_routes_permanent_failures_through_on_error() {
    let h = harness(vec![
        flow(
            "join-with-fallback",
            "join",
            json!({
                "join": {
                    "stepType": "DATA_TRANSFORMATION",
                    "moduleIdentifier": "system/data-join",
                    "onError": {"fallbackStepInstanceId": "recover"},
                    "defaultNextStepInstanceId": "never"
                },
                "recover": {"stepType": "NO_OP"},
                "never": {"stepType": "NO_OP"}
            }),
        ),
        flow(
            "join-continue",
            "join",
            json!({
                "join": {
                    "stepType": "DATA_TRANSFORMATION",
                    "moduleIdentifier": "system/data-join",
                    "onError": {"continueOnFailure": true, "errorOutputPath": "errors.join"},
                    "defaultNextStepInstanceId": "after"
                },
                "after": {"stepType": "NO_OP"}
            }),
        ),
    ]);

    let fallback = completed(
        h.orchestrator
            .start(trigger("join-with-fallback", json!({})))
            .expect("start"),
    );
    let error = output(&fallback, "join_error");
    assert_eq!(error["errorName"], json!("PermanentStepError"));
    assert_eq!(error["stepInstanceId"], json!("join"));
    assert!(fallback.current_context_data["steps_output"].get("recover").is_some());
    assert!(fallback.current_context_data["steps_output"].get("never").is_none());

    let continued = completed(
        h.orchestrator
            .start(trigger("join-continue", json!({})))
            .expect("start"),
    );
    assert_eq!(
        continued.current_context_data["errors"]["join"]["errorName"],
        json!("PermanentStepError")
    );
    assert!(continued.current_context_data["steps_output"].get("after").is_some());
}

#[test]
fn driver_module_fails_flow_without_error_route() {
    let h = harness(vec![flow(
        "bare-join",
        "join",
        json!({
            "join": {"stepType": "DATA_TRANSFORMATION", "moduleIdentifier": "system/data-join"}
        }),
    )]);

    let outcome = h.orchestrator.start(trigger("bare-join", json!({}))).expect("start");
    let RunOutcome::Failed { state, error } = outcome else {
        panic!("expected failure");
    };
    assert_eq!(error.kind, ErrorKind::Permanent);
    assert_eq!(error.step_instance_id.as_deref(), Some("join"));
    assert_eq!(state.status, FlowStatus::Failed);

    let metadata = h
        .logs
        .get_metadata(&state.flow_execution_id)
        .expect("metadata")
        .expect("metadata present");
    assert_eq!(metadata.status, FlowStatus::Failed);
    assert_eq!(
        metadata.error_info.map(|info| info.error_name),
        Some("PermanentStepError".to_string())
    );
}

#[test]
fn driver_module_retries_invalid_json_in_state() {
    let llm = MockLlmAdapter::with_responses([
        LlmGenerationResponse::ok("not json at all", None),
        LlmGenerationResponse::ok("{\"label\": ", None),
        LlmGenerationResponse::ok("```json\n{\"label\": \"billing\"}\n```", None),
    ]);
    let h = harness_with(
        vec![flow("classify", "classify", json!({"classify": llm_step(None)}))],
        llm,
        OrchestratorSettings::default(),
    );

    let state = completed(
        h.orchestrator
            .start(trigger("classify", json!({"ticket": {"body": "refund please"}})))
            .expect("start"),
    );
    assert_eq!(
        output(&state, "classify"),
        &json!({"llm_response": {"label": "billing"}})
    );
    assert!(state.step_retry_attempts.is_empty());

    let requests = h.llm.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[0].prompt, "Classify this ticket: refund please");
    assert!(h.sleeper.calls().is_empty());

    let failed_attempts: Vec<u32> = h
        .logs
        .list_step_records(&state.flow_execution_id)
        .expect("records")
        .iter()
        .filter(|record| record.status == StepEventStatus::Failed)
        .map(|record| record.attempt_number)
        .collect();
    assert_eq!(failed_attempts.len(), 2);
}

#[test]
fn driver_module_keeps_content_error_kind_when_retries_run_out() {
    let llm = MockLlmAdapter::with_responses([
        LlmGenerationResponse::ok("nope", None),
        LlmGenerationResponse::ok("nope", None),
        LlmGenerationResponse::ok("nope", None),
    ]);
    let h = harness_with(
        vec![flow("classify", "classify", json!({"classify": llm_step(None)}))],
        llm,
        OrchestratorSettings::default(),
    );

    let outcome = h
        .orchestrator
        .start(trigger("classify", json!({"ticket": {"body": "?"}})))
        .expect("start");
    let RunOutcome::Failed { error, state } = outcome else {
        panic!("expected failure");
    };
    assert_eq!(error.kind, ErrorKind::ContentRetryable);
    assert_eq!(
        state.error_info.map(|info| info.error_name),
        Some("ContentBasedRetryableError".to_string())
    );
    assert_eq!(h.llm.requests().len(), 3);
}

fn unavailable() -> LlmGenerationResponse {
    LlmGenerationResponse::failure(&ProviderError::Http {
        provider: LlmProviderKind::Mock,
        status: 503,
        body: "unavailable".to_string(),
    })
}

#[test]
fn driver_module_retries_transient_failures_with_backoff() {
    let llm = MockLlmAdapter::with_responses([
        unavailable(),
        unavailable(),
        LlmGenerationResponse::ok("{\"label\": \"ok\"}", None),
    ]);
    let h = harness_with(
        vec![flow("classify", "classify", json!({"classify": llm_step(None)}))],
        llm,
        OrchestratorSettings::default(),
    );

    let state = completed(
        h.orchestrator
            .start(trigger("classify", json!({"ticket": {"body": "hi"}})))
            .expect("start"),
    );
    assert_eq!(output(&state, "classify")["llm_response"], json!({"label": "ok"}));
    assert_eq!(
        h.sleeper.calls(),
        vec![Duration::from_millis(1000), Duration::from_millis(2000)]
    );
    assert!(state.step_retry_attempts.is_empty());
}

#[test]
fn driver_module_routes_exhausted_transient_failures() {
    let llm = MockLlmAdapter::with_responses([unavailable(), unavailable()]);
    let mut step = llm_step(None);
    step["onError"] = json!({
        "fallbackStepInstanceId": "manual",
        "retries": {"maxAttempts": 2, "intervalMs": 10}
    });
    let h = harness_with(
        vec![flow(
            "classify",
            "classify",
            json!({"classify": step, "manual": {"stepType": "NO_OP"}}),
        )],
        llm,
        OrchestratorSettings::default(),
    );

    let state = completed(
        h.orchestrator
            .start(trigger("classify", json!({"ticket": {"body": "hi"}})))
            .expect("start"),
    );
    assert_eq!(output(&state, "classify_error")["errorName"], json!("TransientStepError"));
    assert!(state.current_context_data["steps_output"].get("manual").is_some());
    assert_eq!(h.sleeper.calls(), vec![Duration::from_millis(10)]);
}

#[test]
fn driver_module_aggregates_fork_branches_in_declaration_order() {
    let h = harness(vec![flow(
        "pricing",
        "fork",
        json!({
            "fork": {
                "stepType": "PARALLEL_FORK_MANAGER",
                "inputMappings": {"orders": "$.orders"},
                "itemsPath": "$.orders",
                "parallelBranches": [{"branchId": "price", "stepInstanceId": "price_item"}],
                "aggregationConfig": {"strategy": "COLLECT_ARRAY"},
                "defaultNextStepInstanceId": "done"
            },
            "price_item": {
                "stepType": "DATA_TRANSFORMATION",
                "moduleIdentifier": "system/compose-object",
                "inputMappings": {"item": "$.currentItem"},
                "customConfig": {"structure": {"sku": "{{item.sku}}", "total": "{{item.qty}}"}}
            },
            "done": {"stepType": "NO_OP"}
        }),
    )]);

    let state = completed(
        h.orchestrator
            .start(trigger(
                "pricing",
                json!({"orders": [
                    {"sku": "a", "qty": 2},
                    {"sku": "b", "qty": 5},
                    {"sku": "c", "qty": 1}
                ]}),
            ))
            .expect("start"),
    );
    assert_eq!(
        output(&state, "fork"),
        &json!([
            {"sku": "a", "total": 2},
            {"sku": "b", "total": 5},
            {"sku": "c", "total": 1}
        ])
    );
    assert!(state.internal.pending_fork.is_none());
    assert!(!state.current_context_data.contains_key("currentItem"));

    let branch_records = h
        .logs
        .list_step_records(&state.flow_execution_id)
        .expect("records")
        .into_iter()
        .filter(|record| record.branch_id.is_some())
        .count();
    assert_eq!(branch_records, 6);
}

#[test]
fn driver_module_merges_conditional_branches() {
    let h = harness(vec![flow(
        "merge",
        "fork",
        json!({
            "fork": {
                "stepType": "PARALLEL_FORK_MANAGER",
                "parallelBranches": [
                    {"branchId": "left", "stepInstanceId": "left"},
                    {"branchId": "right", "stepInstanceId": "right"},
                    {
                        "branchId": "skipped",
                        "stepInstanceId": "right",
                        "condition": "$.includeAll == true"
                    }
                ],
                "aggregationConfig": {"strategy": "MERGE_OBJECTS", "outputPath": "merged"}
            },
            "left": {
                "stepType": "DATA_TRANSFORMATION",
                "moduleIdentifier": "system/compose-object",
                "customConfig": {"structure": {"left": true, "shared": {"a": 1}}}
            },
            "right": {
                "stepType": "DATA_TRANSFORMATION",
                "moduleIdentifier": "system/compose-object",
                "customConfig": {"structure": {"right": 1, "shared": {"b": 2}}}
            }
        }),
    )]);

    let state = completed(
        h.orchestrator
            .start(trigger("merge", json!({"includeAll": false})))
            .expect("start"),
    );
    assert_eq!(
        state.current_context_data["merged"],
        json!({"left": true, "right": 1, "shared": {"a": 1, "b": 2}})
    );
}

#[test]
fn driver_module_fails_fork_when_a_branch_fails() {
    let h = harness(vec![flow(
        "broken-fork",
        "fork",
        json!({
            "fork": {
                "stepType": "PARALLEL_FORK_MANAGER",
                "parallelBranches": [
                    {"branchId": "ok", "stepInstanceId": "fine"},
                    {"branchId": "bad", "stepInstanceId": "join"}
                ]
            },
            "fine": {"stepType": "NO_OP"},
            "join": {"stepType": "DATA_TRANSFORMATION", "moduleIdentifier": "system/data-join"}
        }),
    )]);

    let outcome = h.orchestrator.start(trigger("broken-fork", json!({}))).expect("start");
    let RunOutcome::Failed { error, .. } = outcome else {
        panic!("expected failure");
    };
    assert_eq!(error.kind, ErrorKind::Permanent);
    assert_eq!(error.step_instance_id.as_deref(), Some("fork"));
    assert!(error.message.contains("branch `bad` failed"));
}

fn approval_flow() -> Value {
    flow(
        "approval",
        "await",
        json!({
            "await": {
                "stepType": "WAIT_FOR_EXTERNAL_EVENT",
                "correlationKeyTemplate": "approval-{{orderId}}",
                "timeoutSeconds": 60,
                "inputMappings": {"orderId": "$.order.id"},
                "outputMappings": {"decision": "$.approved"},
                "onError": {"fallbackStepInstanceId": "timed_out"},
                "defaultNextStepInstanceId": "ship"
            },
            "ship": {"stepType": "NO_OP"},
            "timed_out": {"stepType": "NO_OP"}
        }),
    )
}

#[test]
fn driver_module_parks_and_resumes_on_external_event() {
    let h = harness(vec![approval_flow()]);

    let outcome = h
        .orchestrator
        .start(trigger("approval", json!({"order": {"id": 42}})))
        .expect("start");
    let RunOutcome::Waiting {
        correlation_key,
        state,
    } = outcome
    else {
        panic!("expected wait");
    };
    assert_eq!(correlation_key, "approval-42");
    assert_eq!(state.status, FlowStatus::Running);
    assert_eq!(h.continuations.list().expect("list").len(), 1);

    let resumed = completed(
        h.orchestrator
            .deliver_event("approval-42", json!({"approved": true}))
            .expect("deliver"),
    );
    assert_eq!(resumed.flow_execution_id, state.flow_execution_id);
    assert_eq!(output(&resumed, "await"), &json!({"approved": true}));
    assert_eq!(resumed.current_context_data["decision"], json!(true));
    assert!(resumed.current_context_data["steps_output"].get("ship").is_some());
    assert!(h.continuations.list().expect("list").is_empty());

    assert!(h
        .orchestrator
        .deliver_event("approval-42", json!({"approved": true}))
        .is_err());
}

#[test]
fn driver_module_expires_waits_after_timeout() {
    let h = harness(vec![approval_flow()]);
    let outcome = h
        .orchestrator
        .start(trigger("approval", json!({"order": {"id": 7}})))
        .expect("start");
    assert!(outcome.is_waiting());

    let now = chrono::Utc::now();
    assert!(h.orchestrator.expire_waits(now).expect("not yet").is_empty());
    assert_eq!(h.continuations.list().expect("list").len(), 1);

    let expired = h
        .orchestrator
        .expire_waits(now + chrono::Duration::seconds(120))
        .expect("expire");
    assert_eq!(expired.len(), 1);
    let state = expired[0].state();
    assert_eq!(state.status, FlowStatus::Completed);
    assert!(output(state, "await_error")["errorMessage"]
        .as_str()
        .is_some_and(|message| message.contains("timed out")));
    assert!(state.current_context_data["steps_output"].get("timed_out").is_some());
    assert!(h.continuations.list().expect("list").is_empty());
}

#[test]
fn driver_module_queues_sub_flows_for_later_runs() {
    let h = harness(vec![
        flow(
            "parent",
            "spawn",
            json!({
                "spawn": {
                    "stepType": "START_SUB_FLOW",
                    "subFlowDefinitionId": "child",
                    "subFlowVersion": 1,
                    "inputMappings": {"initialContextData": "$.payload"}
                }
            }),
        ),
        flow(
            "child",
            "echo",
            json!({
                "echo": {
                    "stepType": "NO_OP",
                    "inputMappings": {"value": "$.value"}
                }
            }),
        ),
    ]);

    let parent = completed(
        h.orchestrator
            .start(trigger("parent", json!({"payload": {"value": "hello"}})))
            .expect("start"),
    );
    let child_id = output(&parent, "spawn")["subFlowExecutionId"]
        .as_str()
        .expect("child id")
        .to_string();
    assert_eq!(h.starter.pending(), 1);

    let queued = h.orchestrator.run_queued();
    assert_eq!(queued.len(), 1);
    let child = completed(queued.into_iter().next().expect("one").expect("child run"));
    assert_eq!(child.flow_execution_id, child_id);
    assert_eq!(output(&child, "echo"), &json!({"value": "hello"}));
    assert_eq!(h.starter.pending(), 0);

    let metadata = h
        .logs
        .get_metadata(&child_id)
        .expect("metadata")
        .expect("child metadata");
    assert!(metadata
        .trigger_source
        .is_some_and(|source| source.starts_with("sub-flow:")));
}

#[test]
fn driver_module_stops_runaway_loops() {
    let settings = OrchestratorSettings {
        max_cycles: 5,
        ..OrchestratorSettings::default()
    };
    let h = harness_with(
        vec![flow(
            "loop",
            "spin",
            json!({"spin": {"stepType": "NO_OP", "defaultNextStepInstanceId": "spin"}}),
        )],
        MockLlmAdapter::new(),
        settings,
    );

    let outcome = h.orchestrator.start(trigger("loop", json!({}))).expect("start");
    let RunOutcome::Failed { error, .. } = outcome else {
        panic!("expected failure");
    };
    assert!(error.message.contains("exceeded 5 processor cycles"));
}

#[test]
fn driver_module_offloads_large_step_outputs() {
    let h = harness(vec![flow(
        "big",
        "copy",
        json!({
            "copy": {
                "stepType": "NO_OP",
                "inputMappings": {"blob": "$.blob"},
                "defaultNextStepInstanceId": "read"
            },
            "read": {
                "stepType": "NO_OP",
                "disableS3Offload": true,
                "inputMappings": {"blob": "$.steps_output.copy.blob"}
            }
        }),
    )]);
    let blob = "z".repeat(2_000);

    let state = completed(
        h.orchestrator
            .start(trigger("big", json!({"blob": blob.clone()})))
            .expect("start"),
    );
    assert!(allma::storage::is_offload_wrapper(output(&state, "copy")));
    assert_eq!(output(&state, "read"), &json!({"blob": blob}));
}
