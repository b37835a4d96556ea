use allma::app::engine::{Engine, EngineParts};
use allma::config::Settings;
use allma::definition::{DefinitionVersion, FlowDefinition, InMemoryDefinitionStore};
use allma::execution_log::InMemoryExecutionLogStore;
use allma::handlers::OutboxEmailTransport;
use allma::orchestration::{
    ErrorKind, FlowRuntimeState, FlowTriggerInput, InMemoryContinuationStore, RunOutcome,
};
use allma::shared::{HttpClient, HttpError, HttpRequest, HttpResponse};
use allma::storage::InMemoryBlobStore;
use serde_json::{json, Value};
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

fn engine_with_step(step: Value) -> (Engine, TempDir) {
    let mut step = step;
    step["stepInstanceId"] = json!("transform");
    let flow: FlowDefinition = serde_json::from_value(json!({
        "id": "data",
        "version": 1,
        "isPublished": true,
        "startStepInstanceId": "transform",
        "steps": {"transform": step}
    }))
    .expect("flow json");
    let definitions = InMemoryDefinitionStore::new().with_flow(flow).expect("flow");
    let outbox = tempdir().expect("tempdir");
    let engine = Engine::assemble(
        Settings::default(),
        EngineParts {
            definitions: Arc::new(definitions),
            blobs: Arc::new(InMemoryBlobStore::new()),
            log_store: Arc::new(InMemoryExecutionLogStore::new()),
            continuations: Arc::new(InMemoryContinuationStore::new()),
            email_transport: Arc::new(OutboxEmailTransport::new(outbox.path())),
            http: Arc::new(OfflineHttp),
        },
    );
    (engine, outbox)
}

fn run(engine: &Engine, context: Value) -> RunOutcome {
    let Value::Object(context) = context else {
        panic!("context must be an object");
    };
    engine
        .run(FlowTriggerInput::new("data", DefinitionVersion::Number(1)).with_context(context))
        .expect("run")
        .outcome
}

fn transform_output(outcome: RunOutcome) -> Value {
    let state: FlowRuntimeState = match outcome {
        RunOutcome::Completed(state) => state,
        other => panic!("expected completion, got {other:?}"),
    };
    state.current_context_data["steps_output"]["transform"].clone()
}

fn join_step(join_type: &str) -> Value {
    json!({
        "stepDefinitionId": "system-data-join",
        "inputMappings": {"leftData": "$.products", "rightData": "$.prices", "joinKeys": "$.keys"},
        "literals": {"joinType": join_type}
    })
}

fn join_context() -> Value {
    json!({
        "products": "id,name\n1,Widget\n2,Gadget\n3,\"Doohickey, large\"\n",
        "prices": [
            {"id": "1", "price": "9.99", "name": "W"},
            {"id": "3", "price": "4.50"},
            {"id": "4", "price": "1.00"}
        ],
        "keys": ["id"]
    })
}

#[test]
fn data_module_inner_join_renames_colliding_columns() {
    let (engine, _outbox) = engine_with_step(join_step("inner"));
    let output = transform_output(run(&engine, join_context()));

    assert_eq!(output["rowCount"], json!(2));
    assert_eq!(
        output["joinedData"],
        json!([
            {"id": "1", "name_left": "Widget", "name_right": "W", "price": "9.99"},
            {"id": "3", "name_left": "Doohickey, large", "name_right": null, "price": "4.50"}
        ])
    );
}

#[test]
fn data_module_outer_join_keeps_unmatched_rows_from_both_sides() {
    let (engine, _outbox) = engine_with_step(join_step("outer"));
    let output = transform_output(run(&engine, join_context()));

    assert_eq!(output["rowCount"], json!(4));
    let rows = output["joinedData"].as_array().expect("rows");
    assert_eq!(
        rows[1],
        json!({"id": "2", "name_left": "Gadget", "name_right": null, "price": null})
    );
    assert_eq!(
        rows[3],
        json!({"id": "4", "name_left": null, "name_right": null, "price": "1.00"})
    );
}

#[test]
fn data_module_right_join_follows_right_row_order() {
    let (engine, _outbox) = engine_with_step(join_step("right"));
    let output = transform_output(run(&engine, join_context()));

    let ids: Vec<&str> = output["joinedData"]
        .as_array()
        .expect("rows")
        .iter()
        .filter_map(|row| row["id"].as_str())
        .collect();
    assert_eq!(ids, vec!["1", "3", "4"]);
}

#[test]
fn data_module_join_rejects_unknown_join_type() {
    let (engine, _outbox) = engine_with_step(join_step("sideways"));
    let RunOutcome::Failed { error, .. } = run(&engine, join_context()) else {
        panic!("expected failure");
    };
    assert_eq!(error.kind, ErrorKind::Permanent);
    assert!(error.message.contains("joinType"));
}

fn bom_cells() -> Value {
    json!([
        {"address": "A1", "value": "Bill of Materials"},
        {"address": "A4", "value": "Part Name"},
        {"address": "B4", "value": "Material"},
        {"address": "C4", "value": "Quantity"},
        {"address": "A5", "value": "Bolt"},
        {"address": "B5", "value": "Steel"},
        {"row": 5, "col": "C", "value": 4},
        {"row": 6, "col": 1, "value": "Nut"},
        {"address": "B6", "value": "Brass"},
        {"address": "C6", "value": 10},
        {"address": "A7", "value": "Rocket Fuel"},
        {"address": "B7", "value": "  "},
        {"address": "A8", "value": "Notes: order early"}
    ])
}

#[test]
fn data_module_extracts_bom_parts_with_missing_cells_as_null() {
    let (engine, _outbox) = engine_with_step(json!({
        "stepDefinitionId": "system-bom-extract",
        "inputMappings": {"cells": "$.sheet.cells"},
        "literals": {"headerRow": 4, "dataStartRow": 5, "dataEndRow": 7}
    }));
    let output = transform_output(run(&engine, json!({"sheet": {"cells": bom_cells()}})));

    assert_eq!(output["headers"], json!(["Part Name", "Material", "Quantity"]));
    assert_eq!(output["partCount"], json!(3));
    assert_eq!(
        output["parts"][0],
        json!({"Part Name": "Bolt", "Material": "Steel", "Quantity": 4})
    );
    assert_eq!(
        output["parts"][2],
        json!({"Part Name": "Rocket Fuel", "Material": null, "Quantity": null})
    );
}

#[test]
fn data_module_bom_requires_a_populated_header_row() {
    let (engine, _outbox) = engine_with_step(json!({
        "stepDefinitionId": "system-bom-extract",
        "inputMappings": {"cells": "$.cells"},
        "literals": {"headerRow": 3}
    }));
    let RunOutcome::Failed { error, .. } = run(&engine, json!({"cells": bom_cells()})) else {
        panic!("expected failure");
    };
    assert!(error.message.contains("header row 3"));
}

#[test]
fn data_module_bom_rejects_row_numbers_beyond_the_sheet_range() {
    let (engine, _outbox) = engine_with_step(json!({
        "stepDefinitionId": "system-bom-extract",
        "inputMappings": {"cells": "$.cells"},
        "literals": {"headerRow": 4_294_967_300_u64}
    }));
    let RunOutcome::Failed { error, .. } = run(&engine, json!({"cells": bom_cells()})) else {
        panic!("expected failure");
    };
    assert_eq!(error.kind, ErrorKind::Permanent);
    assert!(error.message.contains("headerRow"), "{}", error.message);

    let (engine, _outbox) = engine_with_step(json!({
        "stepDefinitionId": "system-bom-extract",
        "inputMappings": {"cells": "$.cells"},
        "literals": {"headerRow": u32::MAX}
    }));
    let RunOutcome::Failed { error, .. } = run(&engine, json!({"cells": bom_cells()})) else {
        panic!("expected failure");
    };
    assert_eq!(error.kind, ErrorKind::Permanent);
    assert!(error.message.contains("no room for data rows"), "{}", error.message);
}

#[test]
fn data_module_compose_object_passes_input_through_without_structure() {
    let (engine, _outbox) = engine_with_step(json!({
        "stepDefinitionId": "system-compose-object",
        "inputMappings": {"customer": "$.order.customer", "lines": "$.order.lines"}
    }));
    let output = transform_output(run(
        &engine,
        json!({"order": {"customer": "acme", "lines": [1, 2], "internal": true}}),
    ));
    assert_eq!(output, json!({"customer": "acme", "lines": [1, 2]}));
}

#[test]
fn data_module_compose_object_keeps_types_of_single_placeholders() {
    let (engine, _outbox) = engine_with_step(json!({
        "stepDefinitionId": "system-compose-object",
        "inputMappings": {"order": "$.order"},
        "customConfig": {"structure": {
            "summary": "{{order.customer}} ordered {{order.count}} items",
            "count": "{{ order.count }}",
            "lines": ["{{order.lines}}", "fixed"],
            "flag": false
        }}
    }));
    let output = transform_output(run(
        &engine,
        json!({"order": {"customer": "acme", "count": 2, "lines": [1, 2]}}),
    ));
    assert_eq!(
        output,
        json!({
            "summary": "acme ordered 2 items",
            "count": 2,
            "lines": [[1, 2], "fixed"],
            "flag": false
        })
    );
}
