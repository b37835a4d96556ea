use allma::definition::{
    InMemoryDefinitionStore, StepDefinition, StepInstance, StepPayload, StepType,
};
use allma::hydration::DefinitionHydrator;
use allma::orchestration::ErrorKind;
use serde_json::json;
use std::sync::Arc;

fn store_with_definition() -> Arc<InMemoryDefinitionStore> {
    let definition: StepDefinition = serde_json::from_value(json!({
        "id": "call-api",
        "name": "Call API",
        "version": 7,
        "description": "calls the billing API",
        "isPublished": true,
        "stepType": "API_CALL",
        "apiUrl": "https://billing.example/v1/invoices",
        "apiHttpMethod": "GET",
        "apiHeaders": {"Accept": "application/json", "X-Team": "billing"},
        "customConfig": {"tags": ["a", "b"], "nested": {"keep": 1, "swap": "old"}},
        "literals": {"limit": 10}
    }))
    .expect("definition json");
    Arc::new(
        InMemoryDefinitionStore::new()
            .with_step(definition)
            .expect("store step"),
    )
}

fn instance() -> StepInstance {
    serde_json::from_value(json!({
        "stepInstanceId": "fetch",
        "stepDefinitionId": "call-api",
        "defaultNextStepInstanceId": "done",
        "apiHeaders": {"X-Team": "payments"},
        "customConfig": {"tags": ["z"], "nested": {"swap": "new"}}
    }))
    .expect("instance json")
}

#[test]
fn hydration_module_instance_fields_win_over_definition() {
    let hydrator = DefinitionHydrator::new(store_with_definition());
    let step = hydrator.hydrate(&instance()).expect("hydrate");

    assert_eq!(step.step_type(), StepType::ApiCall);
    let StepPayload::ApiCall(config) = &step.payload else {
        panic!("expected API_CALL payload");
    };
    assert_eq!(config.api_url, "https://billing.example/v1/invoices");
    assert_eq!(config.api_headers.get("X-Team").map(String::as_str), Some("payments"));
    assert_eq!(
        config.api_headers.get("Accept").map(String::as_str),
        Some("application/json")
    );
    assert_eq!(step.base.custom_config["tags"], json!(["z"]));
    assert_eq!(step.base.custom_config["nested"], json!({"keep": 1, "swap": "new"}));
    assert_eq!(step.base.literals["limit"], json!(10));
    assert_eq!(step.default_next_step_instance_id.as_deref(), Some("done"));
}

#[test]
fn hydration_module_drops_definition_identity_fields() {
    let hydrator = DefinitionHydrator::new(store_with_definition());
    let merged = hydrator.merged_value(&instance()).expect("merge");
    for field in ["id", "name", "version", "description", "isPublished"] {
        assert!(merged.get(field).is_none(), "{field} should be stripped");
    }
    assert_eq!(merged["stepInstanceId"], json!("fetch"));
}

#[test]
fn hydration_module_is_idempotent() {
    let hydrator = DefinitionHydrator::new(store_with_definition());
    let once = hydrator.hydrate(&instance()).expect("first hydrate");
    let twice = hydrator.hydrate(&instance()).expect("second hydrate");
    assert_eq!(once, twice);

    let rehydrated: StepInstance =
        serde_json::from_value(serde_json::to_value(&once).expect("encode")).expect("decode");
    let again = hydrator.hydrate(&rehydrated).expect("hydrate hydrated step");
    assert_eq!(again, once);
}

#[test]
fn hydration_module_rejects_conflicting_step_types() {
    let hydrator = DefinitionHydrator::new(store_with_definition());
    let mut conflicting = instance();
    conflicting
        .overrides
        .insert("stepType".to_string(), json!("EMAIL"));
    let err = hydrator.hydrate(&conflicting).expect_err("type conflict");
    assert!(err.message.contains("declares stepType EMAIL"));
    assert_eq!(err.step_instance_id.as_deref(), Some("fetch"));
}

#[test]
fn hydration_module_synthesizes_system_steps() {
    let hydrator = DefinitionHydrator::new(Arc::new(InMemoryDefinitionStore::new()));
    let join: StepInstance = serde_json::from_value(json!({
        "stepInstanceId": "join",
        "stepDefinitionId": "system-data-join"
    }))
    .expect("instance json");
    let step = hydrator.hydrate(&join).expect("hydrate system step");
    assert_eq!(step.step_type(), StepType::DataTransformation);
    assert_eq!(step.payload.module_identifier(), Some("system/data-join"));

    let unknown: StepInstance = serde_json::from_value(json!({
        "stepInstanceId": "mystery",
        "stepDefinitionId": "system-does-not-exist"
    }))
    .expect("instance json");
    let err = hydrator.hydrate(&unknown).expect_err("unknown system step");
    assert_eq!(err.kind, ErrorKind::Permanent);
    assert!(err.message.contains("system-does-not-exist"), "{}", err.message);
}

#[test]
fn hydration_module_missing_step_definitions_are_permanent_errors_naming_the_id() {
    let hydrator = DefinitionHydrator::new(store_with_definition());
    let missing: StepInstance = serde_json::from_value(json!({
        "stepInstanceId": "lookup",
        "stepDefinitionId": "billing-lookup"
    }))
    .expect("instance json");
    let err = hydrator.hydrate(&missing).expect_err("missing definition");
    assert_eq!(err.kind, ErrorKind::Permanent);
    assert!(err.message.contains("billing-lookup"), "{}", err.message);
}

#[test]
fn hydration_module_passes_inline_steps_through() {
    let hydrator = DefinitionHydrator::new(Arc::new(InMemoryDefinitionStore::new()));
    let step = hydrator
        .hydrate(&StepInstance::no_op("noop"))
        .expect("inline no-op");
    assert_eq!(step.step_type(), StepType::NoOp);
    assert!(step.step_definition_id.is_none());
}
