use allma::definition::DefinitionError;
use allma::orchestration::{ContinuationError, ErrorInfo, ErrorKind, StepError};
use allma::provider::{LlmProviderKind, ProviderError};
use allma::storage::BlobStoreError;
use serde_json::json;

#[test]
fn error_module_kinds_round_trip_through_error_names() {
    for kind in [
        ErrorKind::Permanent,
        ErrorKind::Transient,
        ErrorKind::ContentRetryable,
    ] {
        assert_eq!(ErrorKind::from_error_name(kind.error_name()), Some(kind));
    }
    assert_eq!(ErrorKind::from_error_name("TypeError"), None);
    assert!(!ErrorKind::Permanent.is_retryable());
    assert!(ErrorKind::ContentRetryable.is_retryable());
}

#[test]
fn error_module_error_info_preserves_kind_step_and_details() {
    let error = StepError::content_retryable("model output is not valid JSON")
        .with_details(json!({"rawResponse": "Sure!"}))
        .in_step("classify")
        .in_step("outer");

    let info = error.error_info();
    assert_eq!(info.error_name, "ContentBasedRetryableError");
    assert_eq!(info.step_instance_id.as_deref(), Some("classify"));
    assert_eq!(
        serde_json::to_value(&info).expect("serialize"),
        json!({
            "errorName": "ContentBasedRetryableError",
            "errorMessage": "model output is not valid JSON",
            "stepInstanceId": "classify",
            "details": {"rawResponse": "Sure!"}
        })
    );
    assert_eq!(StepError::from_error_info(&info), error);
}

#[test]
fn error_module_unknown_error_names_read_back_as_permanent() {
    let info: ErrorInfo = serde_json::from_value(json!({
        "errorName": "States.Timeout",
        "errorMessage": "timed out"
    }))
    .expect("error info");
    let error = StepError::from_error_info(&info);
    assert_eq!(error.kind, ErrorKind::Permanent);
    assert_eq!(error.to_string(), "PermanentStepError: timed out");
}

#[test]
fn error_module_conversions_classify_collaborator_failures() {
    let missing_flow = StepError::from(DefinitionError::FlowNotFound {
        id: "orders".to_string(),
        version: "3".to_string(),
    });
    assert_eq!(missing_flow.kind, ErrorKind::Permanent);

    let definitions_down = StepError::from(DefinitionError::Unavailable("lock".to_string()));
    assert_eq!(definitions_down.kind, ErrorKind::Transient);

    let missing_blob = StepError::from(BlobStoreError::NotFound {
        bucket: "allma".to_string(),
        key: "a/b.json".to_string(),
    });
    assert_eq!(missing_blob.kind, ErrorKind::Permanent);
    assert_eq!(
        StepError::from(BlobStoreError::Unavailable("disk".to_string())).kind,
        ErrorKind::Transient
    );

    let throttled = StepError::from(ProviderError::Http {
        provider: LlmProviderKind::Gemini,
        status: 429,
        body: "slow down".to_string(),
    });
    assert_eq!(throttled.kind, ErrorKind::Transient);
    let bad_key = StepError::from(ProviderError::MissingApiKey {
        provider: LlmProviderKind::Bedrock,
        env: "BEDROCK_API_KEY".to_string(),
    });
    assert_eq!(bad_key.kind, ErrorKind::Permanent);

    assert_eq!(
        StepError::from(ContinuationError::DuplicateKey("approval-1".to_string())).kind,
        ErrorKind::Permanent
    );
    assert_eq!(
        StepError::from(ContinuationError::Unavailable("lock".to_string())).kind,
        ErrorKind::Transient
    );
}
