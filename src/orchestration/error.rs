use crate::definition::DefinitionError;
use crate::provider::{FailureKind, ProviderError};
use crate::storage::BlobStoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Retry classification carried by every step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Bad configuration, missing definitions, validation failures. Never retried.
    Permanent,
    /// Provider, network or server-side failures. Retried by the orchestrator.
    Transient,
    /// The step ran but its output failed validation; a fresh attempt may succeed.
    ContentRetryable,
}

impl ErrorKind {
    pub fn error_name(self) -> &'static str {
        match self {
            Self::Permanent => "PermanentStepError",
            Self::Transient => "TransientStepError",
            Self::ContentRetryable => "ContentBasedRetryableError",
        }
    }

    pub fn from_error_name(name: &str) -> Option<Self> {
        match name {
            "PermanentStepError" => Some(Self::Permanent),
            "TransientStepError" => Some(Self::Transient),
            "ContentBasedRetryableError" => Some(Self::ContentRetryable),
            _ => None,
        }
    }

    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::Permanent)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.error_name())
    }
}

/// The serialized failure summary stored on metadata records and injected
/// into the context when an `onError` route is taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub error_name: String,
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorInfo {
    pub fn kind(&self) -> Option<ErrorKind> {
        ErrorKind::from_error_name(&self.error_name)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
    pub step_instance_id: Option<String>,
    pub details: Option<Value>,
}

impl StepError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            step_instance_id: None,
            details: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn content_retryable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ContentRetryable, message)
    }

    /// Attaches the failing step unless an inner layer already did.
    pub fn in_step(mut self, step_instance_id: &str) -> Self {
        if self.step_instance_id.is_none() {
            self.step_instance_id = Some(step_instance_id.to_string());
        }
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn error_name(&self) -> &'static str {
        self.kind.error_name()
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn error_info(&self) -> ErrorInfo {
        ErrorInfo {
            error_name: self.kind.error_name().to_string(),
            error_message: self.message.clone(),
            step_instance_id: self.step_instance_id.clone(),
            details: self.details.clone(),
        }
    }

    pub fn from_error_info(info: &ErrorInfo) -> Self {
        Self {
            kind: info.kind().unwrap_or(ErrorKind::Permanent),
            message: info.error_message.clone(),
            step_instance_id: info.step_instance_id.clone(),
            details: info.details.clone(),
        }
    }
}

impl From<DefinitionError> for StepError {
    fn from(value: DefinitionError) -> Self {
        match value {
            DefinitionError::Io { .. } | DefinitionError::Unavailable(_) => {
                Self::transient(value.to_string())
            }
            other => Self::permanent(other.to_string()),
        }
    }
}

impl From<BlobStoreError> for StepError {
    fn from(value: BlobStoreError) -> Self {
        match value {
            BlobStoreError::NotFound { .. } | BlobStoreError::Decode { .. } => {
                Self::permanent(value.to_string())
            }
            other => Self::transient(other.to_string()),
        }
    }
}

impl From<ProviderError> for StepError {
    fn from(value: ProviderError) -> Self {
        match value.failure_kind() {
            FailureKind::Transient => Self::transient(value.to_string()),
            FailureKind::Permanent => Self::permanent(value.to_string()),
        }
    }
}
