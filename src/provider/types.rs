use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("unknown llm provider `{0}`")]
    UnknownProvider(String),
    #[error("api key for {provider} is not set (expected env `{env}`)")]
    MissingApiKey {
        provider: LlmProviderKind,
        env: String,
    },
    #[error("{provider} returned http {status}: {body}")]
    Http {
        provider: LlmProviderKind,
        status: u16,
        body: String,
    },
    #[error("{provider} transport failure: {reason}")]
    Transport {
        provider: LlmProviderKind,
        reason: String,
    },
    #[error("{provider} response could not be read: {reason}")]
    InvalidResponse {
        provider: LlmProviderKind,
        reason: String,
    },
    #[error("{provider} blocked the response: {reason}")]
    SafetyBlocked {
        provider: LlmProviderKind,
        reason: String,
    },
}

impl ProviderError {
    /// Throttling, timeouts, server errors and transport failures are worth
    /// another attempt; everything else fails immediately.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Http { status, .. } if *status == 408 || *status == 429 || *status >= 500 => {
                FailureKind::Transient
            }
            Self::Transport { .. } => FailureKind::Transient,
            _ => FailureKind::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.failure_kind() == FailureKind::Transient
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    Transient,
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LlmProviderKind {
    Gemini,
    Bedrock,
    Mock,
}

impl std::fmt::Display for LlmProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmProviderKind::Gemini => write!(f, "gemini"),
            LlmProviderKind::Bedrock => write!(f, "bedrock"),
            LlmProviderKind::Mock => write!(f, "mock"),
        }
    }
}

impl TryFrom<&str> for LlmProviderKind {
    type Error = ProviderError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "gemini" | "google_gemini" => Ok(Self::Gemini),
            "bedrock" | "aws_bedrock" => Ok(Self::Bedrock),
            "mock" => Ok(Self::Mock),
            other => Err(ProviderError::UnknownProvider(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmGenerationRequest {
    pub provider: LlmProviderKind,
    pub model_id: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default)]
    pub custom_config: Map<String, Value>,
    #[serde(default)]
    pub json_output_mode: bool,
    pub correlation_id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmGenerationResponse {
    pub success: bool,
    pub response_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub safety_flagged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
}

impl LlmGenerationResponse {
    pub fn ok(text: impl Into<String>, token_usage: Option<TokenUsage>) -> Self {
        Self {
            success: true,
            response_text: Some(text.into()),
            token_usage,
            error_message: None,
            safety_flagged: false,
            failure_kind: None,
        }
    }

    pub fn failure(error: &ProviderError) -> Self {
        Self {
            success: false,
            response_text: None,
            token_usage: None,
            error_message: Some(error.to_string()),
            safety_flagged: matches!(error, ProviderError::SafetyBlocked { .. }),
            failure_kind: Some(error.failure_kind()),
        }
    }
}

/// Provider-agnostic text generation. Implementations never panic or return
/// `Err`; failures are carried in the response with their classification.
pub trait LlmProviderAdapter: Send + Sync {
    fn provider(&self) -> LlmProviderKind;

    fn generate_content(&self, request: &LlmGenerationRequest) -> LlmGenerationResponse;
}
