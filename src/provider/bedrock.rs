use super::retry::{with_retries, RetryPolicy};
use super::{
    LlmGenerationRequest, LlmGenerationResponse, LlmProviderAdapter, LlmProviderKind,
    ProviderError, TokenUsage,
};
use crate::orchestration::delay::{Sleeper, ThreadSleeper};
use crate::shared::{HttpClient, HttpRequest};
use serde_json::{json, Map, Value};
use std::sync::Arc;

const PROVIDER: LlmProviderKind = LlmProviderKind::Bedrock;

/// Amazon Bedrock Converse API, authenticated with a bearer API key.
pub struct BedrockAdapter {
    http: Arc<dyn HttpClient>,
    endpoint: String,
    api_key: String,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

pub fn default_endpoint(region: &str) -> String {
    format!("https://bedrock-runtime.{region}.amazonaws.com")
}

impl BedrockAdapter {
    pub fn new(
        http: Arc<dyn HttpClient>,
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            retry: RetryPolicy::default(),
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    fn request_body(request: &LlmGenerationRequest) -> Value {
        let mut inference = Map::new();
        if let Some(max_tokens) = request.max_output_tokens {
            inference.insert("maxTokens".to_string(), json!(max_tokens));
        }
        if let Some(temperature) = request.temperature {
            inference.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(top_p) = request.top_p {
            inference.insert("topP".to_string(), json!(top_p));
        }

        let mut body = json!({
            "messages": [{"role": "user", "content": [{"text": request.prompt}]}],
            "inferenceConfig": inference,
        });
        if let Some(top_k) = request.top_k {
            body["additionalModelRequestFields"] = json!({"top_k": top_k});
        }
        if let Some(system) = request
            .custom_config
            .get("systemInstruction")
            .and_then(Value::as_str)
        {
            body["system"] = json!([{"text": system}]);
        }
        body
    }

    fn call_once(
        &self,
        request: &LlmGenerationRequest,
    ) -> Result<(String, Option<TokenUsage>), ProviderError> {
        let url = format!(
            "{}/model/{}/converse",
            self.endpoint.trim_end_matches('/'),
            urlencoding::encode(&request.model_id)
        );
        let http_request = HttpRequest::post_json(url, Self::request_body(request))
            .with_header("Authorization", format!("Bearer {}", self.api_key))
            .with_header("Content-Type", "application/json");
        let response = self
            .http
            .send(&http_request)
            .map_err(|err| ProviderError::Transport {
                provider: PROVIDER,
                reason: err.to_string(),
            })?;
        if !response.is_success() {
            return Err(ProviderError::Http {
                provider: PROVIDER,
                status: response.status,
                body: response.body,
            });
        }
        let payload = response.json().ok_or_else(|| ProviderError::InvalidResponse {
            provider: PROVIDER,
            reason: "body is not JSON".to_string(),
        })?;
        parse_converse(&payload)
    }
}

pub(crate) fn parse_converse(
    payload: &Value,
) -> Result<(String, Option<TokenUsage>), ProviderError> {
    if let Some(reason @ ("guardrail_intervened" | "content_filtered")) =
        payload.get("stopReason").and_then(Value::as_str)
    {
        return Err(ProviderError::SafetyBlocked {
            provider: PROVIDER,
            reason: format!("stop reason {reason}"),
        });
    }
    let parts = payload
        .pointer("/output/message/content")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::InvalidResponse {
            provider: PROVIDER,
            reason: "response has no output message".to_string(),
        })?;
    let text = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("");
    let usage = payload.get("usage").map(|usage| TokenUsage {
        input_tokens: usage.get("inputTokens").and_then(Value::as_u64).unwrap_or(0),
        output_tokens: usage.get("outputTokens").and_then(Value::as_u64).unwrap_or(0),
    });
    Ok((text, usage))
}

impl LlmProviderAdapter for BedrockAdapter {
    fn provider(&self) -> LlmProviderKind {
        PROVIDER
    }

    fn generate_content(&self, request: &LlmGenerationRequest) -> LlmGenerationResponse {
        let outcome = with_retries(&self.retry, self.sleeper.as_ref(), "bedrock.converse", |_| {
            self.call_once(request)
        });
        match outcome {
            Ok((text, usage)) => LlmGenerationResponse::ok(text, usage),
            Err(err) => {
                tracing::warn!(
                    correlation_id = %request.correlation_id,
                    model_id = %request.model_id,
                    error = %err,
                    "bedrock generation failed"
                );
                LlmGenerationResponse::failure(&err)
            }
        }
    }
}
