use super::retry::{with_retries, RetryPolicy};
use super::{
    LlmGenerationRequest, LlmGenerationResponse, LlmProviderAdapter, LlmProviderKind,
    ProviderError, TokenUsage,
};
use crate::orchestration::delay::{Sleeper, ThreadSleeper};
use crate::shared::{HttpClient, HttpRequest};
use serde_json::{json, Map, Value};
use std::sync::Arc;

const PROVIDER: LlmProviderKind = LlmProviderKind::Gemini;

/// Google Gemini `generateContent` over REST.
pub struct GeminiAdapter {
    http: Arc<dyn HttpClient>,
    api_base: String,
    api_key: String,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl GeminiAdapter {
    pub fn new(
        http: Arc<dyn HttpClient>,
        api_base: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            http,
            api_base: api_base.into(),
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

    fn endpoint(&self, model_id: &str) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.api_base.trim_end_matches('/'),
            urlencoding::encode(model_id)
        )
    }

    fn request_body(request: &LlmGenerationRequest) -> Value {
        let mut generation = Map::new();
        if let Some(temperature) = request.temperature {
            generation.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(max_output_tokens) = request.max_output_tokens {
            generation.insert("maxOutputTokens".to_string(), json!(max_output_tokens));
        }
        if let Some(top_p) = request.top_p {
            generation.insert("topP".to_string(), json!(top_p));
        }
        if let Some(top_k) = request.top_k {
            generation.insert("topK".to_string(), json!(top_k));
        }
        if let Some(seed) = request.seed {
            generation.insert("seed".to_string(), json!(seed));
        }
        if request.json_output_mode {
            generation.insert(
                "responseMimeType".to_string(),
                json!("application/json"),
            );
        }

        let mut body = json!({
            "contents": [{"role": "user", "parts": [{"text": request.prompt}]}],
            "generationConfig": generation,
        });
        if let Some(system) = request
            .custom_config
            .get("systemInstruction")
            .and_then(Value::as_str)
        {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }
        if let Some(safety) = request.custom_config.get("safetySettings") {
            body["safetySettings"] = safety.clone();
        }
        body
    }

    fn call_once(
        &self,
        request: &LlmGenerationRequest,
    ) -> Result<(String, Option<TokenUsage>), ProviderError> {
        let http_request =
            HttpRequest::post_json(self.endpoint(&request.model_id), Self::request_body(request))
                .with_header("x-goog-api-key", self.api_key.clone())
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
        parse_generate_content(&payload)
    }
}

pub(crate) fn parse_generate_content(
    payload: &Value,
) -> Result<(String, Option<TokenUsage>), ProviderError> {
    if let Some(reason) = payload
        .pointer("/promptFeedback/blockReason")
        .and_then(Value::as_str)
    {
        return Err(ProviderError::SafetyBlocked {
            provider: PROVIDER,
            reason: format!("prompt blocked: {reason}"),
        });
    }
    let candidate = payload
        .pointer("/candidates/0")
        .ok_or_else(|| ProviderError::InvalidResponse {
            provider: PROVIDER,
            reason: "response has no candidates".to_string(),
        })?;
    if let Some(reason @ ("SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST")) =
        candidate.get("finishReason").and_then(Value::as_str)
    {
        return Err(ProviderError::SafetyBlocked {
            provider: PROVIDER,
            reason: format!("finish reason {reason}"),
        });
    }
    let text = candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    let usage = payload.get("usageMetadata").map(|usage| TokenUsage {
        input_tokens: usage
            .get("promptTokenCount")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        output_tokens: usage
            .get("candidatesTokenCount")
            .and_then(Value::as_u64)
            .unwrap_or(0),
    });
    Ok((text, usage))
}

impl LlmProviderAdapter for GeminiAdapter {
    fn provider(&self) -> LlmProviderKind {
        PROVIDER
    }

    fn generate_content(&self, request: &LlmGenerationRequest) -> LlmGenerationResponse {
        let outcome = with_retries(
            &self.retry,
            self.sleeper.as_ref(),
            "gemini.generateContent",
            |_| self.call_once(request),
        );
        match outcome {
            Ok((text, usage)) => LlmGenerationResponse::ok(text, usage),
            Err(err) => {
                tracing::warn!(
                    correlation_id = %request.correlation_id,
                    model_id = %request.model_id,
                    error = %err,
                    "gemini generation failed"
                );
                LlmGenerationResponse::failure(&err)
            }
        }
    }
}
