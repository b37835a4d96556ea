use super::{LlmGenerationRequest, LlmGenerationResponse, LlmProviderAdapter, LlmProviderKind};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Scripted adapter. Queued responses are returned in order; once the queue
/// is empty the prompt is echoed back (as `{"prompt": ...}` in JSON mode).
#[derive(Debug, Default)]
pub struct MockLlmAdapter {
    responses: Mutex<VecDeque<LlmGenerationResponse>>,
    requests: Mutex<Vec<LlmGenerationRequest>>,
}

impl MockLlmAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(responses: impl IntoIterator<Item = LlmGenerationResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<LlmGenerationRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

impl LlmProviderAdapter for MockLlmAdapter {
    fn provider(&self) -> LlmProviderKind {
        LlmProviderKind::Mock
    }

    fn generate_content(&self, request: &LlmGenerationRequest) -> LlmGenerationResponse {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let scripted = self
            .responses
            .lock()
            .ok()
            .and_then(|mut responses| responses.pop_front());
        scripted.unwrap_or_else(|| {
            let text = if request.json_output_mode {
                serde_json::json!({"prompt": request.prompt}).to_string()
            } else {
                request.prompt.clone()
            };
            LlmGenerationResponse::ok(text, None)
        })
    }
}
