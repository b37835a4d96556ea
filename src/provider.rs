pub mod bedrock;
pub mod factory;
pub mod gemini;
pub mod mock;
pub mod output_parse;
pub mod retry;
pub mod types;

pub use bedrock::BedrockAdapter;
pub use factory::LlmAdapterFactory;
pub use gemini::GeminiAdapter;
pub use mock::MockLlmAdapter;
pub use output_parse::parse_strict_json;
pub use retry::{backoff_delay, with_retries, RetryPolicy};
pub use types::{
    FailureKind, LlmGenerationRequest, LlmGenerationResponse, LlmProviderAdapter,
    LlmProviderKind, ProviderError, TokenUsage,
};
