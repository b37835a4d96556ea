use super::bedrock::{default_endpoint, BedrockAdapter};
use super::gemini::GeminiAdapter;
use super::mock::MockLlmAdapter;
use super::retry::RetryPolicy;
use super::{LlmProviderAdapter, LlmProviderKind, ProviderError};
use crate::config::ProviderSettings;
use crate::shared::HttpClient;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type KeyLookup = dyn Fn(&str) -> Option<String> + Send + Sync;

/// Builds provider adapters on first use and caches them for the lifetime of
/// the factory. Owned by whoever composes the process.
pub struct LlmAdapterFactory {
    settings: ProviderSettings,
    http: Arc<dyn HttpClient>,
    key_lookup: Arc<KeyLookup>,
    cache: Mutex<HashMap<LlmProviderKind, Arc<dyn LlmProviderAdapter>>>,
}

impl LlmAdapterFactory {
    pub fn new(settings: ProviderSettings, http: Arc<dyn HttpClient>) -> Self {
        Self {
            settings,
            http,
            key_lookup: Arc::new(|name: &str| std::env::var(name).ok()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_key_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.key_lookup = Arc::new(lookup);
        self
    }

    /// Pre-seeds the cache, bypassing construction for `kind`.
    pub fn with_adapter(self, kind: LlmProviderKind, adapter: Arc<dyn LlmProviderAdapter>) -> Self {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(kind, adapter);
        }
        self
    }

    pub fn adapter(
        &self,
        kind: LlmProviderKind,
    ) -> Result<Arc<dyn LlmProviderAdapter>, ProviderError> {
        let mut cache = self.cache.lock().map_err(|_| ProviderError::Transport {
            provider: kind,
            reason: "adapter cache lock poisoned".to_string(),
        })?;
        if let Some(adapter) = cache.get(&kind) {
            return Ok(Arc::clone(adapter));
        }
        let adapter = self.build(kind)?;
        tracing::debug!(provider = %kind, "constructed llm adapter");
        cache.insert(kind, Arc::clone(&adapter));
        Ok(adapter)
    }

    pub fn adapter_for(
        &self,
        provider: &str,
    ) -> Result<Arc<dyn LlmProviderAdapter>, ProviderError> {
        self.adapter(LlmProviderKind::try_from(provider)?)
    }

    pub fn cached_count(&self) -> usize {
        self.cache.lock().map(|cache| cache.len()).unwrap_or(0)
    }

    fn api_key(&self, kind: LlmProviderKind, env: &str) -> Result<String, ProviderError> {
        (self.key_lookup)(env)
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| ProviderError::MissingApiKey {
                provider: kind,
                env: env.to_string(),
            })
    }

    fn build(&self, kind: LlmProviderKind) -> Result<Arc<dyn LlmProviderAdapter>, ProviderError> {
        let retry = RetryPolicy::from(&self.settings.retry);
        Ok(match kind {
            LlmProviderKind::Gemini => {
                let gemini = &self.settings.gemini;
                let key = self.api_key(kind, &gemini.api_key_env)?;
                Arc::new(
                    GeminiAdapter::new(Arc::clone(&self.http), gemini.api_base.clone(), key)
                        .with_retry_policy(retry),
                )
            }
            LlmProviderKind::Bedrock => {
                let bedrock = &self.settings.bedrock;
                let key = self.api_key(kind, &bedrock.api_key_env)?;
                let endpoint = bedrock
                    .endpoint
                    .clone()
                    .unwrap_or_else(|| default_endpoint(&bedrock.region));
                Arc::new(
                    BedrockAdapter::new(Arc::clone(&self.http), endpoint, key)
                        .with_retry_policy(retry),
                )
            }
            LlmProviderKind::Mock => Arc::new(MockLlmAdapter::new()),
        })
    }
}
