pub mod anthropic;
pub mod openai;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::config::ProviderConfig;
use crate::error::ProviderError;

/// One bounded inference request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    /// JSON Schema the structured payload must follow.
    pub schema: serde_json::Value,
    pub timeout: Duration,
}

/// An inference backend that turns a prompt into a structured JSON payload.
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> std::result::Result<serde_json::Value, ProviderError>;
}

/// A provider behind a concurrency cap shared by every run.
pub struct ThrottledProvider {
    inner: Arc<dyn CapabilityProvider>,
    permits: Arc<Semaphore>,
    max_concurrency: usize,
}

impl ThrottledProvider {
    pub fn new(inner: Arc<dyn CapabilityProvider>, max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            inner,
            permits: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Calls currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.max_concurrency - self.permits.available_permits()
    }

    pub async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> std::result::Result<serde_json::Value, ProviderError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ProviderError::Unavailable("provider shut down".to_string()))?;

        tracing::debug!(provider = self.name(), "Provider permit acquired");

        // The timeout covers the call itself, not the wait for a permit.
        match tokio::time::timeout(request.timeout, self.inner.complete(request)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Unavailable(format!(
                "timed out after {}ms",
                request.timeout.as_millis()
            ))),
        }
    }
}

/// Named providers, built once at startup and shared by all runs.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<ThrottledProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(configs: &HashMap<String, ProviderConfig>) -> Self {
        let mut registry = Self::new();
        for (name, config) in configs {
            let provider: Arc<dyn CapabilityProvider> = match config {
                ProviderConfig::Anthropic {
                    api_key,
                    model,
                    max_tokens,
                    base_url,
                    ..
                } => Arc::new(anthropic::AnthropicProvider::new(
                    name,
                    api_key,
                    model,
                    *max_tokens,
                    base_url.as_deref(),
                )),
                ProviderConfig::OpenAi {
                    api_key,
                    model,
                    base_url,
                    ..
                } => Arc::new(openai::OpenAiProvider::new(
                    name,
                    api_key,
                    model,
                    base_url.as_deref(),
                )),
            };
            tracing::info!(
                provider = %name,
                max_concurrency = config.max_concurrency(),
                "Registered capability provider"
            );
            registry.register(name, provider, config.max_concurrency());
        }
        registry
    }

    pub fn register(
        &mut self,
        name: &str,
        provider: Arc<dyn CapabilityProvider>,
        max_concurrency: usize,
    ) {
        self.providers.insert(
            name.to_string(),
            Arc::new(ThrottledProvider::new(provider, max_concurrency)),
        );
    }

    pub fn get(&self, name: &str) -> Option<Arc<ThrottledProvider>> {
        self.providers.get(name).cloned()
    }
}
