//! Model provider gateway: roster plus one provider per configured family.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tracing::{debug, warn};

use crate::config::{ModelRosterConfig, DEFAULT_ANTHROPIC_BASE_URL};
use crate::providers::{AnthropicProvider, OpenAiCompatProvider, ScoreProvider};
use crate::types::{ModelOutput, ModelSpec, ProviderError, ProviderKind};

/// Extra attempts per model after a transient failure.
pub const DEFAULT_MAX_RETRIES: u32 = 2;
/// Wait before the first retry; doubles for each one after.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Routes each roster model to its provider and bounds every call with a timeout.
pub struct Gateway {
    roster: Vec<ModelSpec>,
    providers: HashMap<ProviderKind, Arc<dyn ScoreProvider>>,
    timeout: Duration,
    max_retries: u32,
    retry_backoff: Duration,
}

impl Gateway {
    /// Empty gateway; register providers with [`Gateway::with_provider`].
    pub fn new(roster: Vec<ModelSpec>, timeout: Duration) -> Self {
        Self {
            roster,
            providers: HashMap::new(),
            timeout,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    /// Build HTTP providers for every family that has a key.
    pub fn from_config(config: &ModelRosterConfig, timeout: Duration) -> Self {
        let client = Client::new();
        let mut gateway = Self::new(config.models.clone(), timeout);

        if let Some(key) = config.key_for(ProviderKind::OpenAi) {
            gateway = gateway.with_provider(Arc::new(
                OpenAiCompatProvider::new(client.clone(), config.openai_base_url(), key)
                    .with_secondary_key(config.api_key_secondary.as_deref()),
            ));
        }
        if let Some(key) = config.key_for(ProviderKind::Anthropic) {
            gateway = gateway.with_provider(Arc::new(AnthropicProvider::new(
                client,
                DEFAULT_ANTHROPIC_BASE_URL,
                key,
            )));
        }

        for model in &gateway.roster {
            if !gateway.providers.contains_key(&model.provider) {
                warn!(
                    "Model {} needs {} credentials, none configured",
                    model.model_name, model.provider
                );
            }
        }

        gateway
    }

    pub fn with_provider(mut self, provider: Arc<dyn ScoreProvider>) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    pub fn with_retries(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff = backoff;
        self
    }

    pub fn roster(&self) -> &[ModelSpec] {
        &self.roster
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// True when at least one roster model can be served.
    pub fn is_available(&self) -> bool {
        self.roster
            .iter()
            .any(|m| self.providers.contains_key(&m.provider))
    }

    /// Score `article_text` with one roster model.
    ///
    /// Transient failures and zero-confidence answers are retried up to
    /// `max_retries` times. The timeout covers every attempt together.
    pub async fn invoke(&self, model: &ModelSpec, article_text: &str) -> Result<ModelOutput, ProviderError> {
        let provider = self.providers.get(&model.provider).ok_or_else(|| {
            ProviderError::Unauthorized(format!("no credentials configured for {}", model.provider))
        })?;

        let attempts = self.invoke_with_retries(&**provider, model, article_text);
        tokio::time::timeout(self.timeout, attempts)
            .await
            .map_err(|_| ProviderError::Timeout(self.timeout))?
    }

    async fn invoke_with_retries(
        &self,
        provider: &dyn ScoreProvider,
        model: &ModelSpec,
        article_text: &str,
    ) -> Result<ModelOutput, ProviderError> {
        let mut attempt = 0u32;
        loop {
            let result = provider.invoke(model, article_text).await;
            let retry_reason = match &result {
                Ok(output) if output.confidence == 0.0 => Some("zero confidence".to_string()),
                Err(e) if e.is_retryable() => Some(e.to_string()),
                _ => None,
            };
            let Some(reason) = retry_reason else {
                return result;
            };
            if attempt >= self.max_retries {
                return result;
            }

            attempt += 1;
            debug!(
                "Model {} attempt {} unusable ({}), retrying",
                model.model_name, attempt, reason
            );
            if !self.retry_backoff.is_zero() {
                tokio::time::sleep(self.retry_backoff * 2u32.pow(attempt - 1)).await;
            }
        }
    }
}
