//! Roster entries, model verdicts and provider errors.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Provider family serving a roster model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    /// Any endpoint speaking the OpenAI chat completions API (OpenAI, OpenRouter, Groq).
    #[default]
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "anthropic")]
    Anthropic,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::OpenAi => write!(f, "openai"),
            ProviderKind::Anthropic => write!(f, "anthropic"),
        }
    }
}

/// One model in the scoring roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    #[serde(rename = "modelName")]
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perspective: Option<String>,
    #[serde(default)]
    pub provider: ProviderKind,
}

impl ModelSpec {
    pub fn new(model_name: impl Into<String>, perspective: Option<&str>, provider: ProviderKind) -> Self {
        Self {
            model_name: model_name.into(),
            perspective: perspective.map(str::to_string),
            provider,
        }
    }
}

/// A model's verdict on one article.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelOutput {
    /// Bias score, -1.0 (left) to 1.0 (right).
    pub score: f64,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub explanation: String,
}

/// Failure of a single provider call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("rate limited (retry after {retry_after:?}s)")]
    RateLimited { retry_after: Option<u64> },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ProviderError::RateLimited { .. })
    }

    /// Transient failures worth another attempt with the same model.
    /// Rate limits and bad credentials are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Unavailable(_) | ProviderError::InvalidResponse(_)
        )
    }

    /// Short machine-readable tag carried in progress metadata.
    pub fn error_type(&self) -> &'static str {
        match self {
            ProviderError::RateLimited { .. } => "rate_limit",
            ProviderError::Unauthorized(_) => "authentication",
            ProviderError::Unavailable(_) => "provider_unavailable",
            ProviderError::Timeout(_) => "timeout",
            ProviderError::InvalidResponse(_) => "invalid_response",
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            ProviderError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}
