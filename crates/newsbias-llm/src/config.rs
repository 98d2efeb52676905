//! Model roster configuration (`models.json`).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{ModelSpec, ProviderKind};

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Perspectives used when no roster file exists.
pub const DEFAULT_PERSPECTIVES: &[&str] = &["left", "center", "right"];

/// Stored roster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRosterConfig {
    #[serde(default = "default_roster")]
    pub models: Vec<ModelSpec>,
    /// Key for the OpenAI-compatible endpoint.
    #[serde(default, rename = "apiKey", skip_serializing)]
    pub api_key: Option<String>,
    /// Fallback key for the same endpoint, used when `api_key` is rate limited.
    #[serde(default, rename = "apiKeySecondary", skip_serializing)]
    pub api_key_secondary: Option<String>,
    #[serde(default, rename = "anthropicApiKey", skip_serializing)]
    pub anthropic_api_key: Option<String>,
    /// Base URL of the OpenAI-compatible endpoint.
    #[serde(default, rename = "baseUrl")]
    pub base_url: Option<String>,
    #[serde(skip)]
    pub config_path: PathBuf,
}

fn default_roster() -> Vec<ModelSpec> {
    DEFAULT_PERSPECTIVES
        .iter()
        .map(|p| ModelSpec::new(DEFAULT_MODEL, Some(p), ProviderKind::OpenAi))
        .collect()
}

impl Default for ModelRosterConfig {
    fn default() -> Self {
        Self {
            models: default_roster(),
            api_key: None,
            api_key_secondary: None,
            anthropic_api_key: None,
            base_url: None,
            config_path: PathBuf::new(),
        }
    }
}

impl ModelRosterConfig {
    /// Load the roster from file, falling back to env vars and defaults.
    pub fn load(config_path: &Path) -> Self {
        let mut config = match std::fs::read_to_string(config_path) {
            Ok(s) => match serde_json::from_str::<ModelRosterConfig>(&s) {
                Ok(c) => c,
                Err(e) => {
                    warn!("Ignoring malformed roster {}: {}", config_path.display(), e);
                    ModelRosterConfig::default()
                }
            },
            Err(_) => ModelRosterConfig::default(),
        };

        config.config_path = config_path.to_path_buf();
        config.apply_env();

        info!(
            "Model roster: {} models, openai key={} (secondary={}), anthropic key={}",
            config.models.len(),
            config.api_key.is_some(),
            config.api_key_secondary.is_some(),
            config.anthropic_api_key.is_some()
        );

        config
    }

    // Env vars as fallback for keys and endpoint
    fn apply_env(&mut self) {
        if self.api_key.is_none() {
            self.api_key = env_nonempty("LLM_API_KEY").or_else(|| env_nonempty("OPENAI_API_KEY"));
        }
        if self.api_key_secondary.is_none() {
            self.api_key_secondary = env_nonempty("LLM_API_KEY_SECONDARY");
        }
        if self.anthropic_api_key.is_none() {
            self.anthropic_api_key = env_nonempty("ANTHROPIC_API_KEY");
        }
        if self.base_url.is_none() {
            self.base_url = env_nonempty("LLM_BASE_URL");
        }
    }

    pub fn openai_base_url(&self) -> &str {
        self.base_url.as_deref().unwrap_or(DEFAULT_OPENAI_BASE_URL)
    }

    /// Key configured for a provider family.
    pub fn key_for(&self, kind: ProviderKind) -> Option<&str> {
        match kind {
            ProviderKind::OpenAi => self.api_key.as_deref(),
            ProviderKind::Anthropic => self.anthropic_api_key.as_deref(),
        }
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
