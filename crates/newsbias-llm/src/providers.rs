//! Provider implementations.
//!
//! OpenAI-compatible endpoints (OpenAI, OpenRouter, Groq) share one
//! implementation. Anthropic uses its Messages API. Both ask the model for a
//! JSON verdict `{score, confidence, explanation}` and make a single
//! non-streaming request per call. An OpenAI-compatible provider with a
//! secondary key falls back to it once when the primary key hits a 429.

use futures::future::BoxFuture;
use reqwest::{Client, Response, StatusCode};
use serde_json::json;
use tracing::{debug, warn};

use crate::types::{ModelOutput, ModelSpec, ProviderError, ProviderKind};

/// Article text beyond this many characters is not sent to the model.
pub const MAX_ARTICLE_CHARS: usize = 12_000;

const MAX_TOKENS: u32 = 400;
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// A provider family capable of scoring article text with a named model.
pub trait ScoreProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn invoke<'a>(
        &'a self,
        model: &'a ModelSpec,
        article_text: &'a str,
    ) -> BoxFuture<'a, Result<ModelOutput, ProviderError>>;
}

// ---------------------------------------------------------------
// OpenAI-compatible
// ---------------------------------------------------------------

pub struct OpenAiCompatProvider {
    client: Client,
    base_url: String,
    api_key: String,
    secondary_key: Option<String>,
}

impl OpenAiCompatProvider {
    pub fn new(client: Client, base_url: &str, api_key: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            secondary_key: None,
        }
    }

    /// Key tried once when the primary key is rate limited.
    pub fn with_secondary_key(mut self, key: Option<&str>) -> Self {
        self.secondary_key = key.map(str::to_string);
        self
    }

    async fn score_with_key(
        &self,
        api_key: &str,
        model: &ModelSpec,
        article_text: &str,
    ) -> Result<ModelOutput, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": model.model_name,
            "messages": [
                {"role": "system", "content": system_prompt(model.perspective.as_deref())},
                {"role": "user", "content": truncate_article(article_text)},
            ],
            "temperature": 0.0,
            "max_tokens": MAX_TOKENS,
        });

        debug!("Scoring via {} with model {}", url, model.model_name);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("Request failed: {}", e)))?;

        let parsed = read_json(response).await?;
        let content = parsed["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| ProviderError::InvalidResponse("no message content".into()))?;
        parse_model_output(content)
    }
}

impl ScoreProvider for OpenAiCompatProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn invoke<'a>(
        &'a self,
        model: &'a ModelSpec,
        article_text: &'a str,
    ) -> BoxFuture<'a, Result<ModelOutput, ProviderError>> {
        Box::pin(async move {
            let primary = self.score_with_key(&self.api_key, model, article_text).await;
            let limited = matches!(primary, Err(ProviderError::RateLimited { .. }));
            match self.secondary_key.as_deref() {
                Some(key) if limited => {
                    warn!(
                        "Primary key rate limited for {}, retrying with secondary key",
                        model.model_name
                    );
                    self.score_with_key(key, model, article_text).await
                }
                _ => primary,
            }
        })
    }
}

// ---------------------------------------------------------------
// Anthropic
// ---------------------------------------------------------------

pub struct AnthropicProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl AnthropicProvider {
    pub fn new(client: Client, base_url: &str, api_key: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }
}

impl ScoreProvider for AnthropicProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn invoke<'a>(
        &'a self,
        model: &'a ModelSpec,
        article_text: &'a str,
    ) -> BoxFuture<'a, Result<ModelOutput, ProviderError>> {
        Box::pin(async move {
            let url = format!("{}/messages", self.base_url);
            let body = json!({
                "model": model.model_name,
                "system": system_prompt(model.perspective.as_deref()),
                "messages": [{"role": "user", "content": truncate_article(article_text)}],
                "temperature": 0.0,
                "max_tokens": MAX_TOKENS,
            });

            debug!("Scoring via Anthropic with model {}", model.model_name);

            let response = self
                .client
                .post(&url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body)
                .send()
                .await
                .map_err(|e| ProviderError::Unavailable(format!("Request failed: {}", e)))?;

            let parsed = read_json(response).await?;
            let content = parsed["content"]
                .as_array()
                .and_then(|blocks| blocks.iter().find_map(|b| b["text"].as_str()))
                .ok_or_else(|| ProviderError::InvalidResponse("no text block".into()))?;
            parse_model_output(content)
        })
    }
}

// ---------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------

async fn read_json(response: Response) -> Result<serde_json::Value, ProviderError> {
    let status = response.status();
    if !status.is_success() {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(status, retry_after, &body));
    }

    response
        .json::<serde_json::Value>()
        .await
        .map_err(|e| ProviderError::InvalidResponse(e.to_string()))
}

/// Map a non-success HTTP status to a provider error.
pub fn classify_status(status: StatusCode, retry_after: Option<u64>, body: &str) -> ProviderError {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| status.to_string());

    match status.as_u16() {
        429 => ProviderError::RateLimited { retry_after },
        401 | 403 => ProviderError::Unauthorized(message),
        402 => ProviderError::Unavailable(format!("credits exhausted: {}", message)),
        _ => ProviderError::Unavailable(format!("API error {}: {}", status.as_u16(), message)),
    }
}

/// Extract the `{score, confidence, explanation}` object from model text.
///
/// Models often wrap the object in prose or code fences, so everything
/// outside the outermost braces is ignored.
pub fn parse_model_output(content: &str) -> Result<ModelOutput, ProviderError> {
    let start = content.find('{');
    let end = content.rfind('}');
    let json_str = match (start, end) {
        (Some(s), Some(e)) if e > s => &content[s..=e],
        _ => {
            return Err(ProviderError::InvalidResponse(format!(
                "no JSON object in model output: {}",
                preview(content)
            )))
        }
    };

    serde_json::from_str::<ModelOutput>(json_str)
        .map_err(|e| ProviderError::InvalidResponse(format!("{}: {}", e, preview(content))))
}

pub fn system_prompt(perspective: Option<&str>) -> String {
    let lens = match perspective {
        Some(p) => format!(" Read the article from a {} perspective.", p),
        None => String::new(),
    };
    format!(
        "You rate the political bias of news articles.{} \
         Respond with only a JSON object: \
         {{\"score\": <number from -1.0 (strongly left) to 1.0 (strongly right), 0 is neutral>, \
         \"confidence\": <number from 0.0 to 1.0>, \
         \"explanation\": <one or two sentences>}}",
        lens
    )
}

fn truncate_article(text: &str) -> String {
    text.chars().take(MAX_ARTICLE_CHARS).collect()
}

fn preview(s: &str) -> String {
    s.chars().take(120).collect()
}
