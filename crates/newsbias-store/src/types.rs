//! Data types for articles and model scores.

use serde::{Deserialize, Serialize};

/// Model name used for the aggregate row written at the end of a run.
pub const ENSEMBLE_MODEL: &str = "ensemble";

/// Processing status of an article (`articles.status`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArticleStatus {
    Pending,
    Processing,
    Processed,
    Failed,
    Escalated,
}

impl ArticleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArticleStatus::Pending => "pending",
            ArticleStatus::Processing => "processing",
            ArticleStatus::Processed => "processed",
            ArticleStatus::Failed => "failed",
            ArticleStatus::Escalated => "escalated",
        }
    }

    /// Parse a stored status. Unknown values map to `Pending`.
    pub fn parse(s: &str) -> Self {
        match s {
            "processing" => ArticleStatus::Processing,
            "processed" => ArticleStatus::Processed,
            "failed" => ArticleStatus::Failed,
            "escalated" => ArticleStatus::Escalated,
            _ => ArticleStatus::Pending,
        }
    }
}

impl std::fmt::Display for ArticleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an article's composite score came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreSource {
    Llm,
    Manual,
}

impl ScoreSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreSource::Llm => "llm",
            ScoreSource::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "llm" => Some(ScoreSource::Llm),
            "manual" => Some(ScoreSource::Manual),
            _ => None,
        }
    }
}

/// An article row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub id: i64,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub content: String,
    pub status: ArticleStatus,
    pub fail_count: u32,
    /// Unix millis of the last analysis attempt.
    pub last_attempt: Option<i64>,
    pub escalated: bool,
    pub composite_score: Option<f64>,
    pub confidence: Option<f64>,
    pub score_source: Option<ScoreSource>,
    pub created_at: i64,
}

/// Fields needed to insert an article.
#[derive(Debug, Clone, Default)]
pub struct NewArticle {
    pub title: String,
    pub url: Option<String>,
    pub content: String,
}

/// One row of the append-only score history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelScore {
    pub id: i64,
    pub article_id: i64,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub perspective: Option<String>,
    pub score: f64,
    /// Carries at least `confidence`, optionally `explanation`.
    pub metadata: serde_json::Value,
    pub version: i64,
    pub created_at: i64,
}

impl ModelScore {
    pub fn confidence(&self) -> f64 {
        self.metadata
            .get("confidence")
            .and_then(|c| c.as_f64())
            .unwrap_or(0.0)
    }

    pub fn explanation(&self) -> Option<&str> {
        self.metadata.get("explanation").and_then(|e| e.as_str())
    }

    pub fn is_ensemble(&self) -> bool {
        self.model == ENSEMBLE_MODEL
    }
}

/// Fields needed to append a score row.
#[derive(Debug, Clone)]
pub struct NewModelScore {
    pub article_id: i64,
    pub model: String,
    pub perspective: Option<String>,
    pub score: f64,
    pub metadata: serde_json::Value,
    pub version: i64,
}

/// Retry bookkeeping persisted at the end of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bookkeeping {
    pub status: ArticleStatus,
    pub fail_count: u32,
    pub escalated: bool,
}

/// Aggregate result written together with the bookkeeping of a successful run.
#[derive(Debug, Clone)]
pub struct AggregateUpdate {
    pub composite_score: f64,
    pub confidence: f64,
    pub version: i64,
    /// Number of model scores that contributed.
    pub contributing: usize,
}
