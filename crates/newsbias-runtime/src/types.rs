//! Runtime types.

use serde::{Deserialize, Serialize};

/// Status of a progress event. Everything but `InProgress` ends a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressStatus {
    InProgress,
    Success,
    Error,
    RateLimited,
}

impl ProgressStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProgressStatus::InProgress)
    }
}

/// One update pushed to the subscribers of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub step: String,
    pub message: String,
    /// 0-100, never decreasing within a job.
    pub percent: u8,
    pub status: ProgressStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ProgressEvent {
    pub fn in_progress(step: &str, message: impl Into<String>, percent: u8) -> Self {
        Self {
            step: step.to_string(),
            message: message.into(),
            percent,
            status: ProgressStatus::InProgress,
            metadata: None,
        }
    }

    /// Terminal success. `final_score` is `null` when no composite exists yet.
    pub fn success(message: impl Into<String>, metadata: serde_json::Value) -> Self {
        Self {
            step: "Complete".into(),
            message: message.into(),
            percent: 100,
            status: ProgressStatus::Success,
            metadata: Some(metadata),
        }
    }

    pub fn error(message: impl Into<String>, metadata: Option<serde_json::Value>) -> Self {
        Self {
            step: "Error".into(),
            message: message.into(),
            percent: 0,
            status: ProgressStatus::Error,
            metadata,
        }
    }

    pub fn rate_limited(message: impl Into<String>, metadata: Option<serde_json::Value>) -> Self {
        Self {
            step: "RateLimited".into(),
            message: message.into(),
            percent: 0,
            status: ProgressStatus::RateLimited,
            metadata,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Lifecycle of a registered job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

/// Point-in-time view of one registry entry.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub article_id: i64,
    pub state: JobState,
    pub request_id: String,
    /// Unix millis.
    pub started_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event: Option<ProgressEvent>,
}

/// Outcome class of one run, as seen by the retry state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    RateLimited,
    Failed,
}

/// Result of an analysis, reconstructed from the job's terminal event.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisOutcome {
    Success {
        final_score: Option<f64>,
        score_updated: bool,
    },
    RateLimited {
        retry_after: Option<u64>,
    },
    Failed {
        message: String,
    },
}

impl AnalysisOutcome {
    pub fn from_terminal(event: &ProgressEvent) -> Self {
        let meta = event.metadata.as_ref();
        match event.status {
            ProgressStatus::Success => AnalysisOutcome::Success {
                final_score: meta.and_then(|m| m["final_score"].as_f64()),
                score_updated: meta
                    .and_then(|m| m["score_updated"].as_bool())
                    .unwrap_or(false),
            },
            ProgressStatus::RateLimited => AnalysisOutcome::RateLimited {
                retry_after: meta.and_then(|m| m["retry_after"].as_u64()),
            },
            ProgressStatus::Error | ProgressStatus::InProgress => AnalysisOutcome::Failed {
                message: event.message.clone(),
            },
        }
    }

    pub fn kind(&self) -> RunOutcome {
        match self {
            AnalysisOutcome::Success { .. } => RunOutcome::Success,
            AnalysisOutcome::RateLimited { .. } => RunOutcome::RateLimited,
            AnalysisOutcome::Failed { .. } => RunOutcome::Failed,
        }
    }
}

/// Answer to a reanalysis request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub request_id: String,
    /// True when the request joined a job that was already running.
    pub attached: bool,
}

/// Counts from one retry sweep tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub candidates: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub rate_limited: usize,
    pub skipped: usize,
}
