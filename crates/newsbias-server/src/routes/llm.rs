//! Scoring routes — reanalysis trigger, progress stream, job listing, health.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use newsbias_runtime::{ProgressEvent, Subscription};

use crate::routes::error_response;
use crate::state::AppState;

type SseStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/llm/reanalyze/{id}", post(reanalyze))
        .route("/llm/score-progress/{id}", get(score_progress))
        .route("/llm/jobs", get(list_jobs))
        .route("/llm/health", get(health))
}

#[derive(Debug, Default, Deserialize)]
struct ReanalyzeRequest {
    #[serde(default)]
    force: bool,
    /// Scores come from the model ensemble; a caller-supplied one is rejected.
    #[serde(default)]
    score: Option<serde_json::Value>,
}

// ---------------------------------------------------------------
// Reanalyze
// ---------------------------------------------------------------

/// POST /api/llm/reanalyze/{id} — queue or join an analysis job.
async fn reanalyze(
    State(state): State<Arc<AppState>>,
    Path(article_id): Path<i64>,
    body: Bytes,
) -> (StatusCode, Json<serde_json::Value>) {
    // Empty body means defaults.
    let req: ReanalyzeRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ReanalyzeRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({
                        "success": false,
                        "error": format!("Invalid request body: {}", e),
                    })),
                )
            }
        }
    };

    if req.score.is_some() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "success": false,
                "error": "Invalid request body: score cannot be set directly",
            })),
        );
    }

    if !state.gateway.is_available() {
        warn!("Reanalysis of article {} refused: no provider available", article_id);
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "success": false,
                "error": "No scoring model provider is configured",
            })),
        );
    }

    match state.orchestrator.submit(article_id, req.force) {
        Ok(sub) => {
            let (status, label) = if sub.attached {
                (StatusCode::OK, "in_progress")
            } else {
                (StatusCode::ACCEPTED, "queued")
            };
            (
                status,
                Json(serde_json::json!({
                    "success": true,
                    "requestId": sub.request_id,
                    "status": label,
                })),
            )
        }
        Err(e) => error_response(&e),
    }
}

// ---------------------------------------------------------------
// Progress stream
// ---------------------------------------------------------------

/// GET /api/llm/score-progress/{id} — SSE relay of one article's job.
///
/// Reconnecting subscribes to the same job again. With no job registered a
/// single `Idle` message is sent and the stream ends.
async fn score_progress(
    State(state): State<Arc<AppState>>,
    Path(article_id): Path<i64>,
) -> Sse<KeepAliveStream<SseStream>> {
    let subscription = state.progress.subscribe(article_id);

    let stream: SseStream = match subscription {
        Subscription::NoSuchJob => {
            debug!("Progress requested for idle article {}", article_id);
            Box::pin(async_stream::stream! {
                let idle = serde_json::json!({
                    "step": "Idle",
                    "message": "No analysis running for this article",
                    "percent": 0,
                    "status": "Idle",
                });
                yield Ok::<_, Infallible>(Event::default().data(idle.to_string()));
            })
        }
        live_or_finished => {
            let mut events = live_or_finished.into_stream();
            Box::pin(async_stream::stream! {
                while let Some(ev) = events.next().await {
                    yield Ok::<_, Infallible>(to_sse(&ev));
                }
            })
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn to_sse(event: &ProgressEvent) -> Event {
    Event::default().data(serde_json::to_string(event).unwrap_or_default())
}

// ---------------------------------------------------------------
// Jobs / health
// ---------------------------------------------------------------

/// GET /api/llm/jobs — registry snapshot.
async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let jobs = state.progress.snapshot();
    Json(serde_json::json!({
        "success": true,
        "count": jobs.len(),
        "data": jobs,
    }))
}

/// GET /api/llm/health — roster and provider availability.
async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let available = state.gateway.is_available();
    let models: Vec<_> = state
        .gateway
        .roster()
        .iter()
        .map(|m| {
            serde_json::json!({
                "model": m.model_name,
                "perspective": m.perspective,
                "provider": m.provider.to_string(),
            })
        })
        .collect();

    Json(serde_json::json!({
        "success": true,
        "status": if available { "ok" } else { "unavailable" },
        "providersAvailable": available,
        "rosterSize": models.len(),
        "models": models,
        "providerTimeoutSecs": state.gateway.timeout().as_secs(),
    }))
}
