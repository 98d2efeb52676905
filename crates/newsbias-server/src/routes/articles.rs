//! Article score routes.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};

use newsbias_core::Error;

use crate::routes::error_response;
use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/articles/{id}/bias", get(get_bias))
        .route("/articles/{id}/ensemble", get(get_ensemble))
}

/// GET /api/articles/{id}/bias — current composite score.
async fn get_bias(
    State(state): State<Arc<AppState>>,
    Path(article_id): Path<i64>,
) -> (StatusCode, Json<serde_json::Value>) {
    let article = match state.store.get_article(article_id) {
        Ok(Some(a)) => a,
        Ok(None) => return error_response(&Error::NotFound(format!("article {}", article_id))),
        Err(e) => return error_response(&e),
    };

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "success": true,
            "data": {
                "article_id": article.id,
                "composite_score": article.composite_score,
                "confidence": article.confidence,
                "score_source": article.score_source,
                "status": article.status,
                "fail_count": article.fail_count,
                "escalated": article.escalated,
                "last_attempt": article.last_attempt,
            },
        })),
    )
}

/// GET /api/articles/{id}/ensemble — per-model breakdown of the latest run.
async fn get_ensemble(
    State(state): State<Arc<AppState>>,
    Path(article_id): Path<i64>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.store.get_article(article_id) {
        Ok(Some(_)) => {}
        Ok(None) => return error_response(&Error::NotFound(format!("article {}", article_id))),
        Err(e) => return error_response(&e),
    }

    let rows = match state.store.latest_run_scores(article_id) {
        Ok(r) => r,
        Err(e) => return error_response(&e),
    };

    if rows.is_empty() {
        return (
            StatusCode::OK,
            Json(serde_json::json!({"success": true, "data": []})),
        );
    }

    let aggregate = rows.iter().find(|r| r.is_ensemble());
    let sub_results: Vec<_> = rows
        .iter()
        .filter(|r| !r.is_ensemble())
        .map(|r| {
            serde_json::json!({
                "model": r.model,
                "perspective": r.perspective,
                "score": r.score,
                "confidence": r.confidence(),
                "explanation": r.explanation(),
            })
        })
        .collect();

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "success": true,
            "data": [{
                "version": rows[0].version,
                "created_at": rows[0].created_at,
                "final_score": aggregate.map(|a| a.score),
                "confidence": aggregate.map(|a| a.confidence()),
                "sub_results": sub_results,
            }],
        })),
    )
}
