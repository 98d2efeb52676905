//! HTTP route handlers.

pub mod articles;
pub mod llm;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::{Json, Router};
use newsbias_core::Error;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the main Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api", api_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .merge(llm::routes())
        .merge(articles::routes())
}

/// `{success: false, error}` with a status matching the error kind.
pub(crate) fn error_response(err: &Error) -> (StatusCode, Json<serde_json::Value>) {
    let status = match err {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Escalated(_) | Error::JobAlreadyRunning(_) => StatusCode::CONFLICT,
        Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({
            "success": false,
            "error": err.to_string(),
        })),
    )
}
