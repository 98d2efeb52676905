//! Route tests — drive the router in-process with scripted providers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use futures::future::BoxFuture;
use tempfile::TempDir;
use tower::ServiceExt;

use newsbias_core::ServiceConfig;
use newsbias_llm::{Gateway, ModelOutput, ModelSpec, ProviderError, ProviderKind, ScoreProvider};
use newsbias_server::{build_router, AppState};
use newsbias_store::{ArticleStatus, Bookkeeping, NewArticle, SqliteStore};

struct Scripted {
    score: f64,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScoreProvider for Scripted {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn invoke<'a>(
        &'a self,
        model: &'a ModelSpec,
        _article_text: &'a str,
    ) -> BoxFuture<'a, Result<ModelOutput, ProviderError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if model.model_name == "flaky" {
                return Err(ProviderError::RateLimited { retry_after: Some(5) });
            }
            Ok(ModelOutput {
                score: self.score,
                confidence: 0.8,
                explanation: format!("{} says so", model.model_name),
            })
        })
    }
}

struct Harness {
    app: Router,
    state: Arc<AppState>,
    provider: Arc<Scripted>,
    _dir: TempDir,
}

fn harness_with(delay: Duration, with_provider: bool) -> Harness {
    let dir = TempDir::new().unwrap();
    let config = ServiceConfig::from_env(dir.path()).unwrap();
    let store = SqliteStore::open(&config.data_paths.database).unwrap();
    let provider = Arc::new(Scripted {
        score: -0.5,
        delay,
        calls: AtomicUsize::new(0),
    });
    let roster = vec![
        ModelSpec::new("steady", Some("left"), ProviderKind::OpenAi),
        ModelSpec::new("flaky", Some("right"), ProviderKind::OpenAi),
    ];
    let mut gateway = Gateway::new(roster, Duration::from_secs(5));
    if with_provider {
        gateway = gateway.with_provider(provider.clone() as Arc<dyn ScoreProvider>);
    }
    let state = Arc::new(AppState::new(config, store, gateway));
    Harness {
        app: build_router(state.clone()),
        state,
        provider,
        _dir: dir,
    }
}

fn harness() -> Harness {
    harness_with(Duration::ZERO, true)
}

fn add_article(state: &AppState) -> i64 {
    state
        .store
        .insert_article(NewArticle {
            title: "Tax bill".into(),
            url: Some("https://news.example/tax".into()),
            content: "Lawmakers debated the tax bill for hours.".into(),
        })
        .unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, String) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

async fn post_json(app: &Router, uri: &str, body: &str) -> (StatusCode, serde_json::Value) {
    let req = Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let (status, text) = send(app, req).await;
    (status, serde_json::from_str(&text).unwrap())
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let (status, text) = send(app, Request::get(uri).body(Body::empty()).unwrap()).await;
    (status, serde_json::from_str(&text).unwrap())
}

/// Parse the `data:` lines of an SSE body.
fn sse_events(body: &str) -> Vec<serde_json::Value> {
    body.lines()
        .filter_map(|l| l.strip_prefix("data:"))
        .filter_map(|d| serde_json::from_str(d.trim()).ok())
        .collect()
}

async fn wait_finished(state: &AppState, article_id: i64) {
    let _ = state.progress.subscribe(article_id).wait_terminal().await;
}

#[tokio::test]
async fn test_reanalyze_then_read_scores() {
    let h = harness();
    let id = add_article(&h.state);

    let (status, body) = post_json(&h.app, &format!("/api/llm/reanalyze/{}", id), "{}").await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["success"], true);
    assert!(body["requestId"].as_str().is_some_and(|s| !s.is_empty()));

    wait_finished(&h.state, id).await;

    let (status, bias) = get_json(&h.app, &format!("/api/articles/{}/bias", id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bias["data"]["composite_score"], -0.5);
    assert_eq!(bias["data"]["score_source"], "llm");
    assert_eq!(bias["data"]["status"], "processed");

    let (status, ensemble) = get_json(&h.app, &format!("/api/articles/{}/ensemble", id)).await;
    assert_eq!(status, StatusCode::OK);
    let run = &ensemble["data"][0];
    assert_eq!(run["final_score"], -0.5);
    let subs = run["sub_results"].as_array().unwrap();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0]["model"], "steady");
    assert_eq!(subs[0]["perspective"], "left");
    assert_eq!(subs[0]["confidence"], 0.8);
    assert_eq!(subs[0]["explanation"], "steady says so");
}

#[tokio::test]
async fn test_reanalyze_empty_body_defaults() {
    let h = harness();
    let id = add_article(&h.state);
    let req = Request::post(format!("/api/llm/reanalyze/{}", id))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    wait_finished(&h.state, id).await;
}

#[tokio::test]
async fn test_reanalyze_unknown_article() {
    let h = harness();
    let (status, body) = post_json(&h.app, "/api/llm/reanalyze/999", "{}").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_reanalyze_bad_body() {
    let h = harness();
    let id = add_article(&h.state);
    let (status, text) = send(
        &h.app,
        Request::post(format!("/api/llm/reanalyze/{}", id))
            .body(Body::from("{force: yes"))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(text.contains("Invalid request body"));
}

#[tokio::test]
async fn test_reanalyze_rejects_score_override() {
    let h = harness();
    let id = add_article(&h.state);
    let (status, body) = post_json(
        &h.app,
        &format!("/api/llm/reanalyze/{}", id),
        r#"{"force": true, "score": 0.9}"#,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(h.provider.calls.load(Ordering::SeqCst), 0);
    assert!(!h.state.progress.is_running(id));
}

#[tokio::test]
async fn test_reanalyze_without_providers_is_unavailable() {
    let h = harness_with(Duration::ZERO, false);
    let id = add_article(&h.state);
    let (status, _) = post_json(&h.app, &format!("/api/llm/reanalyze/{}", id), "{}").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(h.provider.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_escalated_requires_force() {
    let h = harness();
    let id = add_article(&h.state);
    h.state
        .store
        .finalize_run(
            id,
            Bookkeeping {
                status: ArticleStatus::Escalated,
                fail_count: 5,
                escalated: true,
            },
            None,
        )
        .unwrap();

    let uri = format!("/api/llm/reanalyze/{}", id);
    let (status, _) = post_json(&h.app, &uri, r#"{"force": false}"#).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = post_json(&h.app, &uri, r#"{"force": true}"#).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    wait_finished(&h.state, id).await;

    let article = h.state.store.get_article(id).unwrap().unwrap();
    assert!(!article.escalated);
    assert_eq!(article.fail_count, 0);
}

#[tokio::test]
async fn test_second_request_attaches() {
    let h = harness_with(Duration::from_millis(150), true);
    let id = add_article(&h.state);
    let uri = format!("/api/llm/reanalyze/{}", id);

    let (first_status, first) = post_json(&h.app, &uri, "{}").await;
    let (second_status, second) = post_json(&h.app, &uri, "{}").await;
    assert_eq!(first_status, StatusCode::ACCEPTED);
    assert_eq!(second_status, StatusCode::OK);
    assert_eq!(first["requestId"], second["requestId"]);

    wait_finished(&h.state, id).await;
    assert_eq!(h.provider.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_progress_stream_for_idle_article() {
    let h = harness();
    let id = add_article(&h.state);
    let (status, body) = send(
        &h.app,
        Request::get(format!("/api/llm/score-progress/{}", id))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let events = sse_events(&body);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["status"], "Idle");
}

#[tokio::test]
async fn test_progress_stream_follows_live_job() {
    let h = harness_with(Duration::from_millis(100), true);
    let id = add_article(&h.state);
    post_json(&h.app, &format!("/api/llm/reanalyze/{}", id), "{}").await;

    let (status, body) = send(
        &h.app,
        Request::get(format!("/api/llm/score-progress/{}", id))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let events = sse_events(&body);
    let last = events.last().unwrap();
    assert_eq!(last["status"], "Success");
    assert_eq!(last["percent"], 100);
    assert_eq!(last["metadata"]["final_score"], -0.5);
    assert_eq!(
        events.iter().filter(|e| e["status"] == "Success").count(),
        1
    );

    let percents: Vec<u64> = events.iter().map(|e| e["percent"].as_u64().unwrap()).collect();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn test_progress_stream_replays_finished_job() {
    let h = harness();
    let id = add_article(&h.state);
    h.state.orchestrator.analyze(id).await.unwrap();

    let (_, body) = send(
        &h.app,
        Request::get(format!("/api/llm/score-progress/{}", id))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    let events = sse_events(&body);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["status"], "Success");
}

#[tokio::test]
async fn test_jobs_and_health() {
    let h = harness();
    let id = add_article(&h.state);
    h.state.orchestrator.analyze(id).await.unwrap();

    let (status, jobs) = get_json(&h.app, "/api/llm/jobs").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(jobs["count"], 1);
    assert_eq!(jobs["data"][0]["article_id"], id);
    assert_eq!(jobs["data"][0]["state"], "succeeded");

    let (status, health) = get_json(&h.app, "/api/llm/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["providersAvailable"], true);
    assert_eq!(health["rosterSize"], 2);
}

#[tokio::test]
async fn test_bias_unknown_article() {
    let h = harness();
    let (status, body) = get_json(&h.app, "/api/articles/77/bias").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);

    let (status, _) = get_json(&h.app, "/api/articles/77/ensemble").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_ensemble_before_any_run() {
    let h = harness();
    let id = add_article(&h.state);
    let (status, body) = get_json(&h.app, &format!("/api/articles/{}/ensemble", id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], serde_json::json!([]));
}
