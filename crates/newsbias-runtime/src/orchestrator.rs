//! Orchestrator — runs the model roster against one article.

use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use newsbias_llm::{Gateway, ModelOutput, ModelSpec, ProviderError};
use newsbias_store::{AggregateUpdate, Article, ArticleStatus, Bookkeeping, NewModelScore, SqliteStore};
use serde_json::json;
use tracing::{error, info, warn};

use newsbias_core::{Error, Result};

use crate::calculator::{composite_score, ScoreInput};
use crate::progress::{ProgressManager, ProgressWriter};
use crate::transition::{next_bookkeeping, DEFAULT_ESCALATION_THRESHOLD};
use crate::types::*;

/// Coordinates one analysis job per article.
pub struct Orchestrator {
    store: Arc<SqliteStore>,
    gateway: Arc<Gateway>,
    progress: Arc<ProgressManager>,
    escalation_threshold: u32,
}

struct Scored<'a> {
    model: &'a ModelSpec,
    output: ModelOutput,
}

impl Orchestrator {
    pub fn new(store: Arc<SqliteStore>, gateway: Arc<Gateway>, progress: Arc<ProgressManager>) -> Self {
        Self {
            store,
            gateway,
            progress,
            escalation_threshold: DEFAULT_ESCALATION_THRESHOLD,
        }
    }

    pub fn with_escalation_threshold(mut self, threshold: u32) -> Self {
        self.escalation_threshold = threshold.max(1);
        self
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn progress(&self) -> &Arc<ProgressManager> {
        &self.progress
    }

    /// Queue an analysis in the background, or join the one already running.
    ///
    /// Escalated articles are refused unless `force` is set.
    pub fn submit(self: &Arc<Self>, article_id: i64, force: bool) -> Result<Submission> {
        let article = self.load_article(article_id)?;
        if article.escalated && !force {
            return Err(Error::Escalated(article_id));
        }

        match self.progress.start(article_id) {
            Ok(writer) => {
                let request_id = writer.request_id().to_string();
                info!(
                    "Queued analysis {} for article {} (force={})",
                    request_id, article_id, force
                );
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = this.run(article_id, force, writer).await {
                        warn!("Queued analysis of article {} did not run: {}", article_id, e);
                    }
                });
                Ok(Submission {
                    request_id,
                    attached: false,
                })
            }
            Err(Error::JobAlreadyRunning(_)) => {
                let request_id = self.progress.request_id(article_id).unwrap_or_default();
                info!(
                    "Article {} already being analyzed, attaching to {}",
                    article_id, request_id
                );
                Ok(Submission {
                    request_id,
                    attached: true,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Analyze in the caller's task and return the outcome. A job already
    /// running for the article is awaited instead of duplicated.
    pub async fn analyze(&self, article_id: i64) -> Result<AnalysisOutcome> {
        let article = self.load_article(article_id)?;
        if article.escalated {
            return Err(Error::Escalated(article_id));
        }

        match self.progress.start(article_id) {
            Ok(writer) => self.run(article_id, false, writer).await,
            Err(Error::JobAlreadyRunning(_)) => {
                info!("Article {} already being analyzed, waiting for it", article_id);
                let terminal = self.progress.subscribe(article_id).wait_terminal().await;
                Ok(match terminal {
                    Some(ev) => AnalysisOutcome::from_terminal(&ev),
                    None => AnalysisOutcome::Failed {
                        message: "job disappeared before finishing".into(),
                    },
                })
            }
            Err(e) => Err(e),
        }
    }

    fn load_article(&self, article_id: i64) -> Result<Article> {
        self.store
            .get_article(article_id)?
            .ok_or_else(|| Error::NotFound(format!("article {}", article_id)))
    }

    /// Body of one job. Always ends with a terminal event.
    ///
    /// The article is read again once the job owns it, so bookkeeping left by
    /// a job that finished in the meantime is not lost.
    async fn run(&self, article_id: i64, force: bool, mut writer: ProgressWriter) -> Result<AnalysisOutcome> {
        let article = match self.load_article(article_id) {
            Ok(a) => a,
            Err(e) => {
                error!("Could not load article {} for analysis: {}", article_id, e);
                writer.finish(ProgressEvent::error(
                    format!("Could not load article: {}", e),
                    Some(json!({"error_type": "store"})),
                ));
                return Err(e);
            }
        };
        if article.escalated && !force {
            info!("Article {} was escalated before its job started", article_id);
            writer.finish(ProgressEvent::error(
                "Article is escalated; a forced reanalysis is required",
                Some(json!({"error_type": "escalated"})),
            ));
            return Err(Error::Escalated(article_id));
        }

        let before = Bookkeeping {
            status: article.status,
            fail_count: article.fail_count,
            escalated: article.escalated,
        };

        info!(
            "Analysis {} started for article {} with {} models",
            writer.request_id(),
            article_id,
            self.gateway.roster().len()
        );
        writer.progress("Starting", "Starting ensemble analysis", 5);

        if let Err(e) = self.store.mark_processing(article_id) {
            error!("Failed to mark article {} processing: {}", article_id, e);
        }

        let mut restore = StatusRestore {
            store: &self.store,
            article_id,
            status: before.status,
            armed: true,
        };
        let outcome = self.score(&article, before, writer).await;
        restore.armed = false;
        Ok(outcome)
    }

    async fn score(&self, article: &Article, before: Bookkeeping, mut writer: ProgressWriter) -> AnalysisOutcome {
        let article_id = article.id;
        let roster = self.gateway.roster();

        if article.content.trim().is_empty() {
            return self.fail(article_id, before, writer, "Article has no content", None);
        }

        let version = match self.store.next_score_version(article_id) {
            Ok(v) => v,
            Err(e) => return self.abort_on_store_error(article_id, before, writer, e),
        };

        writer.progress(
            "Scoring",
            format!("Invoking {} models", roster.len()),
            10,
        );

        let mut calls: FuturesUnordered<_> = roster
            .iter()
            .map(|model| {
                let gateway = &self.gateway;
                let text = article.content.as_str();
                async move { (model, gateway.invoke(model, text).await) }
            })
            .collect();

        let total = roster.len().max(1);
        let mut done = 0usize;
        let mut successes: Vec<Scored<'_>> = Vec::new();
        let mut failures: Vec<(&ModelSpec, ProviderError)> = Vec::new();
        let mut store_error: Option<Error> = None;

        while let Some((model, result)) = calls.next().await {
            done += 1;
            let percent = (10 + 70 * done / total) as u8;

            let message = match result {
                Ok(output) if is_usable(&output) => {
                    let output = ModelOutput {
                        confidence: output.confidence.clamp(0.0, 1.0),
                        ..output
                    };
                    match self.store.add_model_score(&NewModelScore {
                        article_id,
                        model: model.model_name.clone(),
                        perspective: model.perspective.clone(),
                        score: output.score,
                        metadata: json!({
                            "confidence": output.confidence,
                            "explanation": output.explanation,
                            "provider": model.provider.to_string(),
                        }),
                        version,
                    }) {
                        Ok(_) => {
                            info!(
                                "Article {}: {} scored {:.3} (confidence {:.2})",
                                article_id, model.model_name, output.score, output.confidence
                            );
                            let message = format!("{} scored {:.2}", model.model_name, output.score);
                            successes.push(Scored { model, output });
                            message
                        }
                        Err(e) => {
                            error!(
                                "Failed to store score from {} for article {}: {}",
                                model.model_name, article_id, e
                            );
                            store_error = Some(e);
                            format!("{} result could not be stored", model.model_name)
                        }
                    }
                }
                Ok(output) => {
                    warn!(
                        "Article {}: {} returned unusable score {}",
                        article_id, model.model_name, output.score
                    );
                    failures.push((
                        model,
                        ProviderError::InvalidResponse(format!("score {} outside [-1, 1]", output.score)),
                    ));
                    format!("{} returned an unusable score", model.model_name)
                }
                Err(e) => {
                    warn!("Article {}: {} failed: {}", article_id, model.model_name, e);
                    let message = format!("{} failed: {}", model.model_name, e.error_type());
                    failures.push((model, e));
                    message
                }
            };

            writer.progress("Scoring", message, percent);
        }
        drop(calls);

        if successes.is_empty() {
            if let Some(e) = store_error {
                return self.abort_on_store_error(article_id, before, writer, e);
            }
        }

        let outcome = classify(&successes, &failures);
        info!(
            "Article {}: {} succeeded, {} failed, outcome {:?}",
            article_id,
            successes.len(),
            failures.len(),
            outcome
        );

        match outcome {
            RunOutcome::Success => self.succeed(article, before, version, &successes, writer),
            RunOutcome::RateLimited => self.defer_rate_limited(article_id, before, &failures, writer),
            RunOutcome::Failed => {
                let detail = failures.last().map(|(m, e)| error_metadata(m, e));
                let message = match failures.last() {
                    Some((m, e)) => format!("All models failed; last error from {}: {}", m.model_name, e),
                    None => "No models configured".to_string(),
                };
                self.fail(article_id, before, writer, &message, detail)
            }
        }
    }

    fn succeed(
        &self,
        article: &Article,
        before: Bookkeeping,
        version: i64,
        successes: &[Scored<'_>],
        mut writer: ProgressWriter,
    ) -> AnalysisOutcome {
        writer.progress("Calculating", "Calculating composite score", 85);

        let inputs: Vec<ScoreInput> = successes
            .iter()
            .map(|s| ScoreInput {
                score: s.output.score,
                confidence: s.output.confidence,
            })
            .collect();
        let aggregate = composite_score(&inputs).map(|c| AggregateUpdate {
            composite_score: c.score,
            confidence: c.confidence,
            version,
            contributing: inputs.len(),
        });
        if aggregate.is_none() {
            warn!(
                "Article {}: all confidences are zero, keeping previous composite",
                article.id
            );
        }

        writer.progress("Storing", "Storing results", 95);

        let next = next_bookkeeping(before, RunOutcome::Success, self.escalation_threshold);
        if let Err(e) = self.store.finalize_run(article.id, next, aggregate.as_ref()) {
            return self.abort_on_store_error(article.id, before, writer, e);
        }

        let (final_score, confidence) = match &aggregate {
            Some(a) => (Some(a.composite_score), Some(a.confidence)),
            None => (article.composite_score, article.confidence),
        };
        let score_updated = aggregate.is_some();
        let models: Vec<&str> = successes.iter().map(|s| s.model.model_name.as_str()).collect();

        info!(
            "Analysis complete for article {}: score={:?} confidence={:?} updated={}",
            article.id, final_score, confidence, score_updated
        );

        writer.finish(ProgressEvent::success(
            "Analysis complete",
            json!({
                "final_score": final_score,
                "confidence": confidence,
                "score_updated": score_updated,
                "version": version,
                "models": models,
            }),
        ));

        AnalysisOutcome::Success {
            final_score,
            score_updated,
        }
    }

    fn defer_rate_limited(
        &self,
        article_id: i64,
        before: Bookkeeping,
        failures: &[(&ModelSpec, ProviderError)],
        writer: ProgressWriter,
    ) -> AnalysisOutcome {
        if let Err(e) = self.store.set_status(article_id, before.status) {
            error!("Failed to restore status of article {}: {}", article_id, e);
        }

        let retry_after = failures.iter().filter_map(|(_, e)| e.retry_after()).max();
        let mut metadata = failures
            .first()
            .map(|(m, e)| error_metadata(m, e))
            .unwrap_or_else(|| json!({"error_type": "rate_limit"}));
        if let Some(secs) = retry_after {
            metadata["retry_after"] = json!(secs);
        }

        warn!(
            "Article {}: every model is rate limited, deferring (retry after {:?}s)",
            article_id, retry_after
        );
        writer.finish(ProgressEvent::rate_limited(
            "All models are rate limited; try again later",
            Some(metadata),
        ));

        AnalysisOutcome::RateLimited { retry_after }
    }

    fn fail(
        &self,
        article_id: i64,
        before: Bookkeeping,
        writer: ProgressWriter,
        message: &str,
        detail: Option<serde_json::Value>,
    ) -> AnalysisOutcome {
        let next = next_bookkeeping(before, RunOutcome::Failed, self.escalation_threshold);
        if let Err(e) = self.store.finalize_run(article_id, next, None) {
            error!("Failed to record failure for article {}: {}", article_id, e);
        }

        if next.escalated && !before.escalated {
            warn!(
                "Article {} escalated after {} consecutive failures",
                article_id, next.fail_count
            );
        } else {
            warn!(
                "Analysis failed for article {} (fail_count={}): {}",
                article_id, next.fail_count, message
            );
        }

        let mut metadata = detail.unwrap_or_else(|| json!({}));
        metadata["fail_count"] = json!(next.fail_count);
        metadata["escalated"] = json!(next.escalated);
        writer.finish(ProgressEvent::error(message, Some(metadata)));

        AnalysisOutcome::Failed {
            message: message.to_string(),
        }
    }

    // Store trouble is not the article's fault: log it, put the status back
    // and end the job without touching the failure count.
    fn abort_on_store_error(
        &self,
        article_id: i64,
        before: Bookkeeping,
        writer: ProgressWriter,
        err: Error,
    ) -> AnalysisOutcome {
        error!("Store error during analysis of article {}: {}", article_id, err);
        if let Err(e) = self.store.set_status(article_id, before.status) {
            error!("Failed to restore status of article {}: {}", article_id, e);
        }
        writer.finish(ProgressEvent::error(
            "Failed to store analysis results",
            Some(json!({"error_type": "store"})),
        ));
        AnalysisOutcome::Failed {
            message: err.to_string(),
        }
    }
}

/// Puts an article's status back when a job stops without reaching a
/// terminal state of its own (panic or a dropped future).
struct StatusRestore<'a> {
    store: &'a SqliteStore,
    article_id: i64,
    status: ArticleStatus,
    armed: bool,
}

impl Drop for StatusRestore<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(
            "Analysis of article {} ended abruptly, restoring status {}",
            self.article_id,
            self.status.as_str()
        );
        if let Err(e) = self.store.set_status(self.article_id, self.status) {
            error!("Failed to restore status of article {}: {}", self.article_id, e);
        }
    }
}

fn is_usable(output: &ModelOutput) -> bool {
    output.score.is_finite() && (-1.0..=1.0).contains(&output.score) && !output.confidence.is_nan()
}

fn classify(successes: &[Scored<'_>], failures: &[(&ModelSpec, ProviderError)]) -> RunOutcome {
    if !successes.is_empty() {
        RunOutcome::Success
    } else if !failures.is_empty() && failures.iter().all(|(_, e)| e.is_rate_limited()) {
        RunOutcome::RateLimited
    } else {
        RunOutcome::Failed
    }
}

fn error_metadata(model: &ModelSpec, err: &ProviderError) -> serde_json::Value {
    let mut meta = json!({
        "provider": model.provider.to_string(),
        "model": model.model_name,
        "error_type": err.error_type(),
    });
    if let Some(secs) = err.retry_after() {
        meta["retry_after"] = json!(secs);
    }
    meta
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::future::BoxFuture;
    use newsbias_llm::gateway::DEFAULT_MAX_RETRIES;
    use newsbias_llm::{ProviderKind, ScoreProvider};
    use newsbias_store::{ArticleStatus, NewArticle};
    use tempfile::TempDir;

    /// Provider answering from a per-model script.
    struct Scripted {
        answers: HashMap<String, std::result::Result<ModelOutput, ProviderError>>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(answers: Vec<(&str, std::result::Result<ModelOutput, ProviderError>)>) -> Self {
            Self {
                answers: answers.into_iter().map(|(m, a)| (m.to_string(), a)).collect(),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    impl ScoreProvider for Scripted {
        fn kind(&self) -> ProviderKind {
            ProviderKind::OpenAi
        }

        fn invoke<'a>(
            &'a self,
            model: &'a ModelSpec,
            _article_text: &'a str,
        ) -> BoxFuture<'a, std::result::Result<ModelOutput, ProviderError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                self.answers
                    .get(&model.model_name)
                    .cloned()
                    .unwrap_or_else(|| Err(ProviderError::Unavailable("unscripted".into())))
            })
        }
    }

    fn ok(score: f64, confidence: f64) -> std::result::Result<ModelOutput, ProviderError> {
        Ok(ModelOutput {
            score,
            confidence,
            explanation: "scripted".into(),
        })
    }

    fn limited() -> std::result::Result<ModelOutput, ProviderError> {
        Err(ProviderError::RateLimited { retry_after: Some(60) })
    }

    fn down() -> std::result::Result<ModelOutput, ProviderError> {
        Err(ProviderError::Unavailable("503".into()))
    }

    struct Fixture {
        orch: Arc<Orchestrator>,
        store: Arc<SqliteStore>,
        provider: Arc<Scripted>,
        dir: TempDir,
    }

    fn fixture(provider: Scripted) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path().join("t.db")).unwrap());
        let provider = Arc::new(provider);
        let roster = vec![
            ModelSpec::new("left-model", Some("left"), ProviderKind::OpenAi),
            ModelSpec::new("center-model", Some("center"), ProviderKind::OpenAi),
            ModelSpec::new("right-model", Some("right"), ProviderKind::OpenAi),
        ];
        let gateway = Arc::new(
            Gateway::new(roster, Duration::from_secs(5))
                .with_retries(DEFAULT_MAX_RETRIES, Duration::ZERO)
                .with_provider(provider.clone() as Arc<dyn ScoreProvider>),
        );
        let progress = Arc::new(ProgressManager::new(
            Duration::from_secs(60),
            Duration::from_secs(300),
        ));
        let orch = Arc::new(Orchestrator::new(store.clone(), gateway, progress));
        Fixture {
            orch,
            store,
            provider,
            dir,
        }
    }

    fn add_article(store: &SqliteStore) -> i64 {
        store
            .insert_article(NewArticle {
                title: "Budget vote".into(),
                url: None,
                content: "The senate passed the budget today.".into(),
            })
            .unwrap()
    }

    fn set_bookkeeping(store: &SqliteStore, id: i64, status: ArticleStatus, fail_count: u32, escalated: bool) {
        store
            .finalize_run(
                id,
                Bookkeeping {
                    status,
                    fail_count,
                    escalated,
                },
                None,
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_partial_success_scenario() {
        let fx = fixture(Scripted::new(vec![
            ("left-model", ok(0.4, 0.8)),
            ("center-model", ok(-0.2, 0.6)),
            ("right-model", limited()),
        ]));
        let id = add_article(&fx.store);

        let outcome = fx.orch.analyze(id).await.unwrap();
        assert!(matches!(outcome, AnalysisOutcome::Success { score_updated: true, .. }));

        let article = fx.store.get_article(id).unwrap().unwrap();
        assert!((article.composite_score.unwrap() - 0.2 / 1.4).abs() < 1e-9);
        assert!((article.confidence.unwrap() - 0.7).abs() < 1e-9);
        assert_eq!(article.status, ArticleStatus::Processed);
        assert_eq!(article.fail_count, 0);

        let rows = fx.store.latest_run_scores(id).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows.iter().filter(|r| r.is_ensemble()).count(), 1);
        assert!(rows.iter().all(|r| r.version == 1));
    }

    #[tokio::test]
    async fn test_all_rate_limited_changes_nothing() {
        let fx = fixture(Scripted::new(vec![
            ("left-model", limited()),
            ("center-model", limited()),
            ("right-model", limited()),
        ]));
        let id = add_article(&fx.store);
        set_bookkeeping(&fx.store, id, ArticleStatus::Failed, 2, false);

        let outcome = fx.orch.analyze(id).await.unwrap();
        assert_eq!(outcome, AnalysisOutcome::RateLimited { retry_after: Some(60) });

        let article = fx.store.get_article(id).unwrap().unwrap();
        assert_eq!(article.status, ArticleStatus::Failed);
        assert_eq!(article.fail_count, 2);
        assert!(!fx.orch.progress().is_running(id));
    }

    #[tokio::test]
    async fn test_mixed_failures_count_as_failed() {
        let fx = fixture(Scripted::new(vec![
            ("left-model", limited()),
            ("center-model", down()),
            ("right-model", limited()),
        ]));
        let id = add_article(&fx.store);

        let outcome = fx.orch.analyze(id).await.unwrap();
        assert_eq!(outcome.kind(), RunOutcome::Failed);
        let article = fx.store.get_article(id).unwrap().unwrap();
        assert_eq!(article.status, ArticleStatus::Failed);
        assert_eq!(article.fail_count, 1);
    }

    #[tokio::test]
    async fn test_fifth_failure_escalates() {
        let fx = fixture(Scripted::new(vec![
            ("left-model", down()),
            ("center-model", down()),
            ("right-model", down()),
        ]));
        let id = add_article(&fx.store);
        set_bookkeeping(&fx.store, id, ArticleStatus::Failed, 4, false);

        fx.orch.analyze(id).await.unwrap();

        let article = fx.store.get_article(id).unwrap().unwrap();
        assert_eq!(article.fail_count, 5);
        assert!(article.escalated);
        assert_eq!(article.status, ArticleStatus::Escalated);
        assert!(fx.store.list_retry_candidates(10).unwrap().is_empty());

        // Escalated articles need force.
        assert!(matches!(fx.orch.analyze(id).await, Err(Error::Escalated(_))));
        assert!(matches!(fx.orch.submit(id, false), Err(Error::Escalated(_))));
    }

    #[tokio::test]
    async fn test_zero_confidence_keeps_previous_composite() {
        let fx = fixture(Scripted::new(vec![
            ("left-model", ok(0.9, 0.0)),
            ("center-model", ok(-0.9, 0.0)),
            ("right-model", down()),
        ]));
        let id = add_article(&fx.store);
        fx.store
            .finalize_run(
                id,
                Bookkeeping {
                    status: ArticleStatus::Processed,
                    fail_count: 0,
                    escalated: false,
                },
                Some(&AggregateUpdate {
                    composite_score: -0.25,
                    confidence: 0.5,
                    version: 0,
                    contributing: 2,
                }),
            )
            .unwrap();

        let sub_outcome = fx.orch.analyze(id).await.unwrap();
        assert_eq!(
            sub_outcome,
            AnalysisOutcome::Success {
                final_score: Some(-0.25),
                score_updated: false
            }
        );

        let article = fx.store.get_article(id).unwrap().unwrap();
        assert_eq!(article.composite_score, Some(-0.25));
        assert_eq!(article.confidence, Some(0.5));
        assert_eq!(article.status, ArticleStatus::Processed);
    }

    #[tokio::test]
    async fn test_concurrent_submissions_share_one_job() {
        let fx = fixture(
            Scripted::new(vec![
                ("left-model", ok(0.1, 0.5)),
                ("center-model", ok(0.2, 0.5)),
                ("right-model", ok(0.3, 0.5)),
            ])
            .with_delay(Duration::from_millis(100)),
        );
        let id = add_article(&fx.store);

        let first = fx.orch.submit(id, false).unwrap();
        let second = fx.orch.submit(id, false).unwrap();
        assert!(!first.attached);
        assert!(second.attached);
        assert_eq!(first.request_id, second.request_id);

        let a = fx.orch.progress().subscribe(id).wait_terminal();
        let b = fx.orch.progress().subscribe(id).wait_terminal();
        let (a, b) = tokio::join!(a, b);
        let a = a.unwrap();
        assert_eq!(a.status, ProgressStatus::Success);
        assert_eq!(Some(a), b);
        assert_eq!(fx.provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_forced_escalated_failure_keeps_escalation() {
        let fx = fixture(Scripted::new(vec![
            ("left-model", down()),
            ("center-model", down()),
            ("right-model", down()),
        ]));
        let id = add_article(&fx.store);
        set_bookkeeping(&fx.store, id, ArticleStatus::Escalated, 5, true);

        fx.orch.submit(id, true).unwrap();
        let terminal = fx.orch.progress().subscribe(id).wait_terminal().await.unwrap();
        assert_eq!(terminal.status, ProgressStatus::Error);

        let article = fx.store.get_article(id).unwrap().unwrap();
        assert_eq!(article.fail_count, 6);
        assert!(article.escalated);
    }

    #[tokio::test]
    async fn test_forced_success_clears_escalation() {
        let fx = fixture(Scripted::new(vec![
            ("left-model", ok(-0.5, 1.0)),
            ("center-model", down()),
            ("right-model", down()),
        ]));
        let id = add_article(&fx.store);
        set_bookkeeping(&fx.store, id, ArticleStatus::Escalated, 5, true);

        fx.orch.submit(id, true).unwrap();
        let terminal = fx.orch.progress().subscribe(id).wait_terminal().await.unwrap();
        assert_eq!(terminal.metadata.unwrap()["final_score"], -0.5);

        let article = fx.store.get_article(id).unwrap().unwrap();
        assert_eq!(article.fail_count, 0);
        assert!(!article.escalated);
        assert_eq!(article.status, ArticleStatus::Processed);
    }

    #[tokio::test]
    async fn test_out_of_range_score_is_not_used() {
        let fx = fixture(Scripted::new(vec![
            ("left-model", ok(3.0, 0.9)),
            ("center-model", ok(f64::NAN, 0.9)),
            ("right-model", ok(0.5, 0.4)),
        ]));
        let id = add_article(&fx.store);

        fx.orch.analyze(id).await.unwrap();
        let article = fx.store.get_article(id).unwrap().unwrap();
        assert_eq!(article.composite_score, Some(0.5));
        assert_eq!(fx.store.latest_run_scores(id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_article() {
        let fx = fixture(Scripted::new(vec![]));
        assert!(matches!(fx.orch.submit(404, false), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_reruns_get_new_versions() {
        let fx = fixture(Scripted::new(vec![
            ("left-model", ok(0.1, 0.5)),
            ("center-model", down()),
            ("right-model", down()),
        ]));
        let id = add_article(&fx.store);

        fx.orch.analyze(id).await.unwrap();
        fx.orch.analyze(id).await.unwrap();

        let latest = fx.store.latest_run_scores(id).unwrap();
        assert!(latest.iter().all(|r| r.version == 2));
        assert_eq!(fx.store.get_model_scores(id).unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_unstorable_scores_leave_fail_count() {
        let fx = fixture(Scripted::new(vec![
            ("left-model", ok(0.4, 0.8)),
            ("center-model", ok(0.1, 0.6)),
            ("right-model", ok(-0.3, 0.9)),
        ]));
        let id = add_article(&fx.store);
        set_bookkeeping(&fx.store, id, ArticleStatus::Failed, 4, false);

        let conn = rusqlite::Connection::open(fx.dir.path().join("t.db")).unwrap();
        conn.execute_batch(
            "CREATE TRIGGER reject_scores BEFORE INSERT ON model_scores
             BEGIN SELECT RAISE(ABORT, 'disk gone'); END;",
        )
        .unwrap();

        let outcome = fx.orch.analyze(id).await.unwrap();
        assert_eq!(outcome.kind(), RunOutcome::Failed);

        let article = fx.store.get_article(id).unwrap().unwrap();
        assert_eq!(article.fail_count, 4);
        assert!(!article.escalated);
        assert_eq!(article.status, ArticleStatus::Failed);

        let terminal = fx.orch.progress().subscribe(id).wait_terminal().await.unwrap();
        assert_eq!(terminal.metadata.unwrap()["error_type"], "store");
    }

    #[tokio::test]
    async fn test_job_reads_bookkeeping_after_registering() {
        let fx = fixture(Scripted::new(vec![
            ("left-model", down()),
            ("center-model", down()),
            ("right-model", down()),
        ]));
        let id = add_article(&fx.store);

        // A previous job records its failure between the caller's lookup and
        // this job taking ownership.
        let writer = fx.orch.progress().start(id).unwrap();
        set_bookkeeping(&fx.store, id, ArticleStatus::Failed, 1, false);

        let outcome = fx.orch.run(id, false, writer).await.unwrap();
        assert_eq!(outcome.kind(), RunOutcome::Failed);
        assert_eq!(fx.store.get_article(id).unwrap().unwrap().fail_count, 2);
    }

    #[tokio::test]
    async fn test_job_refuses_article_escalated_meanwhile() {
        let fx = fixture(Scripted::new(vec![("left-model", ok(0.1, 0.5))]));
        let id = add_article(&fx.store);

        let writer = fx.orch.progress().start(id).unwrap();
        set_bookkeeping(&fx.store, id, ArticleStatus::Escalated, 5, true);

        assert!(matches!(
            fx.orch.run(id, false, writer).await,
            Err(Error::Escalated(_))
        ));
        assert_eq!(fx.provider.calls.load(Ordering::SeqCst), 0);
        assert!(!fx.orch.progress().is_running(id));
        assert_eq!(fx.store.get_article(id).unwrap().unwrap().fail_count, 5);
    }

    #[tokio::test]
    async fn test_abandoned_job_restores_status() {
        let fx = fixture(
            Scripted::new(vec![
                ("left-model", ok(0.1, 0.5)),
                ("center-model", ok(0.2, 0.5)),
                ("right-model", ok(0.3, 0.5)),
            ])
            .with_delay(Duration::from_secs(5)),
        );
        let id = add_article(&fx.store);
        set_bookkeeping(&fx.store, id, ArticleStatus::Failed, 1, false);

        let cut = tokio::time::timeout(Duration::from_millis(100), fx.orch.analyze(id)).await;
        assert!(cut.is_err());

        let article = fx.store.get_article(id).unwrap().unwrap();
        assert_eq!(article.status, ArticleStatus::Failed);
        assert_eq!(article.fail_count, 1);
        assert!(!fx.orch.progress().is_running(id));
        assert_eq!(fx.store.list_retry_candidates(10).unwrap().len(), 1);
    }
}
