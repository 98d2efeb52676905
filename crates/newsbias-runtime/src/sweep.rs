//! Retry sweep — periodically resubmits failed articles, one at a time.

use std::sync::Arc;
use std::time::Duration;

use newsbias_store::{Bookkeeping, SqliteStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use newsbias_core::Error;

use crate::orchestrator::Orchestrator;
use crate::transition::is_retry_candidate;
use crate::types::{AnalysisOutcome, SweepReport};

/// Most articles retried in one tick.
pub const SWEEP_BATCH_LIMIT: usize = 100;

pub struct RetrySweep {
    store: Arc<SqliteStore>,
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
}

impl RetrySweep {
    pub fn new(store: Arc<SqliteStore>, orchestrator: Arc<Orchestrator>, interval: Duration) -> Self {
        Self {
            store,
            orchestrator,
            interval,
        }
    }

    /// Run one pass over the retry candidates.
    pub async fn tick(&self) -> SweepReport {
        let mut report = SweepReport::default();

        if !self.orchestrator.gateway().is_available() {
            warn!("Retry sweep skipped: no model provider is configured");
            return report;
        }

        let candidates = match self.store.list_retry_candidates(SWEEP_BATCH_LIMIT) {
            Ok(c) => c,
            Err(e) => {
                error!("Retry sweep could not list candidates: {}", e);
                return report;
            }
        };
        report.candidates = candidates.len();
        if candidates.is_empty() {
            debug!("Retry sweep: nothing to retry");
            return report;
        }

        info!("Retry sweep: {} candidates", candidates.len());

        for article in candidates {
            let bookkeeping = Bookkeeping {
                status: article.status,
                fail_count: article.fail_count,
                escalated: article.escalated,
            };
            if !is_retry_candidate(&bookkeeping) {
                report.skipped += 1;
                continue;
            }

            match self.orchestrator.analyze(article.id).await {
                Ok(AnalysisOutcome::Success { .. }) => report.succeeded += 1,
                Ok(AnalysisOutcome::RateLimited { retry_after }) => {
                    debug!(
                        "Article {} rate limited, retry after {:?}s",
                        article.id, retry_after
                    );
                    report.rate_limited += 1;
                }
                Ok(AnalysisOutcome::Failed { .. }) => report.failed += 1,
                Err(Error::Escalated(_)) | Err(Error::NotFound(_)) => report.skipped += 1,
                Err(e) => {
                    error!("Retry of article {} failed: {}", article.id, e);
                    report.skipped += 1;
                }
            }
        }

        info!(
            "Retry sweep done: {} succeeded, {} failed, {} rate limited, {} skipped",
            report.succeeded, report.failed, report.rate_limited, report.skipped
        );
        report
    }

    /// Tick on the configured interval until `shutdown` turns true.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Retry sweep running every {:?}", self.interval);
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; wait a full interval instead.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Retry sweep stopped");
        })
    }
}
