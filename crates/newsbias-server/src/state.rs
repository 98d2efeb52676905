//! Shared application state.

use std::sync::Arc;

use newsbias_core::{Result, ServiceConfig};
use newsbias_llm::{Gateway, ModelRosterConfig};
use newsbias_runtime::{Orchestrator, ProgressManager, RetrySweep};
use newsbias_store::SqliteStore;
use tracing::warn;

/// Shared application state accessible from all route handlers.
pub struct AppState {
    pub config: ServiceConfig,
    pub store: Arc<SqliteStore>,
    pub gateway: Arc<Gateway>,
    pub progress: Arc<ProgressManager>,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(config: ServiceConfig, store: SqliteStore, gateway: Gateway) -> Self {
        let store = Arc::new(store);
        let gateway = Arc::new(gateway);
        let progress = Arc::new(ProgressManager::new(
            config.progress_cleanup_interval,
            config.progress_retention,
        ));
        let orchestrator = Arc::new(
            Orchestrator::new(store.clone(), gateway.clone(), progress.clone())
                .with_escalation_threshold(config.escalation_threshold),
        );

        Self {
            config,
            store,
            gateway,
            progress,
            orchestrator,
        }
    }

    /// Open the database and model roster under the configured data directory.
    pub fn open(config: ServiceConfig) -> Result<Self> {
        let store = SqliteStore::open(&config.data_paths.database)?;
        let interrupted = store.reset_interrupted()?;
        if interrupted > 0 {
            warn!("Reset {} articles left processing by an earlier run", interrupted);
        }
        let roster = ModelRosterConfig::load(&config.data_paths.models_file);
        let gateway = Gateway::from_config(&roster, config.provider_timeout);
        Ok(Self::new(config, store, gateway))
    }

    pub fn retry_sweep(&self) -> RetrySweep {
        RetrySweep::new(
            self.store.clone(),
            self.orchestrator.clone(),
            self.config.sweep_interval,
        )
    }
}
