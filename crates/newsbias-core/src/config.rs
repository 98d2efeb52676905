//! Configuration and data directory management.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;

/// Paths to all NewsBias data files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPaths {
    /// Root data directory (e.g., `data/`).
    pub root: PathBuf,
    /// SQLite database file (`data/newsbias.db`).
    pub database: PathBuf,
    /// Model roster configuration (`data/models.json`).
    pub models_file: PathBuf,
}

impl DataPaths {
    /// Create data paths from a root directory. Creates the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            database: root.join("newsbias.db"),
            models_file: root.join("models.json"),
            root,
        })
    }
}

/// Top-level service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// HTTP server port.
    pub port: u16,
    pub data_paths: DataPaths,
    /// Interval between retry sweep ticks.
    pub sweep_interval: Duration,
    /// Per-call provider timeout.
    pub provider_timeout: Duration,
    /// How often the progress registry is scanned for stale jobs.
    pub progress_cleanup_interval: Duration,
    /// How long a finished job stays visible to late subscribers.
    pub progress_retention: Duration,
    /// Consecutive failures after which an article is escalated.
    pub escalation_threshold: u32,
}

impl ServiceConfig {
    /// Create configuration from environment and defaults.
    pub fn from_env(data_dir: impl AsRef<Path>) -> Result<Self> {
        let port = env_parse("PORT").unwrap_or(8080);

        // Test runs want stale jobs gone quickly.
        let test_mode = std::env::var("TEST_MODE").map(|v| v == "true").unwrap_or(false);
        let default_cleanup = if test_mode { 5 } else { 60 };

        let data_paths = DataPaths::new(data_dir)?;

        Ok(Self {
            port,
            data_paths,
            sweep_interval: Duration::from_secs(
                env_parse("NEWSBIAS_SWEEP_INTERVAL_SECS").unwrap_or(600),
            ),
            provider_timeout: Duration::from_secs(
                env_parse("NEWSBIAS_PROVIDER_TIMEOUT_SECS").unwrap_or(30),
            ),
            progress_cleanup_interval: Duration::from_secs(
                env_parse("NEWSBIAS_PROGRESS_CLEANUP_SECS").unwrap_or(default_cleanup),
            ),
            progress_retention: Duration::from_secs(
                env_parse("NEWSBIAS_PROGRESS_RETENTION_SECS").unwrap_or(300),
            ),
            escalation_threshold: env_parse("NEWSBIAS_ESCALATION_THRESHOLD").unwrap_or(5),
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
