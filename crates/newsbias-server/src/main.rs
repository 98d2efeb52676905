//! NewsBias — ensemble political-bias scoring server.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use newsbias_server::{build_router, AppState};

fn resolve_data_dir() -> PathBuf {
    std::env::var("NEWSBIAS_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let exe_dir = std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(|p| p.to_path_buf()));
            if let Some(dir) = exe_dir {
                let parent_data = dir.join("../data");
                if parent_data.exists() {
                    return parent_data;
                }
            }
            PathBuf::from("data")
        })
}

fn open_state(data_dir: &std::path::Path) -> anyhow::Result<Arc<AppState>> {
    let config = newsbias_core::ServiceConfig::from_env(data_dir)?;
    let state = AppState::open(config)
        .map_err(|e| anyhow::anyhow!("Failed to open store: {}", e))?;
    Ok(Arc::new(state))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    // Handle CLI subcommands
    if args.len() > 1 {
        match args[1].as_str() {
            "--sweep" | "sweep" => {
                let state = open_state(&resolve_data_dir())?;
                let report = state.retry_sweep().tick().await;
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }
            "--help" | "-h" | "help" => {
                println!("NewsBias — ensemble political-bias scoring server");
                println!();
                println!("Usage: newsbias [command]");
                println!();
                println!("Commands:");
                println!("  (none)    Start the server");
                println!("  sweep     Run one retry sweep pass and exit");
                println!("  help      Show this help message");
                println!();
                println!("Data directory: $NEWSBIAS_DATA_DIR (default ./data)");
                return Ok(());
            }
            _ => {
                eprintln!("Unknown command: {}. Use 'newsbias help' for usage.", args[1]);
                std::process::exit(1);
            }
        }
    }

    // Normal server startup
    let data_dir = resolve_data_dir();
    info!("Data directory: {}", data_dir.display());

    let state = open_state(&data_dir)?;
    let port = state.config.port;

    // Background tasks
    state.progress.spawn_cleanup();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweep = Arc::new(state.retry_sweep()).spawn(shutdown_rx);

    let app = build_router(state.clone());

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("NewsBias server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown_tx.send_replace(true);
    if let Err(e) = sweep.await {
        tracing::warn!("Retry sweep task ended abnormally: {}", e);
    }
    state.progress.stop();
    info!("NewsBias server stopped");

    Ok(())
}
