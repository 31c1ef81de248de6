//! mnemo daemon
//!
//! Opens the store for the current project, requeues delegation jobs left
//! behind by a previous run, and keeps the worker pool alive until ctrl-c
//! or SIGTERM.

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mnemo::config::{self, LogFormat};
use mnemo::{AppState, Result};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::init();
    init_tracing(config.logging.format);

    let start = match &config.store.project_root {
        Some(root) => root.clone(),
        None => std::env::current_dir()?,
    };
    let project_root = mnemo_storage::resolve_project_root(&start).await;
    info!(project_root = %project_root.display(), "Starting mnemo");

    let state = AppState::new(config, config.store_config(&project_root)).await?;

    let requeued = state.delegation.requeue_interrupted_jobs().await?;
    info!(
        requeued,
        agents = ?state.delegation.agents().names(),
        "mnemo ready"
    );

    shutdown_signal().await;

    info!("Waiting for delegation jobs to finish");
    state.delegation.shutdown().await;
    info!("mnemo stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "mnemo=info,mnemo_storage=info".into());

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM, waiting for ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutdown signal received");
}
