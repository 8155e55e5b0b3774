//! `orch serve`: run the engine's background loops in the foreground.

use anyhow::Result;
use console::style;
use orchestrion_core::external::WorkerRegistry;
use tokio_util::sync::CancellationToken;

use crate::state::AppState;

pub async fn handle_serve(state: &AppState, quiet: bool) -> Result<()> {
    let config = state.engine.config();
    if !quiet {
        println!();
        println!(
            "  {} Orchestrion node {} serving {}",
            style(">").cyan().bold(),
            style(&config.engine.node_id).cyan(),
            style(state.data_dir.display()).dim()
        );
        println!(
            "  Job workers: {}   Poll: {} ms   Compaction: {}",
            config.jobs.worker_pool_size,
            config.jobs.poll_interval_ms,
            if config.compaction.enabled {
                config.compaction.cron.as_str()
            } else {
                "disabled"
            }
        );
        println!("  {}", style("Press Ctrl+C to stop").dim());
        println!();
    }

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });

    // External tasks are left to out-of-process workers (`orch task fetch`).
    state.engine.serve(WorkerRegistry::new(), shutdown).await?;

    if !quiet {
        println!("\n  Stopped.");
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
