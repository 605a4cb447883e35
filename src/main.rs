//! Aegis defense daemon
//!
//! Watches the kernel-security event stream, blocks violating addresses at
//! the edge, and optionally exposes Prometheus metrics. Runs until SIGINT.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use aegis::metrics::serve_metrics;
use aegis::tracing::{init_tracing, shutdown_tracing};
use aegis::{DefenseConfig, DefenseContext};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = DefenseConfig::from_env()?;
    init_tracing("aegis", config.otlp_endpoint.as_deref(), config.log_json)?;

    let ctx = DefenseContext::from_config(&config).await;
    let cancel = CancellationToken::new();

    let metrics_task = match config.metrics_addr {
        Some(addr) => {
            let listener = TcpListener::bind(addr).await?;
            Some(tokio::spawn(serve_metrics(listener, cancel.clone())))
        }
        None => None,
    };

    let watcher = Arc::clone(&ctx.watcher);
    let watcher_cancel = cancel.clone();
    let watcher_task = tokio::spawn(async move { watcher.run(watcher_cancel).await });

    info!("Aegis running; press Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }

    info!("Shutting down");
    cancel.cancel();
    if let Err(e) = watcher_task.await {
        error!(error = %e, "watcher task panicked");
    }
    if let Some(task) = metrics_task {
        let _ = task.await;
    }

    info!(
        blocked_attacks = ctx.controller.blocked_attacks(),
        sandbox_runs = ctx.sandbox.completed_runs(),
        "Final counters"
    );
    shutdown_tracing();
    Ok(())
}
