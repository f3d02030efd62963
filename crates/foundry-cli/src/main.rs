use anyhow::Context;
use tokio::sync::watch;

use foundry_core::app::{AppBuilder, WorkerExit};
use foundry_core::config::FoundryConfig;
use foundry_core::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = FoundryConfig::from_env().context("invalid configuration")?;
    telemetry::init(config.debug);

    tracing::info!(
        role = %config.role,
        agent_id = %config.agent_id,
        backend = config.queue.name(),
        "starting worker"
    );

    let app = AppBuilder::new(config)
        .build()
        .await
        .context("worker startup failed")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received");
        // ignore send error: the worker may already be gone
        let _ = shutdown_tx.send(true);
        // Keep the sender alive so a second signal is not mistaken for a drop.
        std::future::pending::<()>().await;
    });

    let report = app.run(shutdown_rx).await;
    if report.exit == WorkerExit::GraceExpired {
        tracing::error!("in-flight task did not finish within the drain grace period");
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable; Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
