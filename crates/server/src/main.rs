mod bootstrap;
mod health;

use std::time::Duration;

use anyhow::Result;
use itinera_core::approvals::TimeoutWorker;
use itinera_core::config::{AppConfig, LoadOptions};
use tokio::sync::oneshot;

fn init_logging(config: &AppConfig) {
    use itinera_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;

    health::spawn(
        &app.config.server.bind_address,
        app.config.server.health_check_port,
        app.db_pool.clone(),
        app.engine.clone(),
    )
    .await?;

    let (stop_worker, worker_stopped) = oneshot::channel::<()>();
    let worker = TimeoutWorker::new(app.engine.clone(), app.config.engine.timeout_poll_interval());
    let worker_handle = tokio::spawn(worker.run(async {
        let _ = worker_stopped.await;
    }));

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        pending_timers = app.engine.pending_timers().await,
        "itinera-server started"
    );
    wait_for_shutdown().await?;
    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "itinera-server stopping"
    );

    let _ = stop_worker.send(());
    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    match tokio::time::timeout(grace, worker_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            tracing::warn!(
                event_name = "system.server.worker_failed",
                correlation_id = "shutdown",
                error = %error,
                "timeout worker task ended abnormally"
            );
        }
        Err(_) => {
            tracing::warn!(
                event_name = "system.server.worker_shutdown_timeout",
                correlation_id = "shutdown",
                grace_secs = grace.as_secs(),
                "timeout worker did not stop within the grace period"
            );
        }
    }

    app.db_pool.close().await;
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
