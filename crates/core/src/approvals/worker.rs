use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::engine::ApprovalEngine;

/// Polls the engine's timer index and fires due step deadlines until the
/// shutdown future resolves.
pub struct TimeoutWorker {
    engine: Arc<ApprovalEngine>,
    poll_interval: Duration,
}

impl TimeoutWorker {
    pub fn new(engine: Arc<ApprovalEngine>, poll_interval: Duration) -> Self {
        Self { engine, poll_interval }
    }

    pub async fn run<S>(self, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            event_name = "approval.timeout_worker.started",
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "timeout worker started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => self.tick().await,
            }
        }

        info!(event_name = "approval.timeout_worker.stopped", "timeout worker stopped");
    }

    async fn tick(&self) {
        match self.engine.fire_due_timeouts().await {
            Ok(0) => {}
            Ok(expired) => {
                debug!(event_name = "approval.timeout_worker.fired", expired, "expired due steps");
            }
            Err(error) => {
                warn!(
                    event_name = "approval.timeout_worker.failed",
                    error = %error,
                    "timeout poll failed; continuing worker loop"
                );
            }
        }
    }
}
