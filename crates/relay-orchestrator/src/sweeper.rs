use crate::manager::TaskManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// Background loop that runs the timeout sweep on a fixed interval,
/// independent of request traffic.
pub struct TimeoutSweeper {
    manager: Arc<TaskManager>,
    interval: Duration,
}

impl TimeoutSweeper {
    pub fn new(manager: Arc<TaskManager>, interval: Duration) -> Self {
        Self { manager, interval }
    }

    /// Run one sweep. Returns the number of tasks that had timed out.
    ///
    /// Expired locks and payloads in the queue store are reclaimed on the same tick.
    pub async fn sweep_once(&self) -> usize {
        if let Err(e) = self.manager.queue().purge_expired().await {
            warn!(error = %e, "Could not purge expired queue records");
        }
        match self.manager.check_task_timeouts().await {
            Ok(handled) => handled.len(),
            Err(e) => {
                error!(error = %e, "Timeout sweep failed");
                0
            }
        }
    }

    /// Spawn the sweep loop.
    ///
    /// Returns the [`tokio::task::JoinHandle`] so the caller can abort it on shutdown.
    /// A failed sweep is logged and retried on the next tick.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = self.interval.as_secs(), "Timeout sweeper started");
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep_once().await;
            }
        })
    }
}
