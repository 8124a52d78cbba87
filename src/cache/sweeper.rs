//! Periodic background sweep.
//!
//! One tokio task per coordinator ticks at the configured interval and runs
//! [`CacheCoordinator::sweep_once`]. It stops when the handle is shut down or
//! dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::coordinator::CacheCoordinator;

/// Owns the sweep task. Dropping it also stops the task.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the task and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Sweeper task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

pub(crate) fn spawn(coordinator: Arc<CacheCoordinator>, interval: Duration) -> SweeperHandle {
    let (shutdown, mut stop) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        info!(interval_ms = interval.as_millis() as u64, "Sweeper started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match coordinator.sweep_once().await {
                        Ok(report) => debug!(purged = report.total(), "Sweep tick"),
                        Err(e) => warn!(error = %e, "Sweep failed"),
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Sweeper stopped");
    });

    SweeperHandle { shutdown, task }
}
