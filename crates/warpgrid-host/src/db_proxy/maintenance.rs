//! Background pool maintenance.
//!
//! A single task per manager wakes every `health_check_interval`, reaps
//! idle connections past `idle_timeout` and probes the rest. It only ever
//! touches idle connections, so it never races with a handle holder.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::ConnectionPoolManager;

/// Lower bound on the sweep period, so a zero interval cannot spin.
const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Handle to a running maintenance task.
#[derive(Debug)]
pub struct MaintenanceHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MaintenanceHandle {
    /// Stop the task and wait for the current sweep to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "pool maintenance task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Start the periodic reap + probe sweep for `manager`.
pub fn spawn_maintenance(manager: Arc<ConnectionPoolManager>) -> MaintenanceHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(run_maintenance_loop(manager, shutdown_rx));
    MaintenanceHandle { shutdown_tx, task }
}

async fn run_maintenance_loop(
    manager: Arc<ConnectionPoolManager>,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = manager.config().health_check_interval.max(MIN_INTERVAL);
    tracing::info!(interval = ?interval, "pool maintenance started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let reaped = manager.reap_idle().await;
                let removed = manager.health_check_idle().await;
                if reaped + removed > 0 {
                    tracing::debug!(reaped, removed, "pool maintenance sweep");
                }
            }
            _ = shutdown.changed() => {
                break;
            }
        }
    }

    tracing::info!("pool maintenance stopped");
}
