//! Background workers: the per-partition projector and the outbox relay.

pub mod outbox_relay;
pub mod projection_worker;

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

pub use outbox_relay::{OutboxRelay, RelayStats};
pub use projection_worker::{ProjectorHandle, ProjectorSettings, ProjectorWorker};

/// Handle to signal and join a group of background tasks.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    pub(crate) fn new(name: &'static str, shutdown: watch::Sender<bool>, tasks: Vec<JoinHandle<()>>) -> Self {
        Self { name, shutdown, tasks }
    }

    /// Number of tasks still owned by this handle.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Request graceful shutdown and wait for every task to stop.
    ///
    /// Each task finishes the item it is working on before exiting.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(worker = self.name, error = %e, "worker task ended abnormally");
            }
        }
    }
}

/// Sleep for `period` unless shutdown is requested first. Returns `true` to stop.
pub(crate) async fn idle(shutdown: &mut watch::Receiver<bool>, period: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(period) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}
