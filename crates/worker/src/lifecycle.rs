// Run/stop bookkeeping shared by the scheduler and the sender

use parking_lot::Mutex;
use tokio::sync::watch;

/// Worker status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Not running; `run` may be called
    Stopped,
    /// Inside `run`
    Running,
    /// Stop requested; `run` is winding down
    Stopping,
}

/// Status plus the shutdown signal observed by a run loop
///
/// Transitions happen under one lock so a `stop` can never slip between
/// the status check and the subscription in `begin`.
pub(crate) struct Lifecycle {
    status: Mutex<WorkerStatus>,
    shutdown_tx: watch::Sender<bool>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            status: Mutex::new(WorkerStatus::Stopped),
            shutdown_tx,
        }
    }

    /// Enter `Running` and subscribe to the shutdown signal
    ///
    /// `None` when the worker is already running.
    pub(crate) fn begin(&self) -> Option<watch::Receiver<bool>> {
        let mut status = self.status.lock();
        if *status != WorkerStatus::Stopped {
            return None;
        }
        *status = WorkerStatus::Running;
        self.shutdown_tx.send_replace(false);
        Some(self.shutdown_tx.subscribe())
    }

    /// Signal the running loop; no-op unless running
    ///
    /// Returns true when this call requested the stop.
    pub(crate) fn stop(&self) -> bool {
        let mut status = self.status.lock();
        if *status != WorkerStatus::Running {
            return false;
        }
        *status = WorkerStatus::Stopping;
        self.shutdown_tx.send_replace(true);
        true
    }

    /// Back to `Stopped` once the loop has returned
    pub(crate) fn finish(&self) {
        let mut status = self.status.lock();
        *status = WorkerStatus::Stopped;
        self.shutdown_tx.send_replace(false);
    }

    pub(crate) fn status(&self) -> WorkerStatus {
        *self.status.lock()
    }
}
