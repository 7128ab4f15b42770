//! Background task ownership for the batching loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Handle to the task running a batching loop.
///
/// The task receives a `running` flag and a [`Notify`] when it is spawned.
/// [`notify`](Self::notify) wakes it when requests arrive; dropping the handle
/// clears the flag and wakes it one last time so it can exit.
pub struct BatchWorkerHandle {
    running: Arc<AtomicBool>,
    notifier: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl BatchWorkerHandle {
    /// Spawn the worker.
    ///
    /// # Parameters
    ///
    /// * `spawn` - Starts the task given the shared running flag and notifier
    pub fn new<F>(spawn: F) -> Self
    where F: FnOnce(Arc<AtomicBool>, Arc<Notify>) -> JoinHandle<()>
    {
        let running = Arc::new(AtomicBool::new(true));
        let notifier = Arc::new(Notify::new());
        let handle = spawn(running.clone(), notifier.clone());
        Self { running, notifier, handle: Some(handle) }
    }

    /// Wake the worker because new work is queued.
    pub fn notify(&self) {
        self.notifier.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask the worker to stop after its current iteration.
    ///
    /// Does not wait for the task; in-flight requests see their streams end.
    pub fn shutdown(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.notifier.notify_one();
        if let Some(handle) = self.handle.take() {
            tracing::debug!("batching worker shutting down");
            // Detach; the loop observes the flag on its next pass.
            drop(handle);
        }
    }
}

impl Drop for BatchWorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
