//! Shared plumbing for background components: a cancellation token, the task
//! handle, and an observable shut-down flag.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Lifecycle state shared between a component and its spawned task.
///
/// The shut-down flag is set by the task itself on exit, so `is_shutdown`
/// reflects the task actually having stopped, not merely having been asked to.
#[derive(Debug)]
pub(crate) struct TaskLifecycle {
    token: CancellationToken,
    shutdown: Arc<AtomicBool>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TaskLifecycle {
    /// Spawn `task` built from this lifecycle's token; the flag flips when the
    /// task returns.
    pub(crate) fn spawn<F, Fut>(task: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let shutdown = Arc::new(AtomicBool::new(false));

        let future = task(token.clone());
        let flag = shutdown.clone();
        let handle = tokio::spawn(async move {
            future.await;
            flag.store(true, Ordering::SeqCst);
        });

        Self {
            token,
            shutdown,
            handle: std::sync::Mutex::new(Some(handle)),
        }
    }

    /// Whether the task has exited.
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Request the task to stop and wait for it to exit.
    pub(crate) async fn stop(&self) {
        self.token.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                if !error.is_cancelled() {
                    tracing::warn!(%error, "background component task panicked");
                }
            }
        }
    }
}
