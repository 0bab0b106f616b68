//! Process-wide hooks: the unhandled-error callback and the instance registry.

use std::sync::{Arc, Mutex, Weak};

/// An executor-level failure: a fault in the scheduling machinery itself, not
/// in a job's payload.
///
/// These are never recorded on a job. They are surfaced only through the
/// registered [`ErrorHook`], as a systemic signal for supervision.
#[derive(Debug)]
pub struct ExecutorError {
    /// Identity of the worker task that hit the fault.
    pub worker_name: String,
    /// The underlying error.
    pub error: anyhow::Error,
}

impl ExecutorError {
    /// The captured trace, including the error's cause chain.
    pub fn trace(&self) -> String {
        format!("{:?}", self.error)
    }
}

/// Callback invoked for every [`ExecutorError`].
pub type ErrorHook = Arc<dyn Fn(&ExecutorError) + Send + Sync>;

/// The default hook: log and move on.
pub(crate) fn log_executor_error(error: &ExecutorError) {
    tracing::error!(
        worker.name = %error.worker_name,
        error = %error.error,
        "unhandled executor error"
    );
}

/// Lifecycle status exposed by every runtime component.
pub trait LifecycleStatus {
    /// A short component name, e.g. `"notifier"`.
    fn component_name(&self) -> &'static str;
    /// Whether the component's background work has fully stopped.
    fn is_shutdown(&self) -> bool;
}

/// An explicit registry of live runtime components.
///
/// Supervising code and tests enumerate running components through this
/// object instead of ambient global state. A registry is created (or shared)
/// by the embedding application, injected into each
/// [`Capsule`](crate::Capsule) at construction, and [`clear`](Self::clear)ed
/// between test runs. Entries are weak: a dropped component disappears from
/// the registry on the next snapshot.
#[derive(Default)]
pub struct InstanceRegistry {
    entries: Mutex<Vec<Weak<dyn LifecycleStatus + Send + Sync>>>,
}

impl InstanceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a component instance.
    pub fn register(&self, instance: Weak<dyn LifecycleStatus + Send + Sync>) {
        let mut entries = self.lock_entries();
        entries.retain(|entry| entry.strong_count() > 0);
        entries.push(instance);
    }

    /// Snapshot the live components as `(name, is_shutdown)` pairs.
    pub fn snapshot(&self) -> Vec<(&'static str, bool)> {
        self.lock_entries()
            .iter()
            .filter_map(Weak::upgrade)
            .map(|instance| (instance.component_name(), instance.is_shutdown()))
            .collect()
    }

    /// Whether every live component reports itself shut down.
    pub fn all_shutdown(&self) -> bool {
        self.snapshot().iter().all(|(_, shutdown)| *shutdown)
    }

    /// Forget all tracked instances.
    pub fn clear(&self) {
        self.lock_entries().clear();
    }

    fn lock_entries(
        &self,
    ) -> std::sync::MutexGuard<'_, Vec<Weak<dyn LifecycleStatus + Send + Sync>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("instances", &self.snapshot())
            .finish()
    }
}
