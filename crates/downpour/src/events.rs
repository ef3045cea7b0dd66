//! Observer fan-out for manager, queue and tracker events.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::progress::AggregateProgress;
use crate::queue::QueueSnapshot;
use crate::task::Task;

/// Handle returned by `add`, used to deregister an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Ordered registry of callbacks. Callbacks fire in registration order and
/// are invoked outside the registry lock, so an observer may re-enter the
/// engine (e.g. cancel a task from a progress callback).
pub struct ObserverRegistry<T> {
    observers: Mutex<Vec<(ObserverId, Arc<dyn Fn(&T) + Send + Sync>)>>,
    next_id: AtomicU64,
}

impl<T> Default for ObserverRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ObserverRegistry<T> {
    pub fn new() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn add<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().push((id, Arc::new(observer)));
        id
    }

    pub fn remove(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(observer_id, _)| *observer_id != id);
        observers.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.observers.lock().is_empty()
    }

    /// Snapshot the observer list, release the lock, then invoke in order.
    pub fn notify(&self, value: &T) {
        let snapshot: Vec<Arc<dyn Fn(&T) + Send + Sync>> = self
            .observers
            .lock()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in snapshot {
            observer(value);
        }
    }
}

impl<T> std::fmt::Debug for ObserverRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("observers", &self.observers.lock().len())
            .finish()
    }
}

/// Events emitted by the download manager.
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    TaskAdded(Task),
    TaskStarted(Task),
    TaskCompleted(Task),
    TaskFailed(Task),
    TaskCancelled(Task),
    ProgressUpdated(AggregateProgress),
    QueueChanged(QueueSnapshot),
}

impl DownloadEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TaskAdded(_) => "task_added",
            Self::TaskStarted(_) => "task_started",
            Self::TaskCompleted(_) => "task_completed",
            Self::TaskFailed(_) => "task_failed",
            Self::TaskCancelled(_) => "task_cancelled",
            Self::ProgressUpdated(_) => "progress_updated",
            Self::QueueChanged(_) => "queue_changed",
        }
    }
}
