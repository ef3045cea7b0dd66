//! Priority task queue with retry accounting and cancel/pause hooks.
//!
//! Ordering is `(priority desc, creation order asc)`. The queue itself is
//! unbounded; `next()` refuses to activate a task while the active set is at
//! `max_concurrent`. Every task known to the queue lives in exactly one of
//! queue / active / completed / failed.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::events::{ObserverId, ObserverRegistry};
use crate::task::{SharedTask, TaskControl, TaskPriority, TaskStatus};

/// What `complete` did with the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteOutcome {
    /// Appended to the completed log.
    Completed,
    /// Retryable failure: re-enqueued with an incremented retry counter.
    Requeued,
    /// Retries exhausted (or permanent failure): appended to the failed log.
    Failed,
}

/// Counts and id lists handed to queue observers on every state change.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueSnapshot {
    pub queued: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub max_concurrent: usize,
    pub queued_ids: Vec<String>,
    pub active_ids: Vec<String>,
}

struct QueuedEntry {
    id: String,
    priority: TaskPriority,
    seq: u64,
    task: SharedTask,
}

impl PartialEq for QueuedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedEntry {}

impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority wins, then earlier submission.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct ActiveEntry {
    task: SharedTask,
    control: TaskControl,
    priority: TaskPriority,
}

struct QueueInner {
    heap: BinaryHeap<QueuedEntry>,
    /// Ids removed from the queue before being popped; skipped lazily.
    removed: HashSet<String>,
    active: HashMap<String, ActiveEntry>,
    completed: Vec<SharedTask>,
    failed: Vec<SharedTask>,
    max_concurrent: usize,
    next_seq: u64,
}

impl QueueInner {
    fn snapshot(&self) -> QueueSnapshot {
        let queued_ids: Vec<String> = self
            .heap
            .iter()
            .filter(|entry| !self.removed.contains(&entry.id))
            .map(|entry| entry.id.clone())
            .collect();
        QueueSnapshot {
            queued: queued_ids.len(),
            active: self.active.len(),
            completed: self.completed.len(),
            failed: self.failed.len(),
            max_concurrent: self.max_concurrent,
            queued_ids,
            active_ids: self.active.keys().cloned().collect(),
        }
    }

    fn push(&mut self, task: SharedTask, priority: TaskPriority) {
        let id = task.read().id.clone();
        self.removed.remove(&id);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueuedEntry {
            id,
            priority,
            seq,
            task,
        });
    }
}

pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    observers: ObserverRegistry<QueueSnapshot>,
}

impl TaskQueue {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                removed: HashSet::new(),
                active: HashMap::new(),
                completed: Vec::new(),
                failed: Vec::new(),
                max_concurrent: max_concurrent.max(1),
                next_seq: 0,
            }),
            observers: ObserverRegistry::new(),
        }
    }

    /// Enqueue a task. The task keeps (or returns to) `Pending` status.
    pub fn add(&self, task: SharedTask, priority: TaskPriority) {
        let snapshot = {
            let mut inner = self.inner.lock();
            inner.push(task, priority);
            inner.snapshot()
        };
        self.observers.notify(&snapshot);
    }

    /// Dequeue the next task if a slot is free, moving it into the active
    /// set. Returns the task together with its cooperative control handles.
    pub fn next(&self) -> Option<(SharedTask, TaskControl)> {
        let (result, snapshot) = {
            let mut inner = self.inner.lock();
            if inner.active.len() >= inner.max_concurrent {
                return None;
            }
            let mut popped = None;
            while let Some(entry) = inner.heap.pop() {
                if inner.removed.remove(&entry.id) {
                    continue;
                }
                popped = Some(entry);
                break;
            }
            let entry = popped?;
            let control = TaskControl::new();
            inner.active.insert(
                entry.id.clone(),
                ActiveEntry {
                    task: entry.task.clone(),
                    control: control.clone(),
                    priority: entry.priority,
                },
            );
            (Some((entry.task, control)), inner.snapshot())
        };
        self.observers.notify(&snapshot);
        result
    }

    /// Report the outcome of an active task. On failure, the task is
    /// re-enqueued while its retry budget lasts; `allow_retry = false`
    /// (permanent failures) sends it straight to the failed log.
    pub fn complete(&self, task_id: &str, success: bool) -> Option<CompleteOutcome> {
        self.complete_with_retry_hint(task_id, success, true)
    }

    pub fn complete_with_retry_hint(
        &self,
        task_id: &str,
        success: bool,
        allow_retry: bool,
    ) -> Option<CompleteOutcome> {
        let (outcome, snapshot) = {
            let mut inner = self.inner.lock();
            let entry = inner.active.remove(task_id)?;
            let outcome = if success {
                entry.task.write().transition(TaskStatus::Completed);
                inner.completed.push(entry.task);
                CompleteOutcome::Completed
            } else {
                let (retry_count, budget) = {
                    let task = entry.task.read();
                    (task.retry_count, task.options.retry_attempts())
                };
                if allow_retry && retry_count < budget {
                    {
                        let mut task = entry.task.write();
                        task.retry_count += 1;
                        task.transition(TaskStatus::Pending);
                    }
                    debug!(
                        task_id,
                        attempt = retry_count + 1,
                        budget,
                        "Re-enqueueing failed task"
                    );
                    inner.push(entry.task, entry.priority);
                    CompleteOutcome::Requeued
                } else {
                    entry.task.write().transition(TaskStatus::Failed);
                    inner.failed.push(entry.task);
                    CompleteOutcome::Failed
                }
            };
            (outcome, inner.snapshot())
        };
        self.observers.notify(&snapshot);
        Some(outcome)
    }

    /// Remove a task from the queue or active set and mark it cancelled.
    /// For active tasks this fires the cancellation token; the driver calls
    /// [`TaskQueue::finish_cancelled`] once the downloader has unwound.
    pub fn cancel(&self, task_id: &str) -> bool {
        let (found, snapshot) = {
            let mut inner = self.inner.lock();
            if let Some(entry) = inner.active.get(task_id) {
                entry.control.cancel.cancel();
                entry.control.pause.resume();
                (true, inner.snapshot())
            } else {
                let queued = inner
                    .heap
                    .iter()
                    .any(|entry| entry.id == task_id && !inner.removed.contains(&entry.id));
                if queued {
                    let entry_task = inner
                        .heap
                        .iter()
                        .find(|entry| entry.id == task_id)
                        .map(|entry| entry.task.clone());
                    inner.removed.insert(task_id.to_string());
                    if let Some(task) = entry_task {
                        task.write().transition(TaskStatus::Cancelled);
                    }
                    (true, inner.snapshot())
                } else {
                    (false, inner.snapshot())
                }
            }
        };
        if found {
            self.observers.notify(&snapshot);
        }
        found
    }

    /// Remove a cancelled task from the active set after its downloader has
    /// observed the token and unwound.
    pub fn finish_cancelled(&self, task_id: &str) -> bool {
        let (found, snapshot) = {
            let mut inner = self.inner.lock();
            match inner.active.remove(task_id) {
                Some(entry) => {
                    entry.task.write().transition(TaskStatus::Cancelled);
                    (true, inner.snapshot())
                }
                None => (false, inner.snapshot()),
            }
        };
        if found {
            self.observers.notify(&snapshot);
        }
        found
    }

    /// Pause an active task. Invalid for queued or terminal tasks.
    pub fn pause(&self, task_id: &str) -> bool {
        let inner = self.inner.lock();
        let Some(entry) = inner.active.get(task_id) else {
            return false;
        };
        if !entry.task.write().transition(TaskStatus::Paused) {
            return false;
        }
        entry.control.pause.pause();
        true
    }

    /// Resume a paused active task.
    pub fn resume(&self, task_id: &str) -> bool {
        let inner = self.inner.lock();
        let Some(entry) = inner.active.get(task_id) else {
            return false;
        };
        if !entry.task.write().transition(TaskStatus::Downloading) {
            return false;
        }
        entry.control.pause.resume();
        true
    }

    /// Move every failed task back to the queue with a fresh retry budget.
    pub fn retry_failed(&self) -> usize {
        let (count, snapshot) = {
            let mut inner = self.inner.lock();
            let failed = std::mem::take(&mut inner.failed);
            let count = failed.len();
            for task in failed {
                {
                    // Administrative reset: this deliberately steps outside
                    // the normal state machine, giving the task a clean slate.
                    let mut task = task.write();
                    task.status = TaskStatus::Pending;
                    task.retry_count = 0;
                    task.error_message = None;
                    task.completed_at = None;
                }
                let priority = TaskPriority::Normal;
                inner.push(task, priority);
            }
            (count, inner.snapshot())
        };
        if count > 0 {
            self.observers.notify(&snapshot);
        }
        count
    }

    pub fn clear_completed(&self) -> usize {
        let (count, snapshot) = {
            let mut inner = self.inner.lock();
            let count = inner.completed.len();
            inner.completed.clear();
            (count, inner.snapshot())
        };
        self.observers.notify(&snapshot);
        count
    }

    pub fn clear_failed(&self) -> usize {
        let (count, snapshot) = {
            let mut inner = self.inner.lock();
            let count = inner.failed.len();
            inner.failed.clear();
            (count, inner.snapshot())
        };
        self.observers.notify(&snapshot);
        count
    }

    /// Adjust how many tasks may be active at once (minimum 1).
    pub fn set_max_concurrent(&self, max_concurrent: usize) {
        let snapshot = {
            let mut inner = self.inner.lock();
            inner.max_concurrent = max_concurrent.max(1);
            inner.snapshot()
        };
        self.observers.notify(&snapshot);
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.lock().max_concurrent
    }

    pub fn get_task(&self, task_id: &str) -> Option<SharedTask> {
        let inner = self.inner.lock();
        if let Some(entry) = inner.active.get(task_id) {
            return Some(entry.task.clone());
        }
        for task in inner.completed.iter().chain(inner.failed.iter()) {
            if task.read().id == task_id {
                return Some(task.clone());
            }
        }
        inner
            .heap
            .iter()
            .find(|entry| entry.id == task_id && !inner.removed.contains(&entry.id))
            .map(|entry| entry.task.clone())
    }

    /// Control handles for an active task, if any.
    pub fn active_control(&self, task_id: &str) -> Option<TaskControl> {
        self.inner
            .lock()
            .active
            .get(task_id)
            .map(|entry| entry.control.clone())
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock();
        inner.active.is_empty()
            && inner
                .heap
                .iter()
                .all(|entry| inner.removed.contains(&entry.id))
    }

    pub fn has_capacity(&self) -> bool {
        let inner = self.inner.lock();
        inner.active.len() < inner.max_concurrent
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.inner.lock().snapshot()
    }

    pub fn add_observer<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&QueueSnapshot) + Send + Sync + 'static,
    {
        self.observers.add(observer)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.observers.remove(id)
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("TaskQueue")
            .field("queued", &snapshot.queued)
            .field("active", &snapshot.active)
            .field("completed", &snapshot.completed)
            .field("failed", &snapshot.failed)
            .finish()
    }
}
