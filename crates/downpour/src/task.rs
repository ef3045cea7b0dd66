//! Task model: the unit of work the manager coordinates, plus the
//! cooperative pause/cancel handles shared with the downloaders.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::DownloadError;
use crate::extractor::MediaMetadata;
use crate::options::DownloadOptions;

/// Lifecycle states of a download task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal states are absorbing.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine permits `self -> next`.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Downloading) => true,
            (Downloading, Paused) => true,
            (Paused, Downloading) => true,
            (Downloading, Completed) => true,
            (Downloading, Failed) => true,
            // Retryable failure re-enqueues the task.
            (Downloading, Pending) => true,
            (current, Cancelled) => !current.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Queue priority. Ordering is `low < normal < high < urgent`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// The unit of work. Identity is the `id`; two tasks are equal iff their
/// identifiers match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub url: String,
    pub metadata: Option<MediaMetadata>,
    pub status: TaskStatus,
    /// Fractional progress in [0, 100].
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    /// Last-observed speed in bytes per second.
    pub speed: f64,
    pub eta_secs: Option<u64>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub options: DownloadOptions,
}

impl Task {
    pub fn new(url: impl Into<String>, options: DownloadOptions) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            url: url.into(),
            metadata: None,
            status: TaskStatus::Pending,
            progress: 0.0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            downloaded_bytes: 0,
            total_bytes: None,
            speed: 0.0,
            eta_secs: None,
            error_message: None,
            retry_count: 0,
            options,
        }
    }

    /// Apply a state transition, stamping timestamps. Returns false (and
    /// leaves the task untouched) when the state machine forbids the move.
    pub fn transition(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        if next == TaskStatus::Downloading && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        self.status = next;
        true
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Task {}

/// Shared handle to a task, mutated in place by the queue, the manager and
/// the progress collector.
pub type SharedTask = Arc<RwLock<Task>>;

pub fn shared(task: Task) -> SharedTask {
    Arc::new(RwLock::new(task))
}

/// Notify-on-resume pause signal.
///
/// Downloaders block in `wait_until_resumed` between chunks instead of
/// polling a flag on a sleep loop.
#[derive(Debug, Clone)]
pub struct PauseGate {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn pause(&self) {
        let _ = self.tx.send(true);
    }

    pub fn resume(&self) {
        let _ = self.tx.send(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }

    /// Block while the gate is paused. Cancellation wins over resume.
    pub async fn wait_until_resumed(
        &self,
        token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let mut rx = self.tx.subscribe();
        loop {
            if !*rx.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                _ = token.cancelled() => return Err(DownloadError::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        // Sender dropped; nothing will ever resume us again.
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Cooperative control handles handed to the downloader driving a task.
#[derive(Debug, Clone, Default)]
pub struct TaskControl {
    pub cancel: CancellationToken,
    pub pause: PauseGate,
}

impl TaskControl {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            pause: PauseGate::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn task() -> Task {
        Task::new("http://example.com/video.mp4", DownloadOptions::default())
    }

    #[test]
    fn identifiers_are_unique() {
        assert_ne!(task().id, task().id);
    }

    #[test]
    fn equality_is_by_identifier() {
        let a = task();
        let mut b = a.clone();
        b.url = "http://example.com/other.mp4".to_string();
        assert_eq!(a, b);
    }

    #[test]
    fn priority_ordering() {
        assert!(TaskPriority::Low < TaskPriority::Normal);
        assert!(TaskPriority::Normal < TaskPriority::High);
        assert!(TaskPriority::High < TaskPriority::Urgent);
    }

    #[test]
    fn happy_path_transitions() {
        let mut t = task();
        assert!(t.transition(TaskStatus::Downloading));
        assert!(t.started_at.is_some());
        assert!(t.transition(TaskStatus::Paused));
        assert!(t.transition(TaskStatus::Downloading));
        assert!(t.transition(TaskStatus::Completed));
        assert!(t.completed_at.is_some());
    }

    #[test]
    fn terminal_states_are_absorbing() {
        for terminal in [
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            for next in [
                TaskStatus::Pending,
                TaskStatus::Downloading,
                TaskStatus::Paused,
                TaskStatus::Completed,
                TaskStatus::Failed,
                TaskStatus::Cancelled,
            ] {
                assert!(
                    !terminal.can_transition_to(next),
                    "{terminal} -> {next} must be forbidden"
                );
            }
        }
    }

    #[test]
    fn cancel_reaches_any_non_terminal_state() {
        for state in [
            TaskStatus::Pending,
            TaskStatus::Downloading,
            TaskStatus::Paused,
        ] {
            assert!(state.can_transition_to(TaskStatus::Cancelled));
        }
    }

    #[test]
    fn retryable_failure_returns_to_pending() {
        let mut t = task();
        assert!(t.transition(TaskStatus::Downloading));
        assert!(t.transition(TaskStatus::Pending));
        assert_eq!(t.status, TaskStatus::Pending);
    }

    #[test]
    fn pause_is_only_valid_while_downloading() {
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Paused));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Paused));
    }

    #[tokio::test]
    async fn pause_gate_blocks_until_resumed() {
        let gate = PauseGate::new();
        let token = CancellationToken::new();
        gate.pause();

        let gate_clone = gate.clone();
        let token_clone = token.clone();
        let waiter =
            tokio::spawn(async move { gate_clone.wait_until_resumed(&token_clone).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        gate.resume();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter finished")
            .expect("no panic");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn cancellation_interrupts_paused_wait() {
        let gate = PauseGate::new();
        let token = CancellationToken::new();
        gate.pause();

        let gate_clone = gate.clone();
        let token_clone = token.clone();
        let waiter =
            tokio::spawn(async move { gate_clone.wait_until_resumed(&token_clone).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter finished")
            .expect("no panic");
        assert!(matches!(result, Err(DownloadError::Cancelled)));
    }
}
