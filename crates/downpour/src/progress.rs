//! Per-task and aggregate progress tracking with windowed speed estimation
//! and observer fan-out.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::events::{ObserverId, ObserverRegistry};
use crate::task::TaskStatus;

/// How often the tracker recomputes the aggregate and notifies observers.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Samples kept per task for speed estimation.
const SAMPLE_RING_CAPACITY: usize = 10;

/// Most recent samples used for the windowed speed.
const SPEED_WINDOW: usize = 5;

/// A progress report from a downloader to the tracker.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub task_id: String,
    /// Cumulative bytes written so far.
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    /// Explicit percentage override. The HLS path reports segment counts
    /// here; byte-based paths leave it `None` and the tracker derives the
    /// percentage from the byte totals.
    pub percentage: Option<f64>,
}

/// Cheap cloneable handle downloaders use to push progress without touching
/// the tracker directly. Reports are fire-and-forget; a full channel drops
/// the sample rather than stalling the transfer.
#[derive(Clone)]
pub struct ProgressReporter {
    task_id: String,
    tx: mpsc::Sender<ProgressUpdate>,
}

impl ProgressReporter {
    pub fn new(task_id: impl Into<String>, tx: mpsc::Sender<ProgressUpdate>) -> Self {
        Self {
            task_id: task_id.into(),
            tx,
        }
    }

    /// A reporter whose updates go nowhere; used by tests and probes.
    pub fn noop(task_id: impl Into<String>) -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self::new(task_id, tx)
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn report(&self, downloaded_bytes: u64, total_bytes: Option<u64>) {
        let _ = self.tx.try_send(ProgressUpdate {
            task_id: self.task_id.clone(),
            downloaded_bytes,
            total_bytes,
            percentage: None,
        });
    }

    pub fn report_percentage(
        &self,
        downloaded_bytes: u64,
        total_bytes: Option<u64>,
        percentage: f64,
    ) {
        let _ = self.tx.try_send(ProgressUpdate {
            task_id: self.task_id.clone(),
            downloaded_bytes,
            total_bytes,
            percentage: Some(percentage),
        });
    }
}

#[derive(Debug)]
struct TaskProgressState {
    status: TaskStatus,
    downloaded_bytes: u64,
    total_bytes: Option<u64>,
    percentage: f64,
    current_speed: f64,
    peak_speed: f64,
    started_at: Option<Instant>,
    samples: VecDeque<(Instant, u64)>,
}

impl TaskProgressState {
    fn new(total_bytes: Option<u64>) -> Self {
        Self {
            status: TaskStatus::Pending,
            downloaded_bytes: 0,
            total_bytes,
            percentage: 0.0,
            current_speed: 0.0,
            peak_speed: 0.0,
            started_at: None,
            samples: VecDeque::with_capacity(SAMPLE_RING_CAPACITY),
        }
    }

    fn push_sample(&mut self, now: Instant, bytes: u64) {
        if self.samples.len() >= SAMPLE_RING_CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back((now, bytes));

        if self.samples.len() >= 2 {
            let window: Vec<&(Instant, u64)> = self
                .samples
                .iter()
                .rev()
                .take(SPEED_WINDOW)
                .collect();
            let (t_last, b_last) = *window.first().expect("window nonempty");
            let (t_first, b_first) = *window.last().expect("window nonempty");
            let span = t_last.duration_since(*t_first).as_secs_f64();
            if span > 0.0 && b_last >= b_first {
                self.current_speed = (b_last - b_first) as f64 / span;
                if self.current_speed > self.peak_speed {
                    self.peak_speed = self.current_speed;
                }
            }
        }
    }

    fn average_speed(&self, now: Instant) -> f64 {
        match self.started_at {
            Some(start) => {
                let elapsed = now.duration_since(start).as_secs_f64();
                if elapsed > 0.0 {
                    self.downloaded_bytes as f64 / elapsed
                } else {
                    0.0
                }
            }
            None => 0.0,
        }
    }

    fn eta_secs(&self) -> Option<u64> {
        let total = self.total_bytes?;
        if self.current_speed <= 0.0 || total <= self.downloaded_bytes {
            return None;
        }
        Some(((total - self.downloaded_bytes) as f64 / self.current_speed) as u64)
    }
}

/// Public per-task progress snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct TaskProgress {
    pub task_id: String,
    pub status: TaskStatus,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub percentage: f64,
    pub current_speed: f64,
    pub average_speed: f64,
    pub peak_speed: f64,
    pub eta_secs: Option<u64>,
}

/// Totals across all tracked tasks.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregateProgress {
    pub total_tasks: usize,
    pub active_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub downloaded_bytes: u64,
    /// Sum of the known sizes only; tasks with unknown size do not contribute.
    pub total_bytes: u64,
    pub overall_speed: f64,
    pub eta_secs: Option<u64>,
}

/// Tracks progress for all live tasks and fans the aggregate out to
/// observers on a periodic tick.
pub struct ProgressTracker {
    tasks: Mutex<HashMap<String, TaskProgressState>>,
    observers: ObserverRegistry<AggregateProgress>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            observers: ObserverRegistry::new(),
        }
    }

    pub fn add_task(&self, task_id: impl Into<String>, total_bytes: Option<u64>) {
        self.tasks
            .lock()
            .insert(task_id.into(), TaskProgressState::new(total_bytes));
    }

    pub fn remove_task(&self, task_id: &str) {
        self.tasks.lock().remove(task_id);
    }

    /// Apply a progress update. Updates for unknown tasks are ignored, which
    /// keeps the tracker idempotent during races with `remove_task`. A
    /// regressing byte counter is ignored too, so observed progress is
    /// monotonically non-decreasing.
    pub fn update_progress(&self, update: &ProgressUpdate) {
        let now = Instant::now();
        let mut tasks = self.tasks.lock();
        let Some(state) = tasks.get_mut(&update.task_id) else {
            debug!(task_id = %update.task_id, "Progress update for unknown task ignored");
            return;
        };
        if update.downloaded_bytes < state.downloaded_bytes {
            return;
        }
        if state.started_at.is_none() {
            state.started_at = Some(now);
        }
        state.downloaded_bytes = update.downloaded_bytes;
        if update.total_bytes.is_some() {
            state.total_bytes = update.total_bytes;
        }
        state.push_sample(now, update.downloaded_bytes);
        state.percentage = match update.percentage {
            Some(pct) => pct.clamp(0.0, 100.0),
            None => match state.total_bytes {
                Some(total) if total > 0 => {
                    ((state.downloaded_bytes as f64 / total as f64) * 100.0).min(100.0)
                }
                _ => state.percentage,
            },
        };
    }

    pub fn update_status(&self, task_id: &str, status: TaskStatus) {
        let mut tasks = self.tasks.lock();
        let Some(state) = tasks.get_mut(task_id) else {
            return;
        };
        if status == TaskStatus::Downloading && state.started_at.is_none() {
            state.started_at = Some(Instant::now());
        }
        if status == TaskStatus::Completed {
            state.percentage = 100.0;
        }
        state.status = status;
    }

    pub fn task_progress(&self, task_id: &str) -> Option<TaskProgress> {
        let now = Instant::now();
        let tasks = self.tasks.lock();
        let state = tasks.get(task_id)?;
        Some(TaskProgress {
            task_id: task_id.to_string(),
            status: state.status,
            downloaded_bytes: state.downloaded_bytes,
            total_bytes: state.total_bytes,
            percentage: state.percentage,
            current_speed: state.current_speed,
            average_speed: state.average_speed(now),
            peak_speed: state.peak_speed,
            eta_secs: state.eta_secs(),
        })
    }

    pub fn all_task_progress(&self) -> Vec<TaskProgress> {
        let ids: Vec<String> = self.tasks.lock().keys().cloned().collect();
        ids.iter()
            .filter_map(|id| self.task_progress(id))
            .collect()
    }

    pub fn aggregate(&self) -> AggregateProgress {
        let tasks = self.tasks.lock();
        let mut aggregate = AggregateProgress {
            total_tasks: tasks.len(),
            ..Default::default()
        };
        for state in tasks.values() {
            match state.status {
                TaskStatus::Downloading | TaskStatus::Paused => aggregate.active_tasks += 1,
                TaskStatus::Completed => aggregate.completed_tasks += 1,
                TaskStatus::Failed => aggregate.failed_tasks += 1,
                _ => {}
            }
            aggregate.downloaded_bytes += state.downloaded_bytes;
            if let Some(total) = state.total_bytes {
                aggregate.total_bytes += total;
            }
            if state.status == TaskStatus::Downloading && state.current_speed > 0.0 {
                aggregate.overall_speed += state.current_speed;
            }
        }
        if aggregate.overall_speed > 0.0 && aggregate.total_bytes > aggregate.downloaded_bytes {
            let remaining = aggregate.total_bytes - aggregate.downloaded_bytes;
            aggregate.eta_secs = Some((remaining as f64 / aggregate.overall_speed) as u64);
        }
        aggregate
    }

    pub fn add_observer<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&AggregateProgress) + Send + Sync + 'static,
    {
        self.observers.add(observer)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.observers.remove(id)
    }

    /// Notify observers with a fresh aggregate snapshot. The snapshot is
    /// taken under the lock, the callbacks run outside it.
    pub fn notify_observers(&self) {
        let aggregate = self.aggregate();
        self.observers.notify(&aggregate);
    }

    /// Spawn the periodic tick that fans the aggregate out to observers.
    pub fn start_ticker(self: &Arc<Self>, token: CancellationToken) {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(TICK_INTERVAL) => {
                        tracker.notify_observers();
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("tasks", &self.tasks.lock().len())
            .finish()
    }
}

/// Human-readable speed, e.g. "1.5 MB/s".
pub fn format_speed(bytes_per_sec: f64) -> String {
    const UNITS: [&str; 4] = ["B/s", "KB/s", "MB/s", "GB/s"];
    let mut value = bytes_per_sec.max(0.0);
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{value:.0} {}", UNITS[unit])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Human-readable size, e.g. "120.3 MB".
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// "HH:MM:SS" (or "MM:SS" under an hour); "--:--" when unknown.
pub fn format_eta(eta_secs: Option<u64>) -> String {
    match eta_secs {
        None => "--:--".to_string(),
        Some(secs) => {
            let hours = secs / 3600;
            let minutes = (secs % 3600) / 60;
            let seconds = secs % 60;
            if hours > 0 {
                format!("{hours:02}:{minutes:02}:{seconds:02}")
            } else {
                format!("{minutes:02}:{seconds:02}")
            }
        }
    }
}
