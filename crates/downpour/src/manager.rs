//! Top-level coordinator: accept → queue → dispatch → downloader → progress.
//!
//! The manager owns the queue, worker pool and progress tracker and hands
//! narrow handles (control tokens, progress reporters) to the downloaders,
//! so the long-lived subsystems never point back at each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineSettings;
use crate::error::DownloadError;
use crate::events::{DownloadEvent, ObserverId, ObserverRegistry};
use crate::extractor::{Extractor, MediaMetadata};
use crate::hls::HlsDownloader;
use crate::http::HttpDownloader;
use crate::options::DownloadOptions;
use crate::pool::{PoolStats, WorkerPool, WorkerPoolConfig};
use crate::progress::{AggregateProgress, ProgressReporter, ProgressTracker, ProgressUpdate, TaskProgress};
use crate::queue::{CompleteOutcome, QueueSnapshot, TaskQueue};
use crate::selector::{DownloaderKind, classify_by_url, is_hls_content_type};
use crate::task::{SharedTask, Task, TaskControl, TaskPriority, TaskStatus, shared};

/// Hard cap on pool workers regardless of `set_max_concurrent_downloads`.
const MAX_POOL_WORKERS: usize = 16;

/// How long the dispatcher sleeps when the queue has nothing to hand out.
const DISPATCH_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Deadline for joining in-flight work during `stop`.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Aggregate counters exposed by [`DownloadManager::statistics`].
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatistics {
    pub total_tasks: usize,
    pub pending_tasks: usize,
    pub active_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub cancelled_tasks: usize,
    pub downloaded_bytes: u64,
    pub overall_speed: f64,
    pub uptime_secs: Option<u64>,
}

struct RuntimeState {
    token: CancellationToken,
    progress_tx: mpsc::Sender<ProgressUpdate>,
    started_at: Instant,
}

/// Task lifecycle coordinator.
pub struct DownloadManager {
    settings: EngineSettings,
    queue: Arc<TaskQueue>,
    pool: Arc<WorkerPool>,
    tracker: Arc<ProgressTracker>,
    tasks: Arc<Mutex<HashMap<String, SharedTask>>>,
    extractors: Arc<Vec<Arc<dyn Extractor>>>,
    observers: Arc<ObserverRegistry<DownloadEvent>>,
    runtime: Mutex<Option<RuntimeState>>,
}

impl DownloadManager {
    pub fn new(settings: EngineSettings) -> Arc<Self> {
        Self::with_extractors(settings, Vec::new())
    }

    pub fn with_extractors(
        settings: EngineSettings,
        extractors: Vec<Arc<dyn Extractor>>,
    ) -> Arc<Self> {
        let max_concurrent = settings.max_concurrent_downloads.max(1);
        let queue = Arc::new(TaskQueue::new(max_concurrent));
        let pool = Arc::new(WorkerPool::new(WorkerPoolConfig {
            max_workers: MAX_POOL_WORKERS,
            min_workers: 1,
            adaptive: crate::pool::AdaptivePoolConfig {
                enabled: true,
                ..Default::default()
            },
        }));
        pool.set_desired_workers(max_concurrent);
        let tracker = Arc::new(ProgressTracker::new());
        let observers = Arc::new(ObserverRegistry::new());

        // Bridge subsystem observers onto the manager's event surface.
        {
            let observers = Arc::clone(&observers);
            queue.add_observer(move |snapshot: &QueueSnapshot| {
                observers.notify(&DownloadEvent::QueueChanged(snapshot.clone()));
            });
        }
        {
            let observers = Arc::clone(&observers);
            tracker.add_observer(move |aggregate: &AggregateProgress| {
                observers.notify(&DownloadEvent::ProgressUpdated(aggregate.clone()));
            });
        }

        Arc::new(Self {
            settings,
            queue,
            pool,
            tracker,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            extractors: Arc::new(extractors),
            observers,
            runtime: Mutex::new(None),
        })
    }

    /// Spawn the dispatcher, the progress collector, the tracker tick and
    /// the pool's adaptive controller. Idempotent while running.
    pub fn start(self: &Arc<Self>) {
        let mut runtime = self.runtime.lock();
        if runtime.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let (progress_tx, progress_rx) = mpsc::channel::<ProgressUpdate>(256);

        self.spawn_progress_collector(progress_rx, token.clone());
        self.spawn_dispatcher(progress_tx.clone(), token.clone());
        self.tracker.start_ticker(token.clone());
        self.pool.start_adaptive();

        *runtime = Some(RuntimeState {
            token,
            progress_tx,
            started_at: Instant::now(),
        });
        info!(
            max_concurrent = self.queue.max_concurrent(),
            "Download manager started"
        );
    }

    /// Stop accepting activations, cancel in-flight downloads, and join the
    /// worker pool (bounded by a deadline).
    pub async fn stop(self: &Arc<Self>) {
        let state = self.runtime.lock().take();
        let Some(state) = state else { return };
        state.token.cancel();

        for task_id in self.queue.snapshot().active_ids {
            self.queue.cancel(&task_id);
        }
        self.pool.shutdown(true, Some(STOP_TIMEOUT)).await;
        info!("Download manager stopped");
    }

    pub fn is_running(&self) -> bool {
        self.runtime.lock().is_some()
    }

    /// Create a task for `url`, register it everywhere and enqueue it.
    /// Metadata extraction is attempted early but never blocks submission:
    /// a failed extraction leaves synthesized metadata on the task.
    pub async fn add_download(
        self: &Arc<Self>,
        url: &str,
        options: Option<DownloadOptions>,
        priority: Option<TaskPriority>,
    ) -> Result<String, DownloadError> {
        let trimmed = url.trim();
        if trimmed.is_empty() {
            return Err(DownloadError::invalid_input(url, "empty URL"));
        }
        let parsed = url::Url::parse(trimmed)
            .map_err(|e| DownloadError::invalid_input(trimmed, format!("malformed URL: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DownloadError::invalid_input(
                trimmed,
                format!("unsupported scheme `{}`", parsed.scheme()),
            ));
        }

        let options = options.unwrap_or_else(|| self.default_options());
        let mut task = Task::new(trimmed, options);

        task.metadata = Some(match self.extractor_for(trimmed) {
            Some(extractor) => match extractor.metadata(trimmed).await {
                Ok(metadata) => metadata,
                Err(e) => {
                    debug!(url = trimmed, error = %e, "Metadata extraction failed; synthesizing");
                    MediaMetadata::synthesized(trimmed)
                }
            },
            None => MediaMetadata::synthesized(trimmed),
        });

        let task_id = task.id.clone();
        let snapshot = task.clone();
        let task = shared(task);

        self.tasks.lock().insert(task_id.clone(), task.clone());
        self.tracker.add_task(&task_id, None);
        self.queue.add(task, priority.unwrap_or_default());
        self.observers.notify(&DownloadEvent::TaskAdded(snapshot));
        Ok(task_id)
    }

    pub fn cancel(&self, task_id: &str) -> bool {
        if !self.queue.cancel(task_id) {
            return false;
        }
        // A queued task is cancelled synchronously; an active one reaches
        // `cancelled` when its downloader observes the token.
        if let Some(task) = self.tasks.lock().get(task_id) {
            let snapshot = task.read().clone();
            if snapshot.status == TaskStatus::Cancelled {
                self.tracker.update_status(task_id, TaskStatus::Cancelled);
                self.observers
                    .notify(&DownloadEvent::TaskCancelled(snapshot));
            }
        }
        true
    }

    pub fn pause(&self, task_id: &str) -> bool {
        let paused = self.queue.pause(task_id);
        if paused {
            self.tracker.update_status(task_id, TaskStatus::Paused);
        }
        paused
    }

    pub fn resume(&self, task_id: &str) -> bool {
        let resumed = self.queue.resume(task_id);
        if resumed {
            self.tracker.update_status(task_id, TaskStatus::Downloading);
        }
        resumed
    }

    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        self.tasks.lock().get(task_id).map(|task| task.read().clone())
    }

    pub fn list_tasks(&self) -> Vec<Task> {
        self.tasks
            .lock()
            .values()
            .map(|task| task.read().clone())
            .collect()
    }

    pub fn progress(&self, task_id: &str) -> Option<TaskProgress> {
        self.tracker.task_progress(task_id)
    }

    pub fn aggregate_progress(&self) -> AggregateProgress {
        self.tracker.aggregate()
    }

    pub fn queue_snapshot(&self) -> QueueSnapshot {
        self.queue.snapshot()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Drop completed tasks from the logs, the registry and the tracker.
    pub fn clear_completed(&self) -> usize {
        let cleared = self.queue.clear_completed();
        self.prune_registry(TaskStatus::Completed);
        cleared
    }

    pub fn clear_failed(&self) -> usize {
        let cleared = self.queue.clear_failed();
        self.prune_registry(TaskStatus::Failed);
        cleared
    }

    /// Re-enqueue all failed tasks with a fresh retry budget.
    pub fn retry_failed(&self) -> usize {
        let retried = self.queue.retry_failed();
        if retried > 0 {
            let tasks = self.tasks.lock();
            for (task_id, task) in tasks.iter() {
                if task.read().status == TaskStatus::Pending {
                    self.tracker.update_status(task_id, TaskStatus::Pending);
                }
            }
        }
        retried
    }

    /// Propagate a new concurrency limit to the queue and the pool.
    pub fn set_max_concurrent_downloads(&self, max_concurrent: usize) {
        let max_concurrent = max_concurrent.max(1);
        self.queue.set_max_concurrent(max_concurrent);
        self.pool.set_desired_workers(max_concurrent.min(MAX_POOL_WORKERS));
    }

    pub fn add_observer<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&DownloadEvent) + Send + Sync + 'static,
    {
        self.observers.add(observer)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.observers.remove(id)
    }

    pub fn statistics(&self) -> ManagerStatistics {
        let mut stats = ManagerStatistics {
            total_tasks: 0,
            pending_tasks: 0,
            active_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,
            cancelled_tasks: 0,
            downloaded_bytes: 0,
            overall_speed: 0.0,
            uptime_secs: self
                .runtime
                .lock()
                .as_ref()
                .map(|state| state.started_at.elapsed().as_secs()),
        };
        for task in self.tasks.lock().values() {
            let task = task.read();
            stats.total_tasks += 1;
            match task.status {
                TaskStatus::Pending => stats.pending_tasks += 1,
                TaskStatus::Downloading | TaskStatus::Paused => stats.active_tasks += 1,
                TaskStatus::Completed => stats.completed_tasks += 1,
                TaskStatus::Failed => stats.failed_tasks += 1,
                TaskStatus::Cancelled => stats.cancelled_tasks += 1,
            }
            stats.downloaded_bytes += task.downloaded_bytes;
        }
        stats.overall_speed = self.tracker.aggregate().overall_speed;
        stats
    }

    fn default_options(&self) -> DownloadOptions {
        DownloadOptions {
            output_path: self.settings.download_path.clone(),
            quality_preference: self.settings.default_quality.clone(),
            format_preference: self.settings.default_format.clone(),
            enable_resume: self.settings.enable_resume,
            max_concurrent_segments: self.settings.max_concurrent_segments,
            ..Default::default()
        }
    }

    fn extractor_for(&self, url: &str) -> Option<Arc<dyn Extractor>> {
        self.extractors
            .iter()
            .find(|extractor| extractor.can_handle(url))
            .cloned()
    }

    fn prune_registry(&self, status: TaskStatus) {
        let mut tasks = self.tasks.lock();
        let removed: Vec<String> = tasks
            .iter()
            .filter(|(_, task)| task.read().status == status)
            .map(|(id, _)| id.clone())
            .collect();
        for task_id in removed {
            tasks.remove(&task_id);
            self.tracker.remove_task(&task_id);
        }
    }

    /// Apply downloader progress to the tracker and mirror it onto the task.
    fn spawn_progress_collector(
        self: &Arc<Self>,
        mut rx: mpsc::Receiver<ProgressUpdate>,
        token: CancellationToken,
    ) {
        let tracker = Arc::clone(&self.tracker);
        let tasks = Arc::clone(&self.tasks);
        tokio::spawn(async move {
            loop {
                let update = tokio::select! {
                    _ = token.cancelled() => break,
                    update = rx.recv() => match update {
                        Some(update) => update,
                        None => break,
                    },
                };
                tracker.update_progress(&update);
                let progress = tracker.task_progress(&update.task_id);
                let shared = tasks.lock().get(&update.task_id).cloned();
                if let (Some(progress), Some(task)) = (progress, shared) {
                    let mut task = task.write();
                    task.downloaded_bytes = progress.downloaded_bytes;
                    task.total_bytes = progress.total_bytes;
                    task.progress = progress.percentage;
                    task.speed = progress.current_speed;
                    task.eta_secs = progress.eta_secs;
                }
            }
        });
    }

    /// Pull activations from the queue and drive each to a terminal state.
    fn spawn_dispatcher(
        self: &Arc<Self>,
        progress_tx: mpsc::Sender<ProgressUpdate>,
        token: CancellationToken,
    ) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if token.is_cancelled() {
                    break;
                }
                match manager.queue.next() {
                    Some((task, control)) => {
                        let manager = Arc::clone(&manager);
                        let progress_tx = progress_tx.clone();
                        tokio::spawn(async move {
                            manager.drive(task, control, progress_tx).await;
                        });
                    }
                    None => {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(DISPATCH_POLL_INTERVAL) => {}
                        }
                    }
                }
            }
        });
    }

    /// Drive one activated task: backoff for re-runs, mark downloading,
    /// submit the downloader to the pool, then map the outcome onto the
    /// queue, the tracker and the observers.
    async fn drive(
        self: Arc<Self>,
        task: SharedTask,
        control: TaskControl,
        progress_tx: mpsc::Sender<ProgressUpdate>,
    ) {
        let (task_id, url, options, retry_count) = {
            let task = task.read();
            (
                task.id.clone(),
                task.url.clone(),
                task.options.clone(),
                task.retry_count,
            )
        };

        // Task-level exponential backoff before a re-run.
        if retry_count > 0 {
            let delay = options
                .retry_delay()
                .saturating_mul(1u32 << (retry_count - 1).min(16));
            debug!(task_id = %task_id, retry = retry_count, delay_ms = delay.as_millis() as u64, "Backing off before retry");
            tokio::select! {
                _ = control.cancel.cancelled() => {
                    self.finish_cancelled(&task, &task_id);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        {
            task.write().transition(TaskStatus::Downloading);
        }
        self.tracker.update_status(&task_id, TaskStatus::Downloading);
        self.observers
            .notify(&DownloadEvent::TaskStarted(task.read().clone()));

        let reporter = ProgressReporter::new(task_id.clone(), progress_tx);
        let work = run_download(
            url,
            options,
            control.clone(),
            reporter,
            Arc::clone(&self.extractors),
            task.clone(),
        );

        let result = match self.pool.submit(&task_id, work) {
            Ok(()) => self.pool.wait_for(&task_id).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.queue.complete(&task_id, true);
                self.tracker.update_status(&task_id, TaskStatus::Completed);
                self.observers
                    .notify(&DownloadEvent::TaskCompleted(task.read().clone()));
                info!(task_id = %task_id, "Download completed");
            }
            Err(DownloadError::Cancelled) => {
                self.finish_cancelled(&task, &task_id);
            }
            Err(e) => {
                {
                    let mut task = task.write();
                    task.error_message = Some(e.to_string());
                }
                let allow_retry = !e.is_permanent();
                match self
                    .queue
                    .complete_with_retry_hint(&task_id, false, allow_retry)
                {
                    Some(CompleteOutcome::Requeued) => {
                        self.tracker.update_status(&task_id, TaskStatus::Pending);
                        warn!(task_id = %task_id, error = %e, "Download failed; re-enqueued");
                    }
                    _ => {
                        self.tracker.update_status(&task_id, TaskStatus::Failed);
                        self.observers
                            .notify(&DownloadEvent::TaskFailed(task.read().clone()));
                        warn!(task_id = %task_id, error = %e, "Download failed permanently");
                    }
                }
            }
        }
    }

    fn finish_cancelled(&self, task: &SharedTask, task_id: &str) {
        self.queue.finish_cancelled(task_id);
        self.tracker.update_status(task_id, TaskStatus::Cancelled);
        self.observers
            .notify(&DownloadEvent::TaskCancelled(task.read().clone()));
        info!(task_id = %task_id, "Download cancelled");
    }
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("running", &self.is_running())
            .field("tasks", &self.tasks.lock().len())
            .finish()
    }
}

/// Select and run the downloader for one task.
async fn run_download(
    url: String,
    options: DownloadOptions,
    control: TaskControl,
    reporter: ProgressReporter,
    extractors: Arc<Vec<Arc<dyn Extractor>>>,
    task: SharedTask,
) -> Result<(), DownloadError> {
    match classify_by_url(&url) {
        Some(DownloaderKind::Hls) => run_hls(&url, options, &control, &reporter, &task).await,
        Some(DownloaderKind::Segmented) => {
            run_http(&url, options, &control, &reporter, &task).await
        }
        None => {
            if let Some(extractor) = extractors.iter().find(|e| e.can_handle(&url)) {
                match resolve_via_extractor(extractor.as_ref(), &url, &options, &task).await {
                    Ok(direct) => {
                        return match classify_by_url(&direct) {
                            Some(DownloaderKind::Hls) => {
                                run_hls(&direct, options, &control, &reporter, &task).await
                            }
                            _ => run_http(&direct, options, &control, &reporter, &task).await,
                        };
                    }
                    Err(e) => {
                        warn!(url = %url, error = %e, "Extraction failed; treating URL as direct");
                    }
                }
            }
            // No extractor resolved the URL: sniff the content type so HLS
            // playlists served without an .m3u8 path still route correctly.
            let http = HttpDownloader::new(options.clone())?;
            let is_hls = match http.probe(&url).await {
                Ok(preflight) => preflight
                    .content_type
                    .as_deref()
                    .is_some_and(is_hls_content_type),
                Err(_) => false,
            };
            if is_hls {
                run_hls(&url, options, &control, &reporter, &task).await
            } else {
                let outcome = http.run(&url, &control, &reporter).await?;
                apply_outcome(&task, outcome.file_size, outcome.total_size);
                Ok(())
            }
        }
    }
}

/// Extract, stash the richer metadata on the task, and pick the rendition
/// that best matches the task's hints (audio-only, then quality substring,
/// then the extractor's preferred order).
async fn resolve_via_extractor(
    extractor: &dyn Extractor,
    url: &str,
    options: &DownloadOptions,
    task: &SharedTask,
) -> Result<String, DownloadError> {
    let info = extractor.extract(url).await?;
    {
        let mut task = task.write();
        task.metadata = Some(info.metadata.clone());
    }

    let candidates: Vec<&crate::extractor::MediaFormat> = info
        .formats
        .iter()
        .filter(|format| !options.audio_only || format.audio_only)
        .collect();
    let pool = if candidates.is_empty() {
        info.formats.iter().collect()
    } else {
        candidates
    };

    let chosen = options
        .quality_preference
        .as_deref()
        .and_then(|wanted| {
            pool.iter()
                .find(|format| {
                    format
                        .quality
                        .as_deref()
                        .is_some_and(|quality| quality.contains(wanted))
                })
                .copied()
        })
        .or_else(|| pool.first().copied());

    chosen
        .map(|format| format.url.clone())
        .ok_or_else(|| DownloadError::extractor("extractor returned no downloadable URLs"))
}

async fn run_http(
    url: &str,
    options: DownloadOptions,
    control: &TaskControl,
    reporter: &ProgressReporter,
    task: &SharedTask,
) -> Result<(), DownloadError> {
    let downloader = HttpDownloader::new(options)?;
    let outcome = downloader.run(url, control, reporter).await?;
    apply_outcome(task, outcome.file_size, outcome.total_size);
    Ok(())
}

async fn run_hls(
    url: &str,
    options: DownloadOptions,
    control: &TaskControl,
    reporter: &ProgressReporter,
    task: &SharedTask,
) -> Result<(), DownloadError> {
    let downloader = HlsDownloader::new(options)?;
    let outcome = downloader.run(url, control, reporter).await?;
    // HLS sizes are only known after the fact; keep total unknown so the
    // aggregate's byte totals stay honest.
    apply_outcome(task, outcome.file_size, None);
    Ok(())
}

fn apply_outcome(task: &SharedTask, file_size: u64, total_size: Option<u64>) {
    let mut task = task.write();
    task.downloaded_bytes = file_size.max(task.downloaded_bytes);
    if total_size.is_some() {
        task.total_bytes = total_size;
    }
    task.progress = 100.0;
}
