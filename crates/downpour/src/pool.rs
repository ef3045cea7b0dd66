//! Bounded worker pool for download work units, keyed by task identifier.
//!
//! Concurrency is controlled by a semaphore; the effective worker count can
//! be lowered below the hard cap by parking permits aside, which lets the
//! adaptive controller scale without respawning anything.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::DownloadError;

/// Adaptive worker scaling configuration.
#[derive(Debug, Clone)]
pub struct AdaptivePoolConfig {
    pub enabled: bool,
    /// Controller period.
    pub interval: Duration,
    /// Minimum spacing between scale events to prevent oscillation.
    pub cooldown: Duration,
    /// Queue depth at or above which a worker is added.
    pub scale_up_queue_depth: usize,
    /// Active count at or below which a worker is removed.
    pub scale_down_active: usize,
}

impl Default for AdaptivePoolConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(10),
            cooldown: Duration::from_secs(30),
            scale_up_queue_depth: 5,
            scale_down_active: 2,
        }
    }
}

/// Configuration for a worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Hard cap on concurrent workers.
    pub max_workers: usize,
    /// Floor the adaptive controller will not scale below.
    pub min_workers: usize,
    pub adaptive: AdaptivePoolConfig,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            min_workers: 1,
            adaptive: AdaptivePoolConfig::default(),
        }
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub max_workers: usize,
    pub desired_workers: usize,
    pub active: usize,
    pub queued: usize,
    pub utilization: f64,
}

pub struct WorkerPool {
    config: WorkerPoolConfig,
    semaphore: Arc<Semaphore>,
    desired: Arc<AtomicUsize>,
    /// Permits parked aside to lower effective concurrency below the cap.
    reserved: Arc<Mutex<Vec<OwnedSemaphorePermit>>>,
    active: Arc<AtomicUsize>,
    queued: Arc<AtomicUsize>,
    handles: Mutex<HashMap<String, JoinHandle<Result<(), DownloadError>>>>,
    shutdown: CancellationToken,
    accepting: AtomicBool,
    last_scale: Mutex<Option<Instant>>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        let max_workers = config.max_workers.max(1);
        let pool = Self {
            semaphore: Arc::new(Semaphore::new(max_workers)),
            desired: Arc::new(AtomicUsize::new(max_workers)),
            reserved: Arc::new(Mutex::new(Vec::new())),
            active: Arc::new(AtomicUsize::new(0)),
            queued: Arc::new(AtomicUsize::new(0)),
            handles: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            accepting: AtomicBool::new(true),
            last_scale: Mutex::new(None),
            config: WorkerPoolConfig {
                max_workers,
                min_workers: config.min_workers.clamp(1, max_workers),
                adaptive: config.adaptive,
            },
        };
        if pool.config.adaptive.enabled {
            pool.set_desired_workers(pool.config.min_workers);
        }
        pool
    }

    /// Submit a work unit. The future starts once a worker slot frees up;
    /// its result is retrieved with [`WorkerPool::wait_for`].
    pub fn submit<F>(&self, task_id: impl Into<String>, work: F) -> Result<(), DownloadError>
    where
        F: Future<Output = Result<(), DownloadError>> + Send + 'static,
    {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(DownloadError::internal("worker pool is shut down"));
        }
        let task_id = task_id.into();
        let semaphore = Arc::clone(&self.semaphore);
        let active = Arc::clone(&self.active);
        let queued = Arc::clone(&self.queued);
        let shutdown = self.shutdown.clone();

        queued.fetch_add(1, Ordering::SeqCst);
        let handle = tokio::spawn(async move {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => {
                    queued.fetch_sub(1, Ordering::SeqCst);
                    return Err(DownloadError::Cancelled);
                }
                permit = semaphore.acquire_owned() => {
                    queued.fetch_sub(1, Ordering::SeqCst);
                    permit.map_err(|_| DownloadError::internal("worker semaphore closed"))?
                }
            };
            let _permit = permit;
            active.fetch_add(1, Ordering::SeqCst);
            let result = work.await;
            active.fetch_sub(1, Ordering::SeqCst);
            result
        });

        self.handles.lock().insert(task_id, handle);
        Ok(())
    }

    /// Await a submitted work unit. Panics inside the unit surface as
    /// `Internal`; the pool itself survives them.
    pub async fn wait_for(&self, task_id: &str) -> Result<(), DownloadError> {
        let handle = self
            .handles
            .lock()
            .remove(task_id)
            .ok_or_else(|| DownloadError::internal(format!("no work unit for task {task_id}")))?;
        match handle.await {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => {
                warn!(task_id, "Work unit panicked");
                Err(DownloadError::internal(format!(
                    "work unit for task {task_id} panicked"
                )))
            }
            Err(_) => Err(DownloadError::Cancelled),
        }
    }

    /// Abort a work unit outright. Cooperative cancellation via the task's
    /// token is preferred; this is the hard stop.
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.handles.lock().remove(task_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Await every outstanding work unit, returning per-task outcomes.
    pub async fn wait_for_all(&self) -> Vec<(String, Result<(), DownloadError>)> {
        let drained: Vec<(String, JoinHandle<Result<(), DownloadError>>)> =
            self.handles.lock().drain().collect();
        let mut results = Vec::with_capacity(drained.len());
        for (task_id, handle) in drained {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_err) if join_err.is_panic() => Err(DownloadError::internal(format!(
                    "work unit for task {task_id} panicked"
                ))),
                Err(_) => Err(DownloadError::Cancelled),
            };
            results.push((task_id, result));
        }
        results
    }

    /// Refuse further submissions, then either join in-flight work (with an
    /// optional deadline) or abandon it.
    pub async fn shutdown(&self, wait: bool, timeout: Option<Duration>) {
        self.accepting.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
        if !wait {
            for (_, handle) in self.handles.lock().drain() {
                handle.abort();
            }
            return;
        }
        match timeout {
            Some(deadline) => {
                if tokio::time::timeout(deadline, self.wait_for_all())
                    .await
                    .is_err()
                {
                    warn!("Worker pool shutdown deadline hit; abandoning in-flight work");
                    for (_, handle) in self.handles.lock().drain() {
                        handle.abort();
                    }
                }
            }
            None => {
                self.wait_for_all().await;
            }
        }
        info!("Worker pool shut down");
    }

    pub fn is_task_active(&self, task_id: &str) -> bool {
        self.handles.lock().contains_key(task_id)
    }

    pub fn active_task_ids(&self) -> Vec<String> {
        self.handles.lock().keys().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn queued_count(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn desired_workers(&self) -> usize {
        self.desired.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PoolStats {
        let desired = self.desired_workers();
        let active = self.active_count();
        PoolStats {
            max_workers: self.config.max_workers,
            desired_workers: desired,
            active,
            queued: self.queued_count(),
            utilization: if desired > 0 {
                (active as f64 / desired as f64) * 100.0
            } else {
                0.0
            },
        }
    }

    /// Set the effective worker count by parking (or releasing) permits.
    /// Clamped to `[min_workers, max_workers]`.
    pub fn set_desired_workers(&self, desired: usize) -> usize {
        let desired = desired.clamp(self.config.min_workers, self.config.max_workers);
        self.desired.store(desired, Ordering::SeqCst);

        let target_reserved = self.config.max_workers - desired;
        let mut reserved = self.reserved.lock();
        while reserved.len() > target_reserved {
            reserved.pop();
        }
        while reserved.len() < target_reserved {
            match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => reserved.push(permit),
                // Permits currently held by workers; the reduction takes
                // effect as they finish.
                Err(_) => break,
            }
        }
        desired
    }

    /// One adaptive decision: grow on backlog, shrink when mostly idle.
    /// Returns the new desired count when a scale event fired.
    fn scale_tick(&self) -> Option<usize> {
        let now = Instant::now();
        {
            let last = self.last_scale.lock();
            if let Some(last) = *last
                && now.duration_since(last) < self.config.adaptive.cooldown
            {
                return None;
            }
        }

        let desired = self.desired_workers();
        let queued = self.queued_count();
        let active = self.active_count();

        let next = if queued >= self.config.adaptive.scale_up_queue_depth
            && desired < self.config.max_workers
        {
            Some(desired + 1)
        } else if active <= self.config.adaptive.scale_down_active
            && desired > self.config.min_workers
        {
            Some(desired - 1)
        } else {
            None
        };

        let next = next?;
        let applied = self.set_desired_workers(next);
        *self.last_scale.lock() = Some(now);
        debug!(
            queued,
            active,
            desired = applied,
            max = self.config.max_workers,
            "Adaptive pool scaling event"
        );
        Some(applied)
    }

    /// Spawn the background adaptive controller. No-op when disabled.
    pub fn start_adaptive(self: &Arc<Self>) {
        if !self.config.adaptive.enabled {
            return;
        }
        let pool = Arc::clone(self);
        let interval = self.config.adaptive.interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pool.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        pool.scale_tick();
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("max_workers", &self.config.max_workers)
            .field("desired", &self.desired_workers())
            .field("active", &self.active_count())
            .field("queued", &self.queued_count())
            .finish()
    }
}
