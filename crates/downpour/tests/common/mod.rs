// Not every integration binary uses every helper.
#![allow(dead_code)]

pub mod test_server;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use downpour_engine::progress::{ProgressReporter, ProgressUpdate};

/// Route engine logs to the test harness; respects `RUST_LOG`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Deterministic non-repeating byte pattern for content verification.
pub fn patterned_body(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 7 + i / 251) % 251) as u8).collect()
}

/// Poll `predicate` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    predicate()
}

/// A progress reporter whose latest byte counter is observable from the
/// test. Must be called from within a tokio runtime.
pub fn recording_reporter(task_id: &str) -> (ProgressReporter, Arc<AtomicU64>) {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<ProgressUpdate>(256);
    let bytes = Arc::new(AtomicU64::new(0));
    let observed = Arc::clone(&bytes);
    tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            observed.store(update.downloaded_bytes, Ordering::Relaxed);
        }
    });
    (ProgressReporter::new(task_id, tx), bytes)
}
