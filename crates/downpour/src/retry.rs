//! Shared retry-with-backoff logic for streams, range segments and playlist
//! fetches. Exponential backoff with jitter, a max-delay cap, and
//! cancellation-aborted sleeps.

use rand::RngExt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::DownloadError;
use crate::options::DownloadOptions;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (not counting the initial attempt).
    pub max_retries: u32,
    /// Base delay between retries. Actual delay = base * 2^attempt + jitter.
    pub base_delay: Duration,
    /// Hard cap on the computed delay to prevent unbounded growth.
    pub max_delay: Duration,
    /// When true, adds random jitter of up to base_delay/2 so parallel
    /// segments of one download don't retry in lockstep.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Derive the per-attempt policy from a task's options.
    pub fn from_options(options: &DownloadOptions) -> Self {
        Self {
            max_retries: options.retry_attempts(),
            base_delay: options.retry_delay(),
            ..Default::default()
        }
    }

    /// Delay before the retry following attempt number `attempt` (0-indexed).
    ///
    /// All math is done in saturating milliseconds, so absurd attempt counts
    /// or a sub-millisecond base cannot overflow; jitter only spends the
    /// headroom left under `max_delay`.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let cap_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);

        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let mut delay_ms = base_ms.saturating_mul(factor).min(cap_ms);

        if self.jitter {
            let headroom = cap_ms - delay_ms;
            let spread = (base_ms / 2).min(headroom);
            if spread > 0 {
                delay_ms += rand::rng().random_range(0..=spread);
            }
        }

        Duration::from_millis(delay_ms)
    }
}

/// Result of a single attempt, used by the caller to signal retryability.
pub enum RetryAction<T> {
    /// Operation succeeded.
    Success(T),
    /// Operation failed with a retryable error (network, 5xx, timeout).
    Retry(DownloadError),
    /// Operation failed with a non-retryable error (4xx, parse error).
    Fail(DownloadError),
}

impl<T> From<Result<T, DownloadError>> for RetryAction<T> {
    fn from(result: Result<T, DownloadError>) -> Self {
        match result {
            Ok(value) => RetryAction::Success(value),
            Err(err) if err.is_retryable() => RetryAction::Retry(err),
            Err(err) => RetryAction::Fail(err),
        }
    }
}

/// Execute an async operation with retry-and-backoff.
///
/// The `operation` closure receives the current attempt number (0-indexed)
/// and returns a [`RetryAction`]. Sleeps between attempts are raced against
/// the cancellation token, so cancel aborts a pending retry immediately.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    operation: F,
) -> Result<T, DownloadError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    let mut attempt = 0u32;
    loop {
        if token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let err = match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) => err,
        };

        if attempt >= policy.max_retries {
            return Err(err);
        }
        let wait = policy.backoff_delay(attempt);
        warn!(
            error = %err,
            wait_ms = wait.as_millis() as u64,
            attempts_used = attempt + 1,
            attempts_total = policy.max_retries + 1,
            "Transient failure; backing off before the next attempt"
        );
        tokio::select! {
            _ = token.cancelled() => return Err(DownloadError::Cancelled),
            _ = tokio::time::sleep(wait) => {}
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    fn policy_ms(max_retries: u32, base_ms: u64, cap_ms: u64, jitter: bool) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(cap_ms),
            jitter,
        }
    }

    fn server_error() -> DownloadError {
        DownloadError::http_status(
            StatusCode::SERVICE_UNAVAILABLE,
            "http://example.com/file.bin",
            "GET",
        )
    }

    #[test]
    fn backoff_delay_grows_exponentially_to_the_cap() {
        let policy = policy_ms(5, 80, 300, false);
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(80));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(160));
        // 80 * 4 = 320 would overshoot; the cap wins.
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(300));
        // Absurd attempt numbers saturate instead of overflowing.
        assert_eq!(policy.backoff_delay(200), Duration::from_millis(300));
    }

    #[test]
    fn jitter_spends_at_most_half_a_base_and_never_busts_the_cap() {
        let policy = policy_ms(3, 100, 10_000, true);
        for _ in 0..64 {
            let delay = policy.backoff_delay(0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }

        // With the exponential part already at the cap there is no headroom
        // for jitter at all.
        let capped = policy_ms(3, 100, 100, true);
        for _ in 0..16 {
            assert_eq!(capped.backoff_delay(4), Duration::from_millis(100));
        }
    }

    #[test]
    fn policy_from_options_applies_clamps() {
        let options = DownloadOptions {
            retry_attempts: 99,
            retry_delay_secs: 2.0,
            ..Default::default()
        };
        let policy = RetryPolicy::from_options(&options);
        assert_eq!(policy.max_retries, 10);
        assert_eq!(policy.base_delay, Duration::from_secs(2));
        assert!(policy.jitter);
    }

    #[tokio::test]
    async fn classifier_retries_server_errors_until_the_budget_runs_out() {
        let options = DownloadOptions {
            retry_attempts: 2,
            retry_delay_secs: 0.001,
            ..Default::default()
        };
        let policy = RetryPolicy::from_options(&options);
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);

        let result: Result<(), _> = retry_with_backoff(&policy, &token, |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async { RetryAction::from(Err::<(), _>(server_error())) }
        })
        .await;

        assert!(matches!(result, Err(DownloadError::HttpStatus { .. })));
        // retry_attempts = 2 means one initial try plus two retries.
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn classifier_fails_fast_on_client_errors() {
        let policy = policy_ms(5, 1, 100, false);
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);

        let result: Result<(), _> = retry_with_backoff(&policy, &token, |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async {
                RetryAction::from(Err::<(), _>(DownloadError::http_status(
                    StatusCode::GONE,
                    "http://example.com/file.bin",
                    "GET",
                )))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn classifier_does_not_retry_filesystem_errors() {
        let policy = policy_ms(5, 1, 100, false);
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);

        let result: Result<(), _> = retry_with_backoff(&policy, &token, |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async {
                RetryAction::from(Err::<(), _>(DownloadError::from(std::io::Error::other(
                    "no space left on device",
                ))))
            }
        })
        .await;

        assert!(matches!(result, Err(DownloadError::Io { .. })));
        assert_eq!(attempts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn recovers_when_a_later_attempt_succeeds() {
        let policy = policy_ms(3, 1, 100, false);
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);

        let result = retry_with_backoff(&policy, &token, |attempt| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async move {
                if attempt < 2 {
                    RetryAction::from(Err::<u32, _>(server_error()))
                } else {
                    RetryAction::from(Ok(attempt))
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn cancellation_during_backoff_aborts_the_sleep() {
        // First attempt fails, then the loop parks in a long backoff sleep.
        // Cancelling mid-sleep must end the whole call promptly.
        let policy = policy_ms(3, 30_000, 30_000, false);
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let result: Result<(), _> = retry_with_backoff(&policy, &token, |_| async {
            RetryAction::from(Err::<(), _>(server_error()))
        })
        .await;

        assert!(matches!(result, Err(DownloadError::Cancelled)));
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "cancel did not interrupt the backoff sleep"
        );
    }
}
