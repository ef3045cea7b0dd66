//! Token-bucket rate limiting for download byte streams.
//!
//! The bucket refills continuously at the configured rate and burst capacity
//! defaults to twice the rate. Waits are sliced so a pending `acquire` stays
//! responsive to cancellation from the surrounding select.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

/// Upper bound on a single sleep slice inside `acquire`.
const MAX_SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Consecutive successes before the adaptive limiter raises the rate.
const SUCCESS_STREAK: u32 = 10;
/// Consecutive failures before the adaptive limiter lowers the rate.
const FAILURE_STREAK: u32 = 3;
/// Multiplicative step for adaptive rate changes.
const ADAPT_FACTOR: f64 = 1.1;

#[derive(Debug)]
struct Bucket {
    /// Fill rate in bytes per second.
    rate: f64,
    /// Maximum token balance (burst size).
    capacity: f64,
    tokens: f64,
    last_update: Instant,
}

impl Bucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_update = now;
    }
}

/// Point-in-time view of the limiter for introspection.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RateLimiterStats {
    pub rate: f64,
    pub capacity: f64,
    pub tokens: f64,
}

/// Fixed-rate token bucket. `acquire(n)` suspends until `n` tokens are
/// available, then subtracts them. Never fails, only blocks.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a limiter with the given rate in bytes per second and a burst
    /// capacity of twice the rate. Non-positive rates are clamped to 1 B/s.
    pub fn new(rate: f64) -> Self {
        Self::with_capacity(rate, rate.max(1.0) * 2.0)
    }

    pub fn with_capacity(rate: f64, capacity: f64) -> Self {
        let rate = if rate.is_finite() && rate > 0.0 { rate } else { 1.0 };
        let capacity = if capacity.is_finite() && capacity > 0.0 {
            capacity
        } else {
            rate * 2.0
        };
        Self {
            bucket: Mutex::new(Bucket {
                rate,
                capacity,
                // Start full so small downloads get their initial burst.
                tokens: capacity,
                last_update: Instant::now(),
            }),
        }
    }

    /// Take `n` tokens, waiting for the bucket to refill as needed.
    ///
    /// `n == 0` is a no-op. Requests larger than the capacity are charged the
    /// full capacity instead, so a single oversized chunk cannot stall
    /// forever. The lock is never held across an await; waiting acquirers
    /// serialize on the bucket only while computing their deficit.
    pub async fn acquire(&self, n: u64) {
        if n == 0 {
            return;
        }
        loop {
            let wait = {
                let mut bucket = self.bucket.lock();
                bucket.refill();
                let need = (n as f64).min(bucket.capacity);
                if bucket.tokens >= need {
                    bucket.tokens -= need;
                    return;
                }
                let deficit = need - bucket.tokens;
                Duration::from_secs_f64(deficit / bucket.rate).min(MAX_SLEEP_SLICE)
            };
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    /// Replace the rate. Capacity resets to twice the new rate; the change
    /// takes effect on the next refill.
    pub fn set_rate(&self, rate: f64) {
        let rate = if rate.is_finite() && rate > 0.0 { rate } else { 1.0 };
        let mut bucket = self.bucket.lock();
        bucket.refill();
        bucket.rate = rate;
        bucket.capacity = rate * 2.0;
        bucket.tokens = bucket.tokens.min(bucket.capacity);
    }

    pub fn rate(&self) -> f64 {
        self.bucket.lock().rate
    }

    pub fn current_tokens(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        bucket.refill();
        bucket.tokens
    }

    pub fn stats(&self) -> RateLimiterStats {
        let mut bucket = self.bucket.lock();
        bucket.refill();
        RateLimiterStats {
            rate: bucket.rate,
            capacity: bucket.capacity,
            tokens: bucket.tokens,
        }
    }
}

#[derive(Debug, Default)]
struct AdaptState {
    consecutive_successes: u32,
    consecutive_failures: u32,
    total_successes: u64,
    total_failures: u64,
}

/// Snapshot of the adaptive limiter's learning state.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AdaptationStats {
    pub rate: f64,
    pub min_rate: f64,
    pub max_rate: f64,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
}

/// Token bucket that adjusts its rate from caller-reported outcomes.
///
/// Ten consecutive successes raise the rate by 10% (capped at `max_rate`);
/// three consecutive failures lower it by 10% (floored at `min_rate`).
/// Either outcome resets the opposite streak.
#[derive(Debug)]
pub struct AdaptiveRateLimiter {
    limiter: RateLimiter,
    min_rate: f64,
    max_rate: f64,
    state: Mutex<AdaptState>,
}

impl AdaptiveRateLimiter {
    /// `min_rate`/`max_rate` default to a tenth and ten times the initial
    /// rate respectively.
    pub fn new(initial_rate: f64, min_rate: Option<f64>, max_rate: Option<f64>) -> Self {
        let initial_rate = if initial_rate.is_finite() && initial_rate > 0.0 {
            initial_rate
        } else {
            1.0
        };
        Self {
            limiter: RateLimiter::new(initial_rate),
            min_rate: min_rate.unwrap_or(initial_rate / 10.0).max(1.0),
            max_rate: max_rate.unwrap_or(initial_rate * 10.0),
            state: Mutex::new(AdaptState::default()),
        }
    }

    pub async fn acquire(&self, n: u64) {
        self.limiter.acquire(n).await;
    }

    pub fn rate(&self) -> f64 {
        self.limiter.rate()
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.total_successes += 1;
        state.consecutive_failures = 0;
        state.consecutive_successes += 1;
        if state.consecutive_successes >= SUCCESS_STREAK {
            state.consecutive_successes = 0;
            let new_rate = (self.limiter.rate() * ADAPT_FACTOR).min(self.max_rate);
            self.limiter.set_rate(new_rate);
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.total_failures += 1;
        state.consecutive_successes = 0;
        state.consecutive_failures += 1;
        if state.consecutive_failures >= FAILURE_STREAK {
            state.consecutive_failures = 0;
            let new_rate = (self.limiter.rate() / ADAPT_FACTOR).max(self.min_rate);
            self.limiter.set_rate(new_rate);
        }
    }

    pub fn reset_adaptation(&self) {
        *self.state.lock() = AdaptState::default();
    }

    pub fn adaptation_stats(&self) -> AdaptationStats {
        let state = self.state.lock();
        AdaptationStats {
            rate: self.limiter.rate(),
            min_rate: self.min_rate,
            max_rate: self.max_rate,
            consecutive_successes: state.consecutive_successes,
            consecutive_failures: state.consecutive_failures,
            total_successes: state.total_successes,
            total_failures: state.total_failures,
        }
    }
}

/// Rolling-window observer of actual transfer throughput.
#[derive(Debug)]
pub struct BandwidthMonitor {
    window: Duration,
    samples: Mutex<VecDeque<(Instant, u64)>>,
    peak: Mutex<f64>,
}

impl Default for BandwidthMonitor {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl BandwidthMonitor {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: Mutex::new(VecDeque::new()),
            peak: Mutex::new(0.0),
        }
    }

    pub fn record_transfer(&self, bytes: u64) {
        let now = Instant::now();
        let mut samples = self.samples.lock();
        samples.push_back((now, bytes));
        Self::prune(&mut samples, now, self.window);
        drop(samples);

        let current = self.current_bandwidth();
        let mut peak = self.peak.lock();
        if current > *peak {
            *peak = current;
        }
    }

    /// Bytes per second over the most recent second.
    pub fn current_bandwidth(&self) -> f64 {
        let now = Instant::now();
        let samples = self.samples.lock();
        let recent: u64 = samples
            .iter()
            .filter(|(t, _)| now.duration_since(*t) <= Duration::from_secs(1))
            .map(|(_, b)| *b)
            .sum();
        recent as f64
    }

    pub fn peak_bandwidth(&self) -> f64 {
        *self.peak.lock()
    }

    /// Bytes per second averaged over the full window span.
    pub fn average_bandwidth(&self) -> f64 {
        let now = Instant::now();
        let mut samples = self.samples.lock();
        Self::prune(&mut samples, now, self.window);
        let Some((oldest, _)) = samples.front() else {
            return 0.0;
        };
        let span = now.duration_since(*oldest).as_secs_f64();
        if span <= 0.0 {
            return 0.0;
        }
        let total: u64 = samples.iter().map(|(_, b)| *b).sum();
        total as f64 / span
    }

    fn prune(samples: &mut VecDeque<(Instant, u64)>, now: Instant, window: Duration) {
        while let Some((t, _)) = samples.front() {
            if now.duration_since(*t) > window {
                samples.pop_front();
            } else {
                break;
            }
        }
    }
}
