//! Sliding-window rate limiting for outbound model calls.
//!
//! A [`RateLimiter`] admits at most `rate_limit` requests in any one-second
//! window, shared by every concurrent caller in a run. Callers over the limit
//! are queued: each computes a sleep proportional to its position in the
//! waiting queue, plus random jitter so that parked callers do not all wake
//! in the same instant.
//!
//! The read-modify-write of the window happens under a single mutex; the
//! sleep itself happens outside the lock so waiting callers never block
//! admitted ones.
//!
//! A `rate_limit` of zero or below disables limiting entirely: no sleep and
//! no timestamp bookkeeping.

use rand::Rng;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Length of the sliding window, in seconds.
pub const WINDOW_SECS: f64 = 1.0;

/// Default upper bound of the uniform wake-up jitter, in seconds.
pub const DEFAULT_JITTER_SECS: f64 = 1.0;

// ── Clock ──────────────────────────────────────────────────────────

/// Time source for the limiter, in fractional seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

/// Monotonic clock anchored at construction.
///
/// Backed by `tokio::time::Instant`, so paused test runtimes advance it.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: tokio::time::Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    pub fn at(now: f64) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: f64) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, secs: f64) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) += secs;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ── RateLimiter ────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct WindowState {
    /// Admission times inside the current window, oldest first.
    request_timestamps: VecDeque<f64>,
    /// Callers currently parked waiting for a slot.
    waiting_requests_count: usize,
}

/// Thread-safe sliding-window limiter. See the module docs.
pub struct RateLimiter {
    rate_limit: i64,
    jitter_secs: f64,
    clock: Arc<dyn Clock>,
    state: Mutex<WindowState>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("rate_limit", &self.rate_limit)
            .field("jitter_secs", &self.jitter_secs)
            .finish()
    }
}

impl RateLimiter {
    /// Create a limiter admitting `rate_limit` requests per second.
    pub fn new(rate_limit: i64) -> Self {
        Self::with_clock(rate_limit, Arc::new(MonotonicClock::new()))
    }

    /// Create a limiter reading time from `clock`.
    pub fn with_clock(rate_limit: i64, clock: Arc<dyn Clock>) -> Self {
        Self {
            rate_limit,
            jitter_secs: DEFAULT_JITTER_SECS,
            clock,
            state: Mutex::new(WindowState::default()),
        }
    }

    /// Set the upper bound of the wake-up jitter. `0.0` removes it.
    pub fn with_jitter(mut self, jitter_secs: f64) -> Self {
        self.jitter_secs = jitter_secs.max(0.0);
        self
    }

    pub fn rate_limit(&self) -> i64 {
        self.rate_limit
    }

    pub fn is_enabled(&self) -> bool {
        self.rate_limit > 0
    }

    /// Wait until one more request is allowed, then record it.
    ///
    /// Returns how long the caller slept (zero when admitted immediately).
    /// Never fails: over-subscription only lengthens the wait.
    pub async fn apply_rate_limiting(&self) -> Duration {
        if !self.is_enabled() {
            return Duration::ZERO;
        }

        let sleep_secs = {
            let mut state = self.lock_state();
            let now = self.clock.now();
            state.request_timestamps.retain(|ts| now - ts < WINDOW_SECS);

            if (state.request_timestamps.len() as i64) < self.rate_limit {
                state.request_timestamps.push_back(now);
                return Duration::ZERO;
            }

            state.waiting_requests_count += 1;
            let oldest = state
                .request_timestamps
                .iter()
                .copied()
                .fold(f64::INFINITY, f64::min);
            let queue_position = state.waiting_requests_count as f64 / self.rate_limit as f64;
            queue_position * WINDOW_SECS - (now - oldest) + self.jitter()
        };

        let delay = Duration::from_secs_f64(sleep_secs.max(0.0));
        if !delay.is_zero() {
            debug!(
                "[rate-limit] exceeded {} req/s, retrying in {:.3}s",
                self.rate_limit,
                delay.as_secs_f64()
            );
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock_state();
        state.waiting_requests_count = state.waiting_requests_count.saturating_sub(1);
        let now = self.clock.now();
        state.request_timestamps.push_back(now);
        delay
    }

    /// Timestamps currently recorded in the window, oldest first.
    pub fn recorded_timestamps(&self) -> Vec<f64> {
        self.lock_state().request_timestamps.iter().copied().collect()
    }

    /// Number of callers currently parked.
    pub fn waiting_requests(&self) -> usize {
        self.lock_state().waiting_requests_count
    }

    fn jitter(&self) -> f64 {
        if self.jitter_secs > 0.0 {
            rand::thread_rng().gen_range(0.0..self.jitter_secs)
        } else {
            0.0
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, WindowState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
