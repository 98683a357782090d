//! Retry with exponential backoff for model calls.
//!
//! One [`RetryPolicy`] drives every retry in the crate. Transient failures
//! (throttling, 429/5xx, timeouts, dropped connections) are retried with
//! `initial_backoff * multiplier^n` plus up to one second of random jitter,
//! capped at `max_backoff`. Permanent failures (bad request, auth) fail on
//! the first attempt.

use crate::error::InferenceError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry behaviour for one logical model call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. `1` disables retrying.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound on any single delay (jitter included).
    pub max_backoff: Duration,
    /// Backoff multiplier per attempt.
    pub multiplier: f64,
    /// Add uniform `[0, 1)` seconds to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay after failed attempt `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let mut secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        if self.jitter {
            secs += rand::thread_rng().gen_range(0.0..1.0);
        }
        Duration::from_secs_f64(secs.min(self.max_backoff.as_secs_f64()).max(0.0))
    }

    /// Run `call` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `label` names the call in logs.
    pub async fn run<T, F, Fut>(&self, label: &str, mut call: F) -> Result<T, InferenceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, String>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    attempt += 1;
                    if !is_transient_error(&e) || is_permanent_error(&e) {
                        return Err(InferenceError::Permanent(e));
                    }
                    if attempt >= max_attempts {
                        return Err(InferenceError::RetriesExhausted {
                            attempts: attempt,
                            last_error: e,
                        });
                    }
                    let delay = self.delay_for_attempt(attempt - 1);
                    warn!(
                        "[inference] {label}: transient error (attempt {attempt}/{max_attempts}): {e}. Retrying in {:.2}s",
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Whether an error string indicates a retryable failure.
pub fn is_transient_error(error: &str) -> bool {
    let transient_statuses = ["429", "500", "502", "503", "504", "529"];
    if transient_statuses
        .iter()
        .any(|s| error.contains(&format!("HTTP {s}")))
    {
        return true;
    }

    let lower = error.to_lowercase();
    [
        "request failed:",
        "connection reset",
        "connection refused",
        "timed out",
        "timeout",
        "broken pipe",
        "network",
        "throttl",
        "too many requests",
        "rate limit",
        "modelerror",
        "model error",
        "serviceunavailable",
        "service unavailable",
        "overloaded",
    ]
    .iter()
    .any(|p| lower.contains(p))
}

/// Whether an error is a permanent (non-retryable) failure.
pub fn is_permanent_error(error: &str) -> bool {
    [
        "HTTP 400",
        "HTTP 401",
        "HTTP 403",
        "HTTP 404",
        "HTTP 422",
        "bad request",
        "unauthorized",
    ]
    .iter()
    .any(|p| error.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy::default()
            .with_initial_backoff(Duration::from_millis(10))
            .with_jitter(false)
    }

    #[test]
    fn default_matches_backoff_curve() {
        let policy = RetryPolicy::default().with_jitter(false);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[test]
    fn jitter_adds_at_most_a_second() {
        let policy = RetryPolicy::default();
        for _ in 0..20 {
            let d = policy.delay_for_attempt(0);
            assert!(d >= Duration::from_secs(1) && d < Duration::from_secs(2), "{d:?}");
        }
    }

    #[test]
    fn classifies_errors() {
        assert!(is_transient_error("OpenRouter API HTTP 429: rate limited"));
        assert!(is_transient_error("ThrottlingException: slow down"));
        assert!(is_transient_error("ModelErrorException"));
        assert!(is_transient_error("ServiceUnavailableException"));
        assert!(is_transient_error("request timed out after 120.0s"));
        assert!(!is_transient_error("OpenRouter API HTTP 400: bad request"));
        assert!(is_permanent_error("OpenRouter API HTTP 401: unauthorized"));
        assert!(!is_transient_error("some random error"));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = fast()
            .run("test", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err("HTTP 503: busy".to_string())
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_is_typed() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast()
            .with_max_attempts(3)
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("ThrottlingException".to_string())
            })
            .await;
        assert_eq!(
            result,
            Err(InferenceError::RetriesExhausted {
                attempts: 3,
                last_error: "ThrottlingException".into()
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast()
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("OpenRouter API HTTP 401: unauthorized".to_string())
            })
            .await;
        assert!(matches!(result, Err(InferenceError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
