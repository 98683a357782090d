//! The inference adapter: render, rate-limit, call, retry.
//!
//! Every model call in a run goes through one [`InferenceAdapter`], which
//! owns the run's [`RateLimiter`]. Each network attempt (retries included)
//! waits for the limiter first, and is bounded by a per-call timeout.

use super::client::{ModelBackend, ModelRequest};
use super::retry::RetryPolicy;
use crate::Message;
use crate::dataset::{Dataset, Example};
use crate::error::InferenceError;
use crate::prompt::{PromptDocument, template};
use crate::rate_limiter::RateLimiter;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Default requests per second for one run.
pub const DEFAULT_RATE_LIMIT: i64 = 2;

/// Default per-call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Limits applied around every model call.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceConfig {
    /// Requests per second; `<= 0` disables limiting.
    pub rate_limit: i64,
    pub retry: RetryPolicy,
    /// Bound on a single network attempt.
    pub call_timeout: Duration,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            rate_limit: DEFAULT_RATE_LIMIT,
            retry: RetryPolicy::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

impl InferenceConfig {
    pub fn with_rate_limit(mut self, rate_limit: i64) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

/// Model id and sampling parameters for a batch of calls.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub model_id: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Generation {
    pub fn new(model_id: impl Into<String>, max_tokens: u32, temperature: f32) -> Self {
        Self {
            model_id: model_id.into(),
            max_tokens,
            temperature,
        }
    }
}

/// Rate-limited, retrying model access for one optimization run.
pub struct InferenceAdapter {
    backend: Arc<dyn ModelBackend>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    call_timeout: Duration,
    warned_appended: AtomicBool,
    attempts: AtomicU64,
}

impl std::fmt::Debug for InferenceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceAdapter")
            .field("limiter", &self.limiter)
            .field("retry", &self.retry)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl InferenceAdapter {
    pub fn new(backend: impl ModelBackend + 'static, config: InferenceConfig) -> Self {
        Self::from_shared(Arc::new(backend), config)
    }

    pub fn from_shared(backend: Arc<dyn ModelBackend>, config: InferenceConfig) -> Self {
        Self {
            backend,
            limiter: Arc::new(RateLimiter::new(config.rate_limit)),
            retry: config.retry,
            call_timeout: config.call_timeout,
            warned_appended: AtomicBool::new(false),
            attempts: AtomicU64::new(0),
        }
    }

    /// Replace the limiter (e.g. one with a manual clock in tests).
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Network attempts made so far, retries included.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Render `prompt` with `bound_variables` and return the model's text.
    pub async fn call(
        &self,
        prompt: &PromptDocument,
        bound_variables: &BTreeMap<String, String>,
        model_id: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, InferenceError> {
        let rendered = template::render(prompt, bound_variables);
        if !rendered.appended.is_empty() && !self.warned_appended.swap(true, Ordering::Relaxed) {
            warn!(
                "[inference] Variables not referenced in the prompt were appended as additional inputs: {}",
                rendered.appended.join(", ")
            );
        }
        self.call_messages(rendered.to_messages(), model_id, max_tokens, temperature)
            .await
    }

    /// [`call`](Self::call) with the parameters bundled.
    pub async fn generate(
        &self,
        prompt: &PromptDocument,
        bound_variables: &BTreeMap<String, String>,
        generation: &Generation,
    ) -> Result<String, InferenceError> {
        self.call(
            prompt,
            bound_variables,
            &generation.model_id,
            generation.max_tokens,
            generation.temperature,
        )
        .await
    }

    /// Send pre-built messages.
    pub async fn call_messages(
        &self,
        messages: Vec<Message>,
        model_id: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, InferenceError> {
        if messages.is_empty() {
            return Err(InferenceError::NoMessages);
        }
        let request = ModelRequest {
            model: model_id.to_string(),
            messages,
            max_tokens,
            temperature,
        };

        self.retry
            .run(model_id, || async {
                self.limiter.apply_rate_limiting().await;
                self.attempts.fetch_add(1, Ordering::Relaxed);
                match tokio::time::timeout(self.call_timeout, self.backend.complete(&request)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(format!(
                        "request timed out after {:.1}s",
                        self.call_timeout.as_secs_f64()
                    )),
                }
            })
            .await
    }
}

/// One dataset row and what the model said about it.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceRecord {
    pub example: Example,
    pub output: Result<String, InferenceError>,
}

/// Run `prompt` over every row of `dataset` with up to `max_workers`
/// calls in flight. Results keep dataset order.
pub async fn run_dataset(
    adapter: &InferenceAdapter,
    prompt: &PromptDocument,
    dataset: &Dataset,
    generation: &Generation,
    max_workers: usize,
) -> Vec<InferenceRecord> {
    debug!(
        "[inference] running {} row(s) on {} with {} worker(s)",
        dataset.len(),
        generation.model_id,
        max_workers
    );
    futures::stream::iter(dataset.fetch().cloned())
        .map(|example| async move {
            let output = adapter.generate(prompt, &example.inputs, generation).await;
            InferenceRecord { example, output }
        })
        .buffered(max_workers.max(1))
        .collect()
        .await
}
