//! Scoring predictions against references.
//!
//! The optimizer only consumes a [`MetricAdapter`]; it never trusts one.
//! Every call goes through [`apply_guarded`], which turns failures, panics
//! and out-of-range values into a score in `[0, 1]` and logs the anomaly.
//!
//! Externally supplied scoring logic runs out of process through
//! [`CommandMetric`]: JSON on stdin, one number on stdout, an empty
//! environment and a wall-clock limit.

use crate::error::ScoringAnomaly;
use serde::Serialize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Upper end of the composite scale that gets rescaled to `[0, 1]`.
pub const COMPOSITE_SCALE_MAX: f64 = 4.0;

/// Scores one prediction against one reference.
///
/// Implementations should return a value in `[0, 1]`. Values on a `0..=4`
/// composite scale are accepted and rescaled by the guard.
pub trait MetricAdapter: Send + Sync {
    fn apply(&self, prediction: &str, reference: &str) -> Result<f64, ScoringAnomaly>;

    /// Aggregate score for a batch. Defaults to the mean of guarded
    /// per-item scores; an empty batch scores `0.0`.
    fn batch_apply(&self, predictions: &[String], references: &[String]) -> f64 {
        let n = predictions.len().min(references.len());
        if n == 0 {
            return 0.0;
        }
        let total: f64 = predictions
            .iter()
            .zip(references)
            .map(|(p, r)| normalize_score(catch_apply(self, p, r)))
            .sum();
        total / n as f64
    }
}

impl<M: MetricAdapter + ?Sized> MetricAdapter for Arc<M> {
    fn apply(&self, prediction: &str, reference: &str) -> Result<f64, ScoringAnomaly> {
        (**self).apply(prediction, reference)
    }

    fn batch_apply(&self, predictions: &[String], references: &[String]) -> f64 {
        (**self).batch_apply(predictions, references)
    }
}

// ── Guard ──────────────────────────────────────────────────────────

fn catch_apply<M: MetricAdapter + ?Sized>(
    metric: &M,
    prediction: &str,
    reference: &str,
) -> Result<f64, ScoringAnomaly> {
    match catch_unwind(AssertUnwindSafe(|| metric.apply(prediction, reference))) {
        Ok(result) => result,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(ScoringAnomaly::Panicked(msg))
        }
    }
}

/// Map a raw metric result onto `[0, 1]`.
///
/// - `[0, 1]` passes through.
/// - `(1, 4]` is treated as a composite score and divided by 4.
/// - Anything above 4 clamps to `1.0`, anything below 0 to `0.0`.
/// - Errors, panics and non-finite values become `0.0`.
pub fn normalize_score(raw: Result<f64, ScoringAnomaly>) -> f64 {
    let value = match raw {
        Ok(v) if !v.is_finite() => {
            warn!("[metric] {}; scoring 0.0", ScoringAnomaly::NonFinite);
            return 0.0;
        }
        Ok(v) => v,
        Err(anomaly) => {
            warn!("[metric] {anomaly}; scoring 0.0");
            return 0.0;
        }
    };

    if (0.0..=1.0).contains(&value) {
        value
    } else if value > 1.0 && value <= COMPOSITE_SCALE_MAX {
        debug!("[metric] rescaling composite score {value} to [0, 1]");
        value / COMPOSITE_SCALE_MAX
    } else {
        warn!("[metric] {}; clamping", ScoringAnomaly::OutOfRange(value));
        value.clamp(0.0, 1.0)
    }
}

/// Score one pair through the guard. Never panics, always in `[0, 1]`.
pub fn apply_guarded<M: MetricAdapter + ?Sized>(
    metric: &M,
    prediction: &str,
    reference: &str,
) -> f64 {
    normalize_score(catch_apply(metric, prediction, reference))
}

/// Guarded scoring off the async runtime, for metrics that block.
pub async fn score(metric: Arc<dyn MetricAdapter>, prediction: String, reference: String) -> f64 {
    match tokio::task::spawn_blocking(move || apply_guarded(&*metric, &prediction, &reference))
        .await
    {
        Ok(score) => score,
        Err(e) => {
            warn!("[metric] scoring task failed: {e}; scoring 0.0");
            0.0
        }
    }
}

// ── Built-in metrics ───────────────────────────────────────────────

fn normalize_text(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// `1.0` when prediction and reference match, ignoring case and
/// whitespace runs; otherwise `0.0`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactMatch;

impl MetricAdapter for ExactMatch {
    fn apply(&self, prediction: &str, reference: &str) -> Result<f64, ScoringAnomaly> {
        Ok(f64::from(u8::from(
            normalize_text(prediction) == normalize_text(reference),
        )))
    }
}

/// `1.0` when the normalized reference appears inside the prediction.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainsMatch;

impl MetricAdapter for ContainsMatch {
    fn apply(&self, prediction: &str, reference: &str) -> Result<f64, ScoringAnomaly> {
        let reference = normalize_text(reference);
        if reference.is_empty() {
            return Ok(0.0);
        }
        Ok(f64::from(u8::from(
            normalize_text(prediction).contains(&reference),
        )))
    }
}

/// Wrap a closure as a metric.
pub struct FnMetric<F>(pub F);

impl<F> MetricAdapter for FnMetric<F>
where
    F: Fn(&str, &str) -> f64 + Send + Sync,
{
    fn apply(&self, prediction: &str, reference: &str) -> Result<f64, ScoringAnomaly> {
        Ok((self.0)(prediction, reference))
    }
}

// ── Subprocess metric ──────────────────────────────────────────────

#[derive(Serialize)]
struct ScoreRequest<'a> {
    prediction: &'a str,
    reference: &'a str,
}

/// Runs an external scorer program once per pair.
///
/// The program receives `{"prediction": ..., "reference": ...}` as one JSON
/// line on stdin and must print a single number on stdout. It runs with an
/// empty environment, in `work_dir`, and is killed after `timeout`.
#[derive(Debug, Clone)]
pub struct CommandMetric {
    program: PathBuf,
    args: Vec<String>,
    work_dir: PathBuf,
    timeout: Duration,
}

impl CommandMetric {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            work_dir: std::env::temp_dir(),
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Check the scorer honours the contract before handing it to the
    /// optimizer: identical strings must produce a finite number.
    pub async fn validate(self) -> Result<Self, ScoringAnomaly> {
        let probe = self.evaluate("probe", "probe").await?;
        if !probe.is_finite() {
            return Err(ScoringAnomaly::NonFinite);
        }
        debug!(
            "[metric] validated scorer {} (probe score {probe})",
            self.program.display()
        );
        Ok(self)
    }

    /// Run the scorer once. Stdout is drained while the child runs; on
    /// timeout the child is dropped, which kills it.
    pub async fn evaluate(
        &self,
        prediction: &str,
        reference: &str,
    ) -> Result<f64, ScoringAnomaly> {
        let request = serde_json::to_string(&ScoreRequest {
            prediction,
            reference,
        })
        .map_err(|e| ScoringAnomaly::Failed(e.to_string()))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env_clear()
            .current_dir(&self.work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ScoringAnomaly::Failed(format!("failed to start {}: {e}", self.program.display()))
            })?;

        let exchange = async move {
            if let Some(mut stdin) = child.stdin.take() {
                // A scorer that exits without reading stdin is not an error here.
                let _ = stdin.write_all(request.as_bytes()).await;
                let _ = stdin.write_all(b"\n").await;
            }
            child.wait_with_output().await
        };
        let output = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(output) => output.map_err(|e| ScoringAnomaly::Failed(e.to_string()))?,
            Err(_) => {
                return Err(ScoringAnomaly::Failed(format!(
                    "scorer timed out after {:.1}s",
                    self.timeout.as_secs_f64()
                )));
            }
        };

        if !output.status.success() {
            let status = output.status;
            return Err(ScoringAnomaly::Failed(format!("scorer exited with {status}")));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout.trim().parse::<f64>().map_err(|_| {
            ScoringAnomaly::Failed(format!("scorer printed {:?}, expected a number", stdout.trim()))
        })
    }
}

impl MetricAdapter for CommandMetric {
    /// Blocks on [`evaluate`](CommandMetric::evaluate). Inside a runtime this
    /// must run on a blocking thread, as [`score`] does; outside one a
    /// private current-thread runtime is used.
    fn apply(&self, prediction: &str, reference: &str) -> Result<f64, ScoringAnomaly> {
        let work = self.evaluate(prediction, reference);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle.block_on(work),
            Err(_) => tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| ScoringAnomaly::Failed(format!("failed to start runtime: {e}")))?
                .block_on(work),
        }
    }
}
