//! Error taxonomy for the optimization engine.
//!
//! Errors split into two families:
//!
//! - **Fail fast:** [`ConfigurationError`] and [`FormatError`] signal caller
//!   mistakes and are raised before any model call is made.
//! - **Degrade gracefully:** [`InferenceError`] and [`ScoringAnomaly`] are
//!   expected during a run. The search loop converts them into a zero score
//!   for the affected trial and keeps going.
//!
//! [`OptimizeError`] is the umbrella type returned by the top-level entry
//! points.

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T, E = OptimizeError> = std::result::Result<T, E>;

/// Invalid or incomplete optimizer setup.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("{0} is required for optimization")]
    MissingAdapter(&'static str),

    #[error("num_candidates and num_trials must be given together (got {given} without {missing})")]
    PartialBudget {
        given: &'static str,
        missing: &'static str,
    },

    #[error("training split has {actual} example(s); at least {required} are needed")]
    TrainingSetTooSmall { actual: usize, required: usize },

    #[error("validation split is empty")]
    EmptyValidationSet,

    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}

/// Malformed prompt, few-shot list, or dataset shape.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("user prompt cannot be empty when a system prompt is set")]
    SystemWithoutUser,

    #[error("no prompts have been set; call set_user_prompt() first")]
    NoPrompt,

    #[error("invalid few-shot examples: {0}")]
    InvalidFewShot(String),

    #[error("unknown few-shot format: {0}")]
    UnknownFewShotFormat(String),

    #[error("dataset must declare exactly one output column (got {0})")]
    OutputColumns(usize),

    #[error("split fraction must be strictly between 0 and 1 (got {0})")]
    SplitFraction(f64),

    #[error("split of {total} example(s) at {fraction} leaves the training set empty")]
    EmptyTrainSplit { total: usize, fraction: f64 },

    #[error("invalid dataset record {index}: {reason}")]
    InvalidRecord { index: usize, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A model call that could not be completed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InferenceError {
    #[error("max retries ({attempts}) exceeded for model call: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("model call failed: {0}")]
    Permanent(String),

    #[error("prompt rendered no messages")]
    NoMessages,
}

/// A metric that misbehaved. Never fatal: the guard turns it into `0.0`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ScoringAnomaly {
    #[error("metric failed: {0}")]
    Failed(String),

    #[error("metric panicked: {0}")]
    Panicked(String),

    #[error("metric returned a non-finite score")]
    NonFinite,

    #[error("metric returned out-of-range score {0}")]
    OutOfRange(f64),
}

/// Errors from the proposal stage. Logged, then the search falls back to
/// the seed instruction.
#[derive(Debug, Error)]
pub enum ProposalError {
    #[error("proposer inference failed: {0}")]
    Inference(#[from] InferenceError),

    #[error("proposer produced no usable instruction")]
    Empty,
}

/// Persistence failures in the repository seam.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid id {0:?}: use letters, digits, '-', '_' or '.'")]
    InvalidId(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Format(#[from] FormatError),
}

/// Umbrella error returned by top-level operations.
#[derive(Debug, Error)]
pub enum OptimizeError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("format error: {0}")]
    Format(#[from] FormatError),

    #[error("inference error: {0}")]
    Inference(#[from] InferenceError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
