//! Convenience re-exports for common `promptopt` types.
//!
//! ```ignore
//! use promptopt::prelude::*;
//! ```
//!
//! Covers building prompts and datasets, picking a metric, wiring up
//! inference and running a search. Lower-level pieces (template rendering,
//! the proposer prompt, store file names) stay in their modules.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{Message, MessageRole, OptimizeError, json_schema_for};

// ── Errors ──────────────────────────────────────────────────────────
pub use crate::error::{
    ConfigurationError, FormatError, InferenceError, ProposalError, ScoringAnomaly, StoreError,
};

// ── Prompts and data ────────────────────────────────────────────────
pub use crate::dataset::{Dataset, Example};
pub use crate::prompt::{FewShotExample, FewShotFormat, PromptBuilder, PromptDocument};

// ── Scoring ─────────────────────────────────────────────────────────
pub use crate::evaluation::{EvaluationRecord, Evaluator};
pub use crate::metric::{CommandMetric, ContainsMatch, ExactMatch, FnMetric, MetricAdapter};

// ── Inference ───────────────────────────────────────────────────────
pub use crate::inference::{
    FnBackend, InferenceAdapter, InferenceConfig, ModelBackend, ModelRequest, OpenRouterClient,
    RetryPolicy,
};
pub use crate::rate_limiter::RateLimiter;

// ── Search ──────────────────────────────────────────────────────────
pub use crate::optimizer::{
    BudgetPreset, CandidateProposer, GroundedProposer, MetaPrompter, OptimizationLoop,
    OptimizationReport, OptimizeParams, OptimizerMode, PromptOptimizer, StaticProposer, optimize,
};

// ── Persistence ─────────────────────────────────────────────────────
pub use crate::repository::{DirectoryRepository, RunRepository};
