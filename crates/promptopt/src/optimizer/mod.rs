//! Instruction and demo search, plus the meta-prompting pre-stage.

pub mod bootstrap;
pub mod candidate;
pub mod config;
pub mod meta_prompt;
pub mod pipeline;
pub mod proposer;
pub mod search;

pub use bootstrap::BootstrapSampler;
pub use candidate::{Candidate, FullEvaluation, OptimizationState};
pub use config::{Budget, BudgetPreset, DEFAULT_MAX_TOKENS, MIN_TRAIN_EXAMPLES, OptimizeParams};
pub use meta_prompt::MetaPrompter;
pub use pipeline::{OptimizerMode, PipelineReport, PromptOptimizer};
pub use proposer::{
    CandidateProposer, GroundedProposer, ProposalFuture, ProposalRequest, StaticProposer,
};
pub use search::{OptimizationLoop, OptimizationReport, optimize};
