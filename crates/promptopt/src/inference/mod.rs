//! Model access: backends, retry policy, and the rate-limited adapter.

pub mod client;
pub mod retry;
pub mod runner;

pub use client::{BackendFuture, FnBackend, ModelBackend, ModelRequest, OpenRouterClient};
pub use retry::{RetryPolicy, is_permanent_error, is_transient_error};
pub use runner::{
    Generation, InferenceAdapter, InferenceConfig, InferenceRecord, run_dataset,
};
