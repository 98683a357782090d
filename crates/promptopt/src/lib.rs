//! Prompt optimization against a labeled dataset and a scoring function.
//!
//! `promptopt` takes an instruction (system prompt), a user-prompt template
//! and optional few-shot demonstrations, and searches for a better
//! combination by calling a remote model under a caller-imposed rate limit.
//! The result is a new [`PromptDocument`](prompt::PromptDocument) that can be
//! saved to a small directory of text files.
//!
//! # Getting started
//!
//! ```ignore
//! use promptopt::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> promptopt::Result<()> {
//!     let api_key = std::env::var("OPENROUTER_KEY").unwrap();
//!     let client = OpenRouterClient::new(api_key).map_err(InferenceError::Permanent)?;
//!     let inference = InferenceAdapter::new(client, InferenceConfig::default());
//!
//!     let prompt = PromptBuilder::new()
//!         .set_system_prompt("Classify the sentiment.", Vec::<String>::new())
//!         .set_user_prompt("Review: {{review}}", ["review"])
//!         .adapt()?;
//!
//!     let rows = load_rows();
//!     let dataset = Dataset::from_rows(rows, &["review"], &["label"])?;
//!     let (train, test) = dataset.split(0.5)?;
//!
//!     let optimized = OptimizationLoop::new(OptimizeParams::default())
//!         .with_datasets(train, test)
//!         .with_metric(ExactMatch)
//!         .optimize(&prompt, &inference)
//!         .await?;
//!
//!     optimized.save("runs/sentiment")?;
//!     Ok(())
//! }
//! ```
//!
//! # Where to find things
//!
//! - **Rate limiting:** [`RateLimiter`](rate_limiter::RateLimiter), a
//!   sliding one-second window shared by every call in a run.
//! - **Prompts:** [`PromptBuilder`](prompt::PromptBuilder) →
//!   [`PromptDocument`](prompt::PromptDocument); rendering in
//!   [`prompt::template`], persistence in [`prompt::store`].
//! - **Data:** [`Dataset`](dataset::Dataset) and its deterministic splits.
//! - **Scoring:** the [`MetricAdapter`](metric::MetricAdapter) contract,
//!   its guard, built-in metrics and the out-of-process
//!   [`CommandMetric`](metric::CommandMetric).
//! - **Model calls:** [`InferenceAdapter`](inference::InferenceAdapter) with
//!   a pluggable [`ModelBackend`](inference::ModelBackend) and a single
//!   [`RetryPolicy`](inference::RetryPolicy).
//! - **Search:** [`OptimizationLoop`](optimizer::OptimizationLoop), with
//!   [`CandidateProposer`](optimizer::CandidateProposer) and
//!   [`BootstrapSampler`](optimizer::BootstrapSampler) as collaborators;
//!   [`PromptOptimizer`](optimizer::PromptOptimizer) adds the meta-prompting
//!   pre-stage.
//! - **Reporting:** [`Evaluator`](evaluation::Evaluator) and the
//!   [`RunRepository`](repository::RunRepository) seam.

pub mod dataset;
pub mod error;
pub mod evaluation;
pub mod inference;
pub mod logging;
pub mod metric;
pub mod optimizer;
pub mod prelude;
pub mod prompt;
pub mod rate_limiter;
pub mod repository;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use error::{OptimizeError, Result};

// ── Constants ──────────────────────────────────────────────────────

pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Default model for evaluating candidate prompts.
pub const DEFAULT_TASK_MODEL: &str = "amazon/nova-lite-v1";

/// Default model for writing instructions and restructuring prompts.
pub const DEFAULT_PROMPTER_MODEL: &str = "amazon/nova-pro-v1";

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` for `T`.
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// A message in the conversation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_constructors() {
        let sys = Message::system("hello");
        assert_eq!(sys.role, MessageRole::System);
        assert_eq!(sys.content, "hello");
        assert_eq!(Message::user("u").role, MessageRole::User);
        assert_eq!(Message::assistant("a").role, MessageRole::Assistant);
    }

    #[test]
    fn roles_serialize_lowercase() {
        let json = serde_json::to_value(Message::assistant("x")).unwrap();
        assert_eq!(json["role"], "assistant");
        assert_eq!(MessageRole::User.to_string(), "user");
    }

    #[test]
    fn schema_for_struct_lists_required_fields() {
        #[derive(Deserialize, JsonSchema)]
        #[allow(dead_code)]
        struct Pair {
            input: String,
            output: String,
        }
        let schema = json_schema_for::<Pair>();
        assert_eq!(schema["type"], "object");
        assert!(schema["required"].as_array().unwrap().contains(&"input".into()));
    }
}
