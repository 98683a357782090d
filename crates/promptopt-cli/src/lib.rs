//! Command-line front end for the `promptopt` engine.
//!
//! The `promptopt` binary loads a prompt and a JSONL dataset, runs the
//! meta-prompt + search pipeline against OpenRouter and writes the winning
//! prompt and a run summary to a timestamped directory.
//!
//! ```sh
//! promptopt optimize --user prompts/user.txt --variables review \
//!   --dataset data/reviews.jsonl --input-columns review --output-column label
//!
//! promptopt evaluate --prompt-dir runs/20260101-120000/prompt \
//!   --dataset data/reviews.jsonl --input-columns review --output-column label
//! ```

pub mod config;
pub mod data;

pub use config::RunConfig;
