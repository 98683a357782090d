//! Prompt artifacts: builder, finalized document, few-shot demos,
//! template rendering and on-disk persistence.

pub mod document;
pub mod few_shot;
pub mod store;
pub mod template;

pub use document::{PromptBuilder, PromptComponent, PromptDocument, PromptSource};
pub use few_shot::{ConverseTurn, FewShot, FewShotExample, FewShotFormat, parse_examples};
pub use template::{RenderedPrompt, fill_template, referenced_variables, render};
