//! Template variables and prompt rendering.
//!
//! Templates reference variables as `{name}` or `{{name}}` (any run of
//! braces, optional inner whitespace). Variable sets are always declared
//! by the caller; the pattern here is only used to find and substitute
//! occurrences of declared names.

use super::document::PromptDocument;
use super::few_shot::{FewShotFormat, render_examples_block};
use crate::{Message, MessageRole};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

/// Matches `{var}`, `{{var}}`, `{{ var }}` and similar.
static VARIABLE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{+\s*(\w+)\s*\}+").expect("Invalid variable regex"));

/// Header introducing declared variables the template never references.
pub const ADDITIONAL_INPUTS_HEADER: &str = "\n\nHere are the additional inputs:\n";

/// Names referenced anywhere in `template`.
pub fn referenced_variables(template: &str) -> BTreeSet<String> {
    VARIABLE_PATTERN
        .captures_iter(template)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// The `[[ ## name ## ]]` block used for inputs the template does not place.
pub fn additional_input_block(name: &str, value: &str) -> String {
    format!("[[ ## {name} ## ]]\n{value}\n")
}

/// Result of filling one template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilledTemplate {
    pub text: String,
    /// Declared variables that were not referenced and got appended.
    pub appended: Vec<String>,
}

/// Substitute declared `variables` in `template` with values from `inputs`.
///
/// Referenced variables are replaced in place; a variable with no value in
/// `inputs` becomes an empty string. Declared variables that the template
/// never references are appended after [`ADDITIONAL_INPUTS_HEADER`] so the
/// model still sees them.
pub fn fill_template(
    template: &str,
    variables: &BTreeSet<String>,
    inputs: &BTreeMap<String, String>,
) -> FilledTemplate {
    let referenced = referenced_variables(template);

    let mut text = VARIABLE_PATTERN
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            if variables.contains(name) {
                inputs.get(name).cloned().unwrap_or_default()
            } else {
                caps[0].to_string()
            }
        })
        .into_owned();

    let appended: Vec<String> = variables
        .iter()
        .filter(|v| !referenced.contains(*v))
        .cloned()
        .collect();
    if !appended.is_empty() {
        text.push_str(ADDITIONAL_INPUTS_HEADER);
        for name in &appended {
            let value = inputs.get(name).map(String::as_str).unwrap_or_default();
            text.push_str(&additional_input_block(name, value));
        }
    }

    FilledTemplate { text, appended }
}

/// A prompt ready for a chat endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPrompt {
    /// Empty when the document has no system prompt.
    pub system: String,
    /// Conversation turns, ending with the user turn.
    pub messages: Vec<Message>,
    /// Declared variables that had to be appended rather than substituted.
    pub appended: Vec<String>,
}

impl RenderedPrompt {
    /// Flatten into the message list sent over the wire.
    pub fn to_messages(&self) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        if !self.system.is_empty() {
            out.push(Message::system(self.system.clone()));
        }
        out.extend(self.messages.iter().cloned());
        out
    }
}

/// Render `document` against one example's inputs.
///
/// Few-shot examples follow the document's format: converse demos become
/// alternating user / assistant turns before the final user turn; append
/// formats inline an `**Examples**` block into the matching prompt.
pub fn render(document: &PromptDocument, inputs: &BTreeMap<String, String>) -> RenderedPrompt {
    let mut system = fill_template(
        document.fetch_system_template(),
        document.system_variables(),
        inputs,
    );
    let mut user = fill_template(
        document.fetch_user_template(),
        document.user_variables(),
        inputs,
    );

    let mut messages = Vec::new();
    if let Some(few_shot) = document.few_shot() {
        match few_shot.format {
            FewShotFormat::Converse => {
                for example in &few_shot.examples {
                    messages.push(Message::user(example.input.clone()));
                    messages.push(Message::assistant(example.output.clone()));
                }
            }
            FewShotFormat::AppendToUser => {
                user.text.push_str(&render_examples_block(&few_shot.examples));
            }
            FewShotFormat::AppendToSystem => {
                system.text.push_str(&render_examples_block(&few_shot.examples));
            }
        }
    }
    messages.push(Message::user(user.text));

    let mut appended = system.appended;
    appended.extend(user.appended);

    RenderedPrompt {
        system: system.text,
        messages,
        appended,
    }
}

/// Role sequence of a rendered prompt, for quick assertions and logging.
pub fn role_sequence(prompt: &RenderedPrompt) -> Vec<MessageRole> {
    prompt.to_messages().into_iter().map(|m| m.role).collect()
}
