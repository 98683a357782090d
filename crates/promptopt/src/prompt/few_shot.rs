//! Few-shot demonstrations and their three render styles.
//!
//! Demonstrations are stored in one canonical shape, [`FewShotExample`]
//! (`{input, output}`). They can be ingested from that shape or from the
//! role-based converse shape (alternating user / assistant turns with
//! `content[0].text`), which is also the shape written to `few_shot.json`.

use crate::MessageRole;
use crate::error::FormatError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Header that introduces inlined examples in the append formats.
pub const EXAMPLES_HEADER: &str = "\n\n**Examples**\n";

/// One demonstration: what the user sends and what the model should answer.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq, Eq)]
pub struct FewShotExample {
    pub input: String,
    pub output: String,
}

impl FewShotExample {
    pub fn new(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
        }
    }
}

/// Where demonstrations go when the prompt is rendered.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FewShotFormat {
    /// Alternating user / assistant turns ahead of the real user turn.
    #[default]
    #[serde(rename = "converse")]
    Converse,
    /// An `**Examples**` block appended to the user prompt.
    #[serde(rename = "append_to_user", alias = "append_to_user_prompt")]
    AppendToUser,
    /// An `**Examples**` block appended to the system prompt.
    #[serde(rename = "append_to_system", alias = "append_to_system_prompt")]
    AppendToSystem,
}

impl FewShotFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            FewShotFormat::Converse => "converse",
            FewShotFormat::AppendToUser => "append_to_user",
            FewShotFormat::AppendToSystem => "append_to_system",
        }
    }

    /// Whether examples are inlined as text rather than sent as turns.
    pub fn is_inline(&self) -> bool {
        !matches!(self, FewShotFormat::Converse)
    }
}

impl fmt::Display for FewShotFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FewShotFormat {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "converse" => Ok(FewShotFormat::Converse),
            "append_to_user" | "append_to_user_prompt" | "user_prompt" => {
                Ok(FewShotFormat::AppendToUser)
            }
            "append_to_system" | "append_to_system_prompt" | "system_prompt" => {
                Ok(FewShotFormat::AppendToSystem)
            }
            other => Err(FormatError::UnknownFewShotFormat(other.to_string())),
        }
    }
}

/// Demonstrations plus their render style.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FewShot {
    pub examples: Vec<FewShotExample>,
    pub format: FewShotFormat,
}

// ── Converse shape ─────────────────────────────────────────────────

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq, Eq)]
pub struct TextBlock {
    pub text: String,
}

/// One role-tagged turn as stored in `few_shot.json`.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq, Eq)]
pub struct ConverseTurn {
    #[schemars(with = "String")]
    pub role: MessageRole,
    #[schemars(length(min = 1))]
    pub content: Vec<TextBlock>,
}

impl ConverseTurn {
    fn text(role: MessageRole, text: &str) -> Self {
        Self {
            role,
            content: vec![TextBlock {
                text: text.to_string(),
            }],
        }
    }
}

/// Every shape accepted on ingestion.
#[derive(Deserialize, JsonSchema)]
#[serde(untagged)]
#[allow(dead_code)]
enum FewShotDocument {
    InputOutput(Vec<FewShotExample>),
    Converse(Vec<ConverseTurn>),
}

/// Expand demonstrations into alternating user / assistant turns.
pub fn to_converse_turns(examples: &[FewShotExample]) -> Vec<ConverseTurn> {
    examples
        .iter()
        .flat_map(|ex| {
            [
                ConverseTurn::text(MessageRole::User, &ex.input),
                ConverseTurn::text(MessageRole::Assistant, &ex.output),
            ]
        })
        .collect()
}

/// Pair up user / assistant turns. Unpaired or out-of-order turns are skipped.
pub fn from_converse_turns(turns: &[ConverseTurn]) -> Vec<FewShotExample> {
    turns
        .chunks(2)
        .filter_map(|pair| match pair {
            [user, assistant]
                if user.role == MessageRole::User && assistant.role == MessageRole::Assistant =>
            {
                Some(FewShotExample {
                    input: user.content.first()?.text.clone(),
                    output: assistant.content.first()?.text.clone(),
                })
            }
            _ => None,
        })
        .collect()
}

/// Validate and convert a parsed JSON value into demonstrations.
///
/// Accepts either `[{input, output}, ...]` or the converse shape. The value
/// is checked against the generated JSON Schema first so that errors name
/// the offending element.
pub fn parse_examples(value: &serde_json::Value) -> Result<Vec<FewShotExample>, FormatError> {
    let schema = crate::json_schema_for::<FewShotDocument>();
    if let Ok(validator) = jsonschema::validator_for(&schema) {
        let errors: Vec<String> = validator
            .iter_errors(value)
            .map(|e| format!("{}: {e}", e.instance_path()))
            .collect();
        if !errors.is_empty() {
            return Err(FormatError::InvalidFewShot(format!(
                "expected [{{input, output}}] or converse turns: {}",
                errors.join("; ")
            )));
        }
    }

    let document: FewShotDocument = serde_json::from_value(value.clone())
        .map_err(|e| FormatError::InvalidFewShot(e.to_string()))?;
    Ok(match document {
        FewShotDocument::InputOutput(examples) => examples,
        FewShotDocument::Converse(turns) => from_converse_turns(&turns),
    })
}

/// Render demonstrations as the inline `**Examples**` block.
pub fn render_examples_block(examples: &[FewShotExample]) -> String {
    let mut text = String::from(EXAMPLES_HEADER);
    for (i, example) in examples.iter().enumerate() {
        text.push_str(&format!(
            "\nExample {}:\nInput: {}\nOutput: {}\n",
            i + 1,
            example.input,
            example.output
        ));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn format_parses_both_spellings() {
        assert_eq!(
            "append_to_user_prompt".parse::<FewShotFormat>().unwrap(),
            FewShotFormat::AppendToUser
        );
        assert_eq!(
            "append_to_system".parse::<FewShotFormat>().unwrap(),
            FewShotFormat::AppendToSystem
        );
        assert!("sideways".parse::<FewShotFormat>().is_err());
    }

    #[test]
    fn parse_input_output_shape() {
        let value = json!([{"input": "2+2", "output": "4"}, {"input": "3+3", "output": "6"}]);
        let examples = parse_examples(&value).unwrap();
        assert_eq!(examples.len(), 2);
        assert_eq!(examples[1], FewShotExample::new("3+3", "6"));
    }

    #[test]
    fn parse_converse_shape_pairs_turns() {
        let value = json!([
            {"role": "user", "content": [{"text": "hi"}]},
            {"role": "assistant", "content": [{"text": "hello"}]},
            {"role": "user", "content": [{"text": "dangling"}]}
        ]);
        let examples = parse_examples(&value).unwrap();
        assert_eq!(examples, vec![FewShotExample::new("hi", "hello")]);
    }

    #[test]
    fn malformed_examples_rejected() {
        let bad = [
            json!([{"input": "only input"}]),
            json!([{"input": 1, "output": "x"}]),
            json!({"input": "a", "output": "b"}),
            json!(["plain string"]),
        ];
        for value in bad {
            assert!(
                matches!(parse_examples(&value), Err(FormatError::InvalidFewShot(_))),
                "accepted {value}"
            );
        }
    }

    #[test]
    fn converse_turns_round_trip() {
        let examples = vec![FewShotExample::new("a", "b"), FewShotExample::new("c", "d")];
        let turns = to_converse_turns(&examples);
        assert_eq!(turns.len(), 4);
        assert_eq!(turns[0].role, MessageRole::User);
        assert_eq!(turns[1].role, MessageRole::Assistant);
        assert_eq!(from_converse_turns(&turns), examples);

        let json = serde_json::to_value(&turns).unwrap();
        assert_eq!(json[0], json!({"role": "user", "content": [{"text": "a"}]}));
    }

    #[test]
    fn examples_block_numbers_from_one() {
        let block = render_examples_block(&[FewShotExample::new("q", "a")]);
        assert!(block.starts_with(EXAMPLES_HEADER));
        assert!(block.contains("Example 1:\nInput: q\nOutput: a\n"));
    }
}
