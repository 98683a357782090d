//! The finalized prompt artifact and the builder that produces it.
//!
//! A [`PromptBuilder`] collects a system prompt, a user prompt and optional
//! few-shot demonstrations. [`PromptBuilder::adapt`] validates the pieces
//! and freezes them into a [`PromptDocument`], which has no mutating
//! methods. Stages that change a prompt build a new document.

use super::few_shot::{FewShot, FewShotExample, FewShotFormat, parse_examples};
use crate::error::FormatError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::info;

/// Where a prompt template comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptSource {
    Text(String),
    File(PathBuf),
}

impl From<&str> for PromptSource {
    fn from(s: &str) -> Self {
        PromptSource::Text(s.to_string())
    }
}

impl From<String> for PromptSource {
    fn from(s: String) -> Self {
        PromptSource::Text(s)
    }
}

impl From<&String> for PromptSource {
    fn from(s: &String) -> Self {
        PromptSource::Text(s.clone())
    }
}

impl From<PathBuf> for PromptSource {
    fn from(p: PathBuf) -> Self {
        PromptSource::File(p)
    }
}

impl From<&Path> for PromptSource {
    fn from(p: &Path) -> Self {
        PromptSource::File(p.to_path_buf())
    }
}

impl PromptSource {
    fn resolve(self) -> Result<String, FormatError> {
        match self {
            PromptSource::Text(text) => Ok(text),
            PromptSource::File(path) => Ok(std::fs::read_to_string(path)?),
        }
    }
}

/// A template and the variable names declared for it.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct PromptComponent {
    pub template: String,
    pub variables: BTreeSet<String>,
}

impl PromptComponent {
    pub fn new<I, S>(template: impl Into<String>, variables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            template: template.into(),
            variables: variables.into_iter().map(Into::into).collect(),
        }
    }
}

// ── Builder ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct PendingComponent {
    source: PromptSource,
    variables: BTreeSet<String>,
}

#[derive(Debug, Clone)]
enum PendingFewShot {
    Examples(Vec<FewShotExample>),
    File(PathBuf),
}

/// Collects prompt pieces until [`adapt`](Self::adapt) is called.
#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    system: Option<PendingComponent>,
    user: Option<PendingComponent>,
    few_shot: Option<(PendingFewShot, FewShotFormat)>,
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the system prompt from literal text or a file path.
    ///
    /// Variables are declared explicitly; they are never parsed out of the
    /// template.
    pub fn set_system_prompt<I, S>(mut self, source: impl Into<PromptSource>, variables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.system = Some(PendingComponent {
            source: source.into(),
            variables: variables.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Set the user prompt from literal text or a file path.
    pub fn set_user_prompt<I, S>(mut self, source: impl Into<PromptSource>, variables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.user = Some(PendingComponent {
            source: source.into(),
            variables: variables.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Attach demonstrations already in `{input, output}` form.
    pub fn add_few_shot(mut self, examples: Vec<FewShotExample>, format: FewShotFormat) -> Self {
        self.few_shot = Some((PendingFewShot::Examples(examples), format));
        self
    }

    /// Attach demonstrations from untyped JSON, validating their shape first.
    pub fn add_few_shot_json(
        self,
        value: &serde_json::Value,
        format: FewShotFormat,
    ) -> Result<Self, FormatError> {
        let examples = parse_examples(value)?;
        Ok(self.add_few_shot(examples, format))
    }

    /// Attach demonstrations from a JSON file. Read and validated in `adapt()`.
    pub fn load_few_shot(mut self, path: impl Into<PathBuf>, format: FewShotFormat) -> Self {
        self.few_shot = Some((PendingFewShot::File(path.into()), format));
        self
    }

    /// Validate and freeze into a [`PromptDocument`].
    ///
    /// Empty templates count as unset. A system prompt without a user
    /// prompt is rejected; a missing system prompt becomes an empty
    /// template.
    pub fn adapt(self) -> Result<PromptDocument, FormatError> {
        let system = resolve_component(self.system)?;
        let user = resolve_component(self.user)?;

        let (system, user) = match (system, user) {
            (system, Some(user)) => (system, user),
            (Some(_), None) => return Err(FormatError::SystemWithoutUser),
            (None, None) => return Err(FormatError::NoPrompt),
        };
        let system = system.unwrap_or_else(|| {
            info!("System prompt not set, initializing as empty string");
            PromptComponent::default()
        });

        let few_shot = match self.few_shot {
            None => None,
            Some((pending, format)) => {
                let examples = match pending {
                    PendingFewShot::Examples(examples) => examples,
                    PendingFewShot::File(path) => {
                        let text = std::fs::read_to_string(&path)?;
                        let value: serde_json::Value = serde_json::from_str(&text)?;
                        let examples = parse_examples(&value)?;
                        if examples.is_empty() {
                            return Err(FormatError::InvalidFewShot(format!(
                                "{} contains no examples",
                                path.display()
                            )));
                        }
                        examples
                    }
                };
                (!examples.is_empty()).then_some(FewShot { examples, format })
            }
        };

        Ok(PromptDocument {
            system,
            user,
            few_shot,
        })
    }
}

fn resolve_component(
    pending: Option<PendingComponent>,
) -> Result<Option<PromptComponent>, FormatError> {
    let Some(pending) = pending else {
        return Ok(None);
    };
    let template = pending.source.resolve()?;
    if template.is_empty() {
        return Ok(None);
    }
    Ok(Some(PromptComponent {
        template,
        variables: pending.variables,
    }))
}

// ── Document ───────────────────────────────────────────────────────

/// A finalized prompt: system + user templates and optional demonstrations.
///
/// Always has a user prompt. The system prompt is an empty template when
/// none was given.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(try_from = "DocumentRepr", into = "DocumentRepr")]
pub struct PromptDocument {
    system: PromptComponent,
    user: PromptComponent,
    few_shot: Option<FewShot>,
}

impl PromptDocument {
    /// Start a new builder.
    pub fn builder() -> PromptBuilder {
        PromptBuilder::new()
    }

    pub fn fetch_system_template(&self) -> &str {
        &self.system.template
    }

    pub fn fetch_user_template(&self) -> &str {
        &self.user.template
    }

    pub fn system_variables(&self) -> &BTreeSet<String> {
        &self.system.variables
    }

    pub fn user_variables(&self) -> &BTreeSet<String> {
        &self.user.variables
    }

    /// Every declared variable, from both prompts.
    pub fn all_variables(&self) -> BTreeSet<String> {
        self.system
            .variables
            .union(&self.user.variables)
            .cloned()
            .collect()
    }

    pub fn few_shot(&self) -> Option<&FewShot> {
        self.few_shot.as_ref()
    }

    pub fn few_shot_examples(&self) -> &[FewShotExample] {
        self.few_shot.as_ref().map_or(&[], |f| f.examples.as_slice())
    }

    pub fn few_shot_format(&self) -> Option<FewShotFormat> {
        self.few_shot.as_ref().map(|f| f.format)
    }
}

impl fmt::Display for PromptDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string_pretty(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

/// Wire form. Deserialization re-runs the builder checks.
#[derive(Serialize, Deserialize)]
struct DocumentRepr {
    #[serde(default)]
    system_prompt: PromptComponent,
    user_prompt: PromptComponent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    few_shot: Option<FewShot>,
}

impl TryFrom<DocumentRepr> for PromptDocument {
    type Error = FormatError;

    fn try_from(repr: DocumentRepr) -> Result<Self, Self::Error> {
        let mut builder = PromptBuilder::new()
            .set_system_prompt(repr.system_prompt.template, repr.system_prompt.variables)
            .set_user_prompt(repr.user_prompt.template, repr.user_prompt.variables);
        if let Some(few_shot) = repr.few_shot {
            builder = builder.add_few_shot(few_shot.examples, few_shot.format);
        }
        builder.adapt()
    }
}

impl From<PromptDocument> for DocumentRepr {
    fn from(doc: PromptDocument) -> Self {
        Self {
            system_prompt: doc.system,
            user_prompt: doc.user,
            few_shot: doc.few_shot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_only_gets_empty_system() {
        let doc = PromptBuilder::new()
            .set_user_prompt("Summarize {doc}", ["doc"])
            .adapt()
            .unwrap();
        assert_eq!(doc.fetch_system_template(), "");
        assert!(doc.system_variables().is_empty());
        assert_eq!(doc.fetch_user_template(), "Summarize {doc}");
        assert!(doc.few_shot().is_none());
    }

    #[test]
    fn system_and_user_are_both_kept() {
        let doc = PromptBuilder::new()
            .set_system_prompt("You grade {subject} essays.", ["subject"])
            .set_user_prompt("Essay: {essay}", ["essay"])
            .adapt()
            .unwrap();
        assert_eq!(doc.fetch_system_template(), "You grade {subject} essays.");
        assert!(doc.system_variables().contains("subject"));
        assert_eq!(doc.fetch_user_template(), "Essay: {essay}");
    }

    #[test]
    fn system_without_user_is_rejected() {
        let err = PromptBuilder::new()
            .set_system_prompt("You are helpful.", Vec::<String>::new())
            .adapt()
            .unwrap_err();
        assert!(matches!(err, FormatError::SystemWithoutUser));

        let err = PromptBuilder::new()
            .set_system_prompt("You are helpful.", Vec::<String>::new())
            .set_user_prompt("", Vec::<String>::new())
            .adapt()
            .unwrap_err();
        assert!(matches!(err, FormatError::SystemWithoutUser));
    }

    #[test]
    fn nothing_set_is_rejected() {
        assert!(matches!(
            PromptBuilder::new().adapt(),
            Err(FormatError::NoPrompt)
        ));
    }

    #[test]
    fn templates_can_come_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("user.txt");
        std::fs::write(&path, "Classify: {{text}}").unwrap();

        let doc = PromptBuilder::new()
            .set_user_prompt(path.as_path(), ["text"])
            .adapt()
            .unwrap();
        assert_eq!(doc.fetch_user_template(), "Classify: {{text}}");
        assert!(doc.user_variables().contains("text"));
    }

    #[test]
    fn missing_prompt_file_is_an_io_error() {
        let err = PromptBuilder::new()
            .set_user_prompt(PathBuf::from("/nonexistent/prompt.txt"), ["x"])
            .adapt()
            .unwrap_err();
        assert!(matches!(err, FormatError::Io(_)));
    }

    #[test]
    fn load_few_shot_validates_file() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.json");
        std::fs::write(&good, r#"[{"input": "a", "output": "b"}]"#).unwrap();
        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, r#"[{"question": "a"}]"#).unwrap();
        let empty = dir.path().join("empty.json");
        std::fs::write(&empty, "[]").unwrap();

        let doc = PromptBuilder::new()
            .set_user_prompt("{x}", ["x"])
            .load_few_shot(&good, FewShotFormat::AppendToUser)
            .adapt()
            .unwrap();
        assert_eq!(doc.few_shot_examples(), &[FewShotExample::new("a", "b")]);
        assert_eq!(doc.few_shot_format(), Some(FewShotFormat::AppendToUser));

        for path in [&bad, &empty] {
            let err = PromptBuilder::new()
                .set_user_prompt("{x}", ["x"])
                .load_few_shot(path, FewShotFormat::Converse)
                .adapt()
                .unwrap_err();
            assert!(matches!(err, FormatError::InvalidFewShot(_)), "{err}");
        }
    }

    #[test]
    fn add_few_shot_json_rejects_malformed_list() {
        let err = PromptBuilder::new()
            .add_few_shot_json(&serde_json::json!([{"input": "x"}]), FewShotFormat::Converse)
            .unwrap_err();
        assert!(matches!(err, FormatError::InvalidFewShot(_)));
    }

    #[test]
    fn all_variables_unions_both_prompts() {
        let doc = PromptBuilder::new()
            .set_system_prompt("Use {tone}", ["tone"])
            .set_user_prompt("{question}", ["question"])
            .adapt()
            .unwrap();
        let all: Vec<_> = doc.all_variables().into_iter().collect();
        assert_eq!(all, vec!["question", "tone"]);
    }

    #[test]
    fn serde_round_trip_rechecks_invariants() {
        let doc = PromptBuilder::new()
            .set_system_prompt("sys", Vec::<String>::new())
            .set_user_prompt("{q}", ["q"])
            .add_few_shot(vec![FewShotExample::new("i", "o")], FewShotFormat::Converse)
            .adapt()
            .unwrap();
        let json = serde_json::to_string(&doc).unwrap();
        let back: PromptDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(back, doc);

        let invalid = r#"{"system_prompt": {"template": "s", "variables": []},
                          "user_prompt": {"template": "", "variables": []}}"#;
        assert!(serde_json::from_str::<PromptDocument>(invalid).is_err());
    }
}
