//! On-disk layout of a [`PromptDocument`].
//!
//! ```text
//! <dir>/
//!   user_prompt.txt      user template (+ inlined examples for append_to_user)
//!   system_prompt.txt    system template (+ inlined examples for append_to_system),
//!                        omitted when both are empty
//!   few_shot.json        converse format only: alternating user/assistant turns
//!   prompt.json          variable declarations and few-shot bookkeeping
//! ```
//!
//! The prompt files are what downstream consumers read. `prompt.json`
//! carries what the text files cannot: declared variables, the few-shot
//! format, and the structured list for the append formats, so that
//! [`load`] reproduces the saved document exactly.

use super::document::{PromptBuilder, PromptDocument};
use super::few_shot::{
    ConverseTurn, FewShotExample, FewShotFormat, from_converse_turns, render_examples_block,
    to_converse_turns,
};
use crate::error::FormatError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tracing::debug;

pub const PROMPT_FILE_EXTENSION: &str = "txt";
pub const USER_PROMPT_FILE: &str = "user_prompt.txt";
pub const SYSTEM_PROMPT_FILE: &str = "system_prompt.txt";
pub const FEW_SHOT_FILE: &str = "few_shot.json";
pub const MANIFEST_FILE: &str = "prompt.json";

#[derive(Serialize, Deserialize, Debug, Default)]
struct Manifest {
    #[serde(default)]
    system_variables: BTreeSet<String>,
    #[serde(default)]
    user_variables: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    few_shot_format: Option<FewShotFormat>,
    /// Inlined demonstrations, kept structured for the append formats.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    inline_examples: Vec<FewShotExample>,
}

/// Write `document` into `dir`, creating it if needed.
pub fn save(document: &PromptDocument, dir: impl AsRef<Path>) -> Result<(), FormatError> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;

    let examples = document.few_shot_examples();
    let format = document.few_shot_format();

    let mut user = document.fetch_user_template().to_string();
    if format == Some(FewShotFormat::AppendToUser) {
        user.push_str(&render_examples_block(examples));
    }
    fs::write(dir.join(USER_PROMPT_FILE), user)?;

    let system_path = dir.join(SYSTEM_PROMPT_FILE);
    let mut system = document.fetch_system_template().to_string();
    if format == Some(FewShotFormat::AppendToSystem) {
        system.push_str(&render_examples_block(examples));
    }
    if system.is_empty() {
        if system_path.exists() {
            fs::remove_file(&system_path)?;
        }
    } else {
        fs::write(&system_path, system)?;
    }

    let few_shot_path = dir.join(FEW_SHOT_FILE);
    if format == Some(FewShotFormat::Converse) {
        let turns = to_converse_turns(examples);
        fs::write(&few_shot_path, serde_json::to_string_pretty(&turns)?)?;
    } else if few_shot_path.exists() {
        fs::remove_file(&few_shot_path)?;
    }

    let manifest = Manifest {
        system_variables: document.system_variables().clone(),
        user_variables: document.user_variables().clone(),
        few_shot_format: format,
        inline_examples: match format {
            Some(f) if f.is_inline() => examples.to_vec(),
            _ => Vec::new(),
        },
    };
    fs::write(
        dir.join(MANIFEST_FILE),
        serde_json::to_string_pretty(&manifest)?,
    )?;

    debug!(
        "Saved prompt to {} ({} demo(s), format {})",
        dir.display(),
        examples.len(),
        format.map_or("none", |f| f.as_str())
    );
    Ok(())
}

/// Read a document saved by [`save`].
///
/// A directory without `prompt.json` (written by hand, say) loads with
/// no declared variables and converse demos from `few_shot.json` if present.
pub fn load(dir: impl AsRef<Path>) -> Result<PromptDocument, FormatError> {
    let dir = dir.as_ref();

    let manifest_path = dir.join(MANIFEST_FILE);
    let manifest: Manifest = if manifest_path.exists() {
        serde_json::from_str(&fs::read_to_string(&manifest_path)?)?
    } else {
        Manifest::default()
    };

    let mut user = fs::read_to_string(dir.join(USER_PROMPT_FILE))?;
    let system_path = dir.join(SYSTEM_PROMPT_FILE);
    let mut system = if system_path.exists() {
        fs::read_to_string(&system_path)?
    } else {
        String::new()
    };

    let few_shot_path = dir.join(FEW_SHOT_FILE);
    let (examples, format) = match manifest.few_shot_format {
        Some(FewShotFormat::AppendToUser) => {
            strip_examples(&mut user, &manifest.inline_examples);
            (manifest.inline_examples, FewShotFormat::AppendToUser)
        }
        Some(FewShotFormat::AppendToSystem) => {
            strip_examples(&mut system, &manifest.inline_examples);
            (manifest.inline_examples, FewShotFormat::AppendToSystem)
        }
        Some(FewShotFormat::Converse) | None if few_shot_path.exists() => {
            let turns: Vec<ConverseTurn> =
                serde_json::from_str(&fs::read_to_string(&few_shot_path)?)
                    .map_err(|e| FormatError::InvalidFewShot(e.to_string()))?;
            (from_converse_turns(&turns), FewShotFormat::Converse)
        }
        _ => (Vec::new(), FewShotFormat::Converse),
    };

    let mut builder = PromptBuilder::new()
        .set_system_prompt(system, manifest.system_variables)
        .set_user_prompt(user, manifest.user_variables);
    if !examples.is_empty() {
        builder = builder.add_few_shot(examples, format);
    }
    builder.adapt()
}

fn strip_examples(text: &mut String, examples: &[FewShotExample]) {
    if examples.is_empty() {
        return;
    }
    let block = render_examples_block(examples);
    if text.ends_with(&block) {
        text.truncate(text.len() - block.len());
    }
}

impl PromptDocument {
    /// Persist to `dir`. See [`save`].
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<(), FormatError> {
        save(self, dir)
    }

    /// Load from `dir`. See [`load`].
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, FormatError> {
        load(dir)
    }
}
