//! Meta-prompting: have a prompter model restructure a prompt into a
//! system/user pair before any search runs.

use crate::error::{InferenceError, OptimizeError};
use crate::inference::InferenceAdapter;
use crate::prompt::template::{ADDITIONAL_INPUTS_HEADER, referenced_variables};
use crate::prompt::{PromptBuilder, PromptDocument};
use crate::Message;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;
use tracing::{info, warn};

pub const DEFAULT_META_ATTEMPTS: usize = 5;

static SYSTEM_SECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<system_prompt>(.*?)</system_prompt>").expect("Invalid system section regex")
});
static USER_SECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<user_prompt>(.*?)</user_prompt>").expect("Invalid user section regex")
});

const META_PROMPT_TEMPLATE: &str = r#"Rewrite the Original Prompt below into a well-structured, specific system prompt and user prompt that a language model can follow to produce accurate, relevant responses.

### Output rules

- The output MUST have exactly two sections:
    - <system_prompt> ... </system_prompt>: instructions and context for the model, including a description of the input variables, but NO variable placeholders.
    - <user_prompt> ... </user_prompt>: the message the user sends to the model.
- Keep every section of the Original Prompt (task, context, instructions, other sections, response format). DO NOT drop details.
- State rules with strong wording such as MUST and DO NOT.
- REMOVE any examples from the Original Prompt.
- Every prompt variable [<VARIABLES>] MUST appear in <user_prompt></user_prompt>, written with double braces.
- DO NOT put these variables [<VARIABLES>] in <system_prompt></system_prompt>.
- Preserve the response format of the Original Prompt exactly.
- DO NOT output anything besides the two sections.

### Template for the system prompt

Task: {{Task summary}}

Context:
{{Context and content information}} ...

Instructions:
{{Other model instructions}} ...

Any other section from the Original Prompt:
{{Details of that section}}

Response Format:
{{Style and format requirements}} ...

### Required output structure

<system_prompt>
Task: ...

Context:
...

Instructions:
...

Response Format:
...
</system_prompt>

<user_prompt>
{{A clear, specific user prompt that follows the system instructions and contains every variable [<VARIABLES>]}}
</user_prompt>

Now write the best prompt for the Original Prompt the user provides."#;

/// Restructures a prompt with one prompter-model call per attempt.
#[derive(Debug, Clone)]
pub struct MetaPrompter {
    pub max_attempts: usize,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for MetaPrompter {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_META_ATTEMPTS,
            max_tokens: super::DEFAULT_MAX_TOKENS,
            temperature: 1.0,
        }
    }
}

impl MetaPrompter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_sampling(mut self, max_tokens: u32, temperature: f32) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    /// Ask `model_id` to restructure `prompt`.
    ///
    /// A response is accepted when its user section references every
    /// declared variable and its system section does not reference all of
    /// them. After `max_attempts` rejected responses the last one is used,
    /// with missing variables appended to the user prompt. Fails only if
    /// no response came back at all.
    pub async fn optimize(
        &self,
        prompt: &PromptDocument,
        inference: &InferenceAdapter,
        model_id: &str,
    ) -> Result<PromptDocument, OptimizeError> {
        info!("[meta-prompt] restructuring prompt with {model_id}");
        let variables = prompt.all_variables();
        let placeholders = variables
            .iter()
            .map(|v| format!("{{{{{v}}}}}"))
            .collect::<Vec<_>>()
            .join(", ");
        let instructions = META_PROMPT_TEMPLATE.replace("<VARIABLES>", &placeholders);
        let original = format!(
            "{}\n\n{}",
            prompt.fetch_system_template(),
            prompt.fetch_user_template()
        );

        let mut last_response: Option<String> = None;
        let mut last_error: Option<InferenceError> = None;
        for attempt in 1..=self.max_attempts {
            let messages = vec![
                Message::system(instructions.as_str()),
                Message::user(format!("Original Prompt:\n{original}")),
            ];
            let response = match inference
                .call_messages(messages, model_id, self.max_tokens, self.temperature)
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    warn!("[meta-prompt] attempt {attempt} failed: {e}");
                    last_error = Some(e);
                    continue;
                }
            };
            if let Some((system, user)) = split_sections(&response) {
                if is_valid_system(&system, &variables) && is_valid_user(&user, &variables) {
                    return rebuild(prompt, &system, &user, &variables);
                }
            }
            warn!("[meta-prompt] attempt {attempt}: response is missing variables or sections, retrying");
            last_response = Some(response);
        }

        let Some(response) = last_response else {
            return Err(last_error.unwrap_or(InferenceError::NoMessages).into());
        };
        warn!(
            "[meta-prompt] no valid response after {} attempt(s); appending missing variables to the last one",
            self.max_attempts
        );
        let (system, user) = split_sections(&response)
            .unwrap_or_else(|| (String::new(), response.trim().to_string()));
        let user = append_missing_variables(&user, &variables);
        rebuild(prompt, &system, &user, &variables)
    }
}

/// `(system, user)` section bodies, trimmed. Both tags must be present.
pub fn split_sections(response: &str) -> Option<(String, String)> {
    let system = SYSTEM_SECTION.captures(response)?.get(1)?.as_str().trim();
    let user = USER_SECTION.captures(response)?.get(1)?.as_str().trim();
    Some((system.to_string(), user.to_string()))
}

fn is_valid_user(user: &str, variables: &BTreeSet<String>) -> bool {
    variables.is_subset(&referenced_variables(user))
}

fn is_valid_system(system: &str, variables: &BTreeSet<String>) -> bool {
    variables.is_empty() || !variables.is_subset(&referenced_variables(system))
}

/// Append a `[[ ## var ## ]]` block for each variable `prompt` doesn't reference.
pub fn append_missing_variables(prompt: &str, variables: &BTreeSet<String>) -> String {
    let used = referenced_variables(prompt);
    let missing: Vec<&String> = variables.difference(&used).collect();
    if missing.is_empty() {
        return prompt.to_string();
    }
    let blocks: Vec<String> = missing
        .iter()
        .map(|v| format!("[[ ## {v} ## ]]\n{{{{{v}}}}}\n"))
        .collect();
    format!("{prompt}{ADDITIONAL_INPUTS_HEADER}{}", blocks.join("\n"))
}

fn rebuild(
    original: &PromptDocument,
    system: &str,
    user: &str,
    variables: &BTreeSet<String>,
) -> Result<PromptDocument, OptimizeError> {
    let referenced = referenced_variables(system);
    let system_variables: Vec<&String> = variables.intersection(&referenced).collect();
    let mut builder = PromptBuilder::new()
        .set_system_prompt(system, system_variables)
        .set_user_prompt(user, variables.iter());
    if let Some(few_shot) = original.few_shot() {
        builder = builder.add_few_shot(few_shot.examples.clone(), few_shot.format);
    }
    Ok(builder.adapt()?)
}
