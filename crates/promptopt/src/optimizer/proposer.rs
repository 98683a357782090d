//! Instruction proposers.
//!
//! A [`CandidateProposer`] turns the seed instruction and some grounding
//! material (training rows, demo sets) into alternative instructions. The
//! search loop takes one by injection; it never builds its own.

use crate::dataset::{Dataset, Example};
use crate::error::ProposalError;
use crate::inference::InferenceAdapter;
use crate::Message;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, info, warn};

pub type ProposalFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<String>, ProposalError>> + Send + 'a>>;

/// What a proposer gets to work with.
#[derive(Debug, Clone, Copy)]
pub struct ProposalRequest<'a> {
    pub seed_instruction: &'a str,
    /// The user template the instruction will be paired with.
    pub user_template: &'a str,
    /// Alternatives wanted, not counting the seed.
    pub num_candidates: usize,
    pub train: &'a Dataset,
    pub demo_sets: &'a [Vec<Example>],
}

pub trait CandidateProposer: Send + Sync {
    /// Propose up to `request.num_candidates` new instructions.
    fn propose<'a>(
        &'a self,
        request: ProposalRequest<'a>,
        inference: &'a InferenceAdapter,
    ) -> ProposalFuture<'a>;
}

// ── Tips ───────────────────────────────────────────────────────────

/// Style nudges, one of which is drawn for each proposal call.
pub const PROPOSAL_TIPS: &[(&str, &str)] = &[
    ("none", ""),
    (
        "creative",
        "Encourage the model to think outside the box and explore novel or unconventional ideas.",
    ),
    (
        "simple",
        "Keep the instruction short, clear, and unambiguous. Avoid unnecessary complexity or jargon.",
    ),
    (
        "description",
        "Include detailed and informative context to guide the model toward a more accurate response.",
    ),
    (
        "high_stakes",
        "Frame the task with high-consequence scenarios where accuracy and precision are critical.",
    ),
    (
        "persona",
        "Assign a relevant persona (e.g., \"You are a legal advisor...\") to anchor the model's tone and expertise.",
    ),
    (
        "format_control",
        "Explicitly define the required output format (e.g., JSON, bullet points, Markdown) and enforce strict formatting rules.",
    ),
    (
        "structured_prompt",
        "Use structured prompt sections like ## Task, ## Context, and ## Instructions to improve comprehension.",
    ),
    (
        "examples",
        "Provide both positive and negative examples to illustrate what a good or bad response looks like.",
    ),
    (
        "rules_based",
        "State rules or compliance constraints (e.g., GDPR, company policy) that the model MUST follow.",
    ),
    (
        "multi_turn",
        "Guide the model to ask clarifying questions if the task is ambiguous or requires multiple steps.",
    ),
];

// ── Grounded proposer ──────────────────────────────────────────────

const PROPOSER_SYSTEM: &str = "You write instructions for a language model. \
Reply with a single new instruction wrapped in <instruction></instruction> tags and nothing else.";

const SUMMARY_SYSTEM: &str = "You describe datasets. Given sample rows, write a short paragraph \
about the task they represent, the shape of the inputs and the style of the expected outputs.";

/// Proposes instructions grounded in a dataset summary, a demo set and a
/// randomly drawn tip, using the prompter model.
#[derive(Debug, Clone)]
pub struct GroundedProposer {
    pub model_id: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub seed: u64,
    /// Training rows shown to the summarizer.
    pub summary_rows: usize,
    pub use_tips: bool,
}

impl GroundedProposer {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            max_tokens: super::DEFAULT_MAX_TOKENS,
            temperature: 1.0,
            seed: 42,
            summary_rows: 10,
            use_tips: true,
        }
    }

    pub fn with_sampling(mut self, max_tokens: u32, temperature: f32) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_tips(mut self, use_tips: bool) -> Self {
        self.use_tips = use_tips;
        self
    }

    async fn summarize(&self, train: &Dataset, inference: &InferenceAdapter) -> Option<String> {
        let rows: String = train
            .fetch()
            .take(self.summary_rows)
            .map(format_example)
            .collect::<Vec<_>>()
            .join("\n");
        if rows.is_empty() {
            return None;
        }
        let messages = vec![
            Message::system(SUMMARY_SYSTEM),
            Message::user(format!("Sample rows:\n{rows}")),
        ];
        match inference
            .call_messages(messages, &self.model_id, self.max_tokens, self.temperature)
            .await
        {
            Ok(summary) => {
                debug!("[proposer] dataset summary: {summary}");
                Some(summary.trim().to_string())
            }
            Err(e) => {
                warn!("[proposer] dataset summary failed, proposing without it: {e}");
                None
            }
        }
    }

    fn proposal_prompt(
        request: &ProposalRequest<'_>,
        summary: Option<&str>,
        demos: &[Example],
        tip: &str,
        previous: &[String],
    ) -> String {
        let mut prompt = String::new();
        if let Some(summary) = summary {
            prompt.push_str(&format!("## Dataset summary\n{summary}\n\n"));
        }
        prompt.push_str(&format!(
            "## Current instruction\n{}\n\n## User prompt template\n{}\n\n",
            request.seed_instruction, request.user_template
        ));
        if !demos.is_empty() {
            prompt.push_str("## Task demonstrations\n");
            for demo in demos {
                prompt.push_str(&format_example(demo));
                prompt.push('\n');
            }
            prompt.push('\n');
        }
        if !previous.is_empty() {
            prompt.push_str("## Instructions already proposed\n");
            for p in previous {
                prompt.push_str(&format!("- {p}\n"));
            }
            prompt.push('\n');
        }
        if !tip.is_empty() {
            prompt.push_str(&format!("## Tip\n{tip}\n\n"));
        }
        prompt.push_str(
            "Write a new instruction that will make the model perform this task better. \
Keep any {{variable}} placeholders from the current instruction.",
        );
        prompt
    }
}

impl CandidateProposer for GroundedProposer {
    fn propose<'a>(
        &'a self,
        request: ProposalRequest<'a>,
        inference: &'a InferenceAdapter,
    ) -> ProposalFuture<'a> {
        Box::pin(async move {
            if request.num_candidates == 0 {
                return Ok(Vec::new());
            }
            let summary = self.summarize(request.train, inference).await;
            let mut rng = StdRng::seed_from_u64(self.seed);
            let mut proposals: Vec<String> = Vec::new();
            let mut last_error = None;

            for i in 0..request.num_candidates {
                let (tip_name, tip) = if self.use_tips {
                    PROPOSAL_TIPS.choose(&mut rng).copied().unwrap_or(("none", ""))
                } else {
                    ("none", "")
                };
                let demos = if request.demo_sets.is_empty() {
                    &[][..]
                } else {
                    request.demo_sets[i % request.demo_sets.len()].as_slice()
                };
                debug!("[proposer] proposal {i}: tip={tip_name}, {} demo(s)", demos.len());

                let prompt =
                    Self::proposal_prompt(&request, summary.as_deref(), demos, tip, &proposals);
                let messages = vec![Message::system(PROPOSER_SYSTEM), Message::user(prompt)];
                match inference
                    .call_messages(messages, &self.model_id, self.max_tokens, self.temperature)
                    .await
                {
                    Ok(text) => match parse_instruction(&text) {
                        Some(instruction)
                            if instruction != request.seed_instruction
                                && !proposals.contains(&instruction) =>
                        {
                            proposals.push(instruction);
                        }
                        Some(_) => debug!("[proposer] dropping duplicate proposal {i}"),
                        None => warn!("[proposer] proposal {i} was empty"),
                    },
                    Err(e) => {
                        warn!("[proposer] proposal {i} failed: {e}");
                        last_error = Some(e);
                    }
                }
            }

            info!("[proposer] {} instruction(s) proposed", proposals.len());
            match (proposals.is_empty(), last_error) {
                (true, Some(e)) => Err(ProposalError::Inference(e)),
                (true, None) => Err(ProposalError::Empty),
                (false, _) => Ok(proposals),
            }
        })
    }
}

fn format_example(example: &Example) -> String {
    let inputs: Vec<String> = example
        .inputs
        .iter()
        .map(|(k, v)| format!("{k}: {v}"))
        .collect();
    format!("Input: {} | Output: {}", inputs.join("; "), example.output())
}

/// Pull the instruction out of a proposer reply: the `<instruction>` body
/// if tagged, the trimmed text otherwise.
pub fn parse_instruction(text: &str) -> Option<String> {
    let body = match (text.find("<instruction>"), text.rfind("</instruction>")) {
        (Some(start), Some(end)) if start + "<instruction>".len() <= end => {
            text.get(start + "<instruction>".len()..end).unwrap_or(text)
        }
        _ => text,
    };
    let body = body.trim();
    (!body.is_empty()).then(|| body.to_string())
}

// ── Static proposer ────────────────────────────────────────────────

/// Hands back a fixed list. No model calls.
#[derive(Debug, Clone, Default)]
pub struct StaticProposer {
    pub instructions: Vec<String>,
}

impl StaticProposer {
    pub fn new<I, S>(instructions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            instructions: instructions.into_iter().map(Into::into).collect(),
        }
    }
}

impl CandidateProposer for StaticProposer {
    fn propose<'a>(
        &'a self,
        request: ProposalRequest<'a>,
        _inference: &'a InferenceAdapter,
    ) -> ProposalFuture<'a> {
        let instructions = self
            .instructions
            .iter()
            .take(request.num_candidates)
            .cloned()
            .collect();
        Box::pin(async move { Ok(instructions) })
    }
}
