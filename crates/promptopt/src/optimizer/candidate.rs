//! Candidates and the search state that tracks them.

use crate::dataset::Example;
use crate::error::FormatError;
use crate::prompt::template::{fill_template, referenced_variables};
use crate::prompt::{FewShotExample, FewShotFormat, PromptBuilder, PromptDocument};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// An (instruction, demo subset) pairing under evaluation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Candidate {
    /// Position in the pool; lower means discovered earlier.
    pub id: usize,
    pub instruction_index: usize,
    pub demo_set_index: usize,
    pub instruction: String,
    pub demos: Vec<Example>,
    /// Mean minibatch score over `trial_count` trials.
    pub running_score: f64,
    pub trial_count: usize,
}

impl Candidate {
    pub fn new(
        id: usize,
        instruction_index: usize,
        demo_set_index: usize,
        instruction: impl Into<String>,
        demos: Vec<Example>,
    ) -> Self {
        Self {
            id,
            instruction_index,
            demo_set_index,
            instruction: instruction.into(),
            demos,
            running_score: 0.0,
            trial_count: 0,
        }
    }

    /// Fold one minibatch score into the running mean.
    pub fn record_trial(&mut self, score: f64) {
        self.trial_count += 1;
        self.running_score += (score - self.running_score) / self.trial_count as f64;
    }

    pub fn is_tried(&self) -> bool {
        self.trial_count > 0
    }

    /// Build the prompt this candidate stands for.
    ///
    /// The instruction becomes the system prompt. The user template and its
    /// variables are carried over from `base`. Demos are rendered through the
    /// user template and attached in `base`'s few-shot format (converse if
    /// `base` has none).
    pub fn materialize(&self, base: &PromptDocument) -> Result<PromptDocument, FormatError> {
        let referenced = referenced_variables(&self.instruction);
        let system_variables: BTreeSet<String> = base
            .all_variables()
            .into_iter()
            .filter(|v| referenced.contains(v))
            .collect();

        let mut builder = PromptBuilder::new()
            .set_system_prompt(self.instruction.as_str(), system_variables)
            .set_user_prompt(
                base.fetch_user_template(),
                base.user_variables().iter().cloned(),
            );

        if !self.demos.is_empty() {
            let format = base.few_shot_format().unwrap_or(FewShotFormat::Converse);
            let examples = self
                .demos
                .iter()
                .map(|demo| {
                    let input = fill_template(
                        base.fetch_user_template(),
                        base.user_variables(),
                        &demo.inputs,
                    );
                    FewShotExample::new(input.text, demo.output())
                })
                .collect();
            builder = builder.add_few_shot(examples, format);
        }
        builder.adapt()
    }
}

/// One full-validation pass.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FullEvaluation {
    pub after_trial: usize,
    pub candidate_id: usize,
    pub score: f64,
}

/// Mutable search state. Owned by the search loop's coordinating task;
/// workers only report scores back to it.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct OptimizationState {
    pub best_candidate: Option<Candidate>,
    /// Full-validation score of `best_candidate`.
    pub best_score: f64,
    pub trials_run: usize,
    pub history: Vec<(Candidate, f64)>,
    pub full_evaluations: Vec<FullEvaluation>,
}

impl OptimizationState {
    /// Record a minibatch result against a snapshot of the candidate.
    pub fn record_trial(&mut self, candidate: &Candidate, score: f64) {
        self.trials_run += 1;
        self.history.push((candidate.clone(), score));
    }

    /// Offer a fully validated candidate. It replaces the current best only
    /// on a strictly higher score, so ties keep the earlier one.
    pub fn offer(&mut self, candidate: &Candidate, score: f64) -> bool {
        self.full_evaluations.push(FullEvaluation {
            after_trial: self.trials_run,
            candidate_id: candidate.id,
            score,
        });
        let improves = match self.best_candidate {
            None => true,
            Some(_) => score > self.best_score,
        };
        if improves {
            self.best_candidate = Some(candidate.clone());
            self.best_score = score;
        }
        improves
    }

    pub fn is_fully_evaluated(&self, candidate_id: usize) -> bool {
        self.full_evaluations
            .iter()
            .any(|e| e.candidate_id == candidate_id)
    }
}
