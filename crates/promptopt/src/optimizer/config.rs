//! Optimization parameters and budget presets.

use crate::error::ConfigurationError;
use crate::{DEFAULT_PROMPTER_MODEL, DEFAULT_TASK_MODEL};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default completion budget for task and prompter calls.
pub const DEFAULT_MAX_TOKENS: u32 = 5000;

/// Fewest training examples an instruction search can work with.
pub const MIN_TRAIN_EXAMPLES: usize = 2;

/// Named (num_candidates, num_trials) pairs used when neither is given.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BudgetPreset {
    Light,
    #[default]
    Medium,
    Heavy,
}

impl BudgetPreset {
    pub fn num_candidates(&self) -> usize {
        match self {
            BudgetPreset::Light => 6,
            BudgetPreset::Medium => 12,
            BudgetPreset::Heavy => 18,
        }
    }

    pub fn num_trials(&self) -> usize {
        match self {
            BudgetPreset::Light => 10,
            BudgetPreset::Medium => 18,
            BudgetPreset::Heavy => 27,
        }
    }
}

impl fmt::Display for BudgetPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetPreset::Light => write!(f, "light"),
            BudgetPreset::Medium => write!(f, "medium"),
            BudgetPreset::Heavy => write!(f, "heavy"),
        }
    }
}

impl FromStr for BudgetPreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "light" => Ok(BudgetPreset::Light),
            "medium" => Ok(BudgetPreset::Medium),
            "heavy" => Ok(BudgetPreset::Heavy),
            other => Err(format!("unknown budget preset: {other}")),
        }
    }
}

/// The resolved search budget.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Budget {
    pub num_candidates: usize,
    pub num_trials: usize,
}

/// Everything that shapes one `optimize()` run.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OptimizeParams {
    /// Model whose outputs are scored.
    pub task_model: String,
    /// Model that writes candidate instructions.
    pub prompter_model: String,
    /// Instruction candidates (seed included). Give with `num_trials` or not at all.
    pub num_candidates: Option<usize>,
    /// Minibatch trials. Give with `num_candidates` or not at all.
    pub num_trials: Option<usize>,
    /// Preset used when neither budget field is set.
    pub preset: BudgetPreset,
    /// Concurrent model calls while evaluating.
    pub num_threads: usize,
    pub max_bootstrapped_demos: usize,
    pub max_labeled_demos: usize,
    pub minibatch_size: usize,
    /// Run full validation after every this many trials.
    pub full_eval_every: usize,
    /// Bootstrapped demos must score strictly above this.
    pub bootstrap_threshold: f64,
    /// Training examples tried while bootstrapping.
    pub max_bootstrap_sample: usize,
    /// Probability of picking a random tried candidate instead of the best.
    pub exploration: f64,
    pub seed: u64,
    pub max_tokens: u32,
    pub temperature: f32,
    pub prompter_temperature: f32,
}

impl Default for OptimizeParams {
    fn default() -> Self {
        Self {
            task_model: DEFAULT_TASK_MODEL.to_string(),
            prompter_model: DEFAULT_PROMPTER_MODEL.to_string(),
            num_candidates: None,
            num_trials: None,
            preset: BudgetPreset::Medium,
            num_threads: 2,
            max_bootstrapped_demos: 4,
            max_labeled_demos: 4,
            minibatch_size: 35,
            full_eval_every: 5,
            bootstrap_threshold: 0.5,
            max_bootstrap_sample: 50,
            exploration: 0.2,
            seed: 42,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: 0.0,
            prompter_temperature: 1.0,
        }
    }
}

impl OptimizeParams {
    pub fn new(task_model: impl Into<String>, prompter_model: impl Into<String>) -> Self {
        Self {
            task_model: task_model.into(),
            prompter_model: prompter_model.into(),
            ..Default::default()
        }
    }

    pub fn with_budget(mut self, num_candidates: usize, num_trials: usize) -> Self {
        self.num_candidates = Some(num_candidates);
        self.num_trials = Some(num_trials);
        self
    }

    pub fn with_preset(mut self, preset: BudgetPreset) -> Self {
        self.preset = preset;
        self
    }

    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    pub fn with_demos(mut self, max_bootstrapped: usize, max_labeled: usize) -> Self {
        self.max_bootstrapped_demos = max_bootstrapped;
        self.max_labeled_demos = max_labeled;
        self
    }

    pub fn with_minibatch_size(mut self, minibatch_size: usize) -> Self {
        self.minibatch_size = minibatch_size;
        self
    }

    pub fn with_full_eval_every(mut self, trials: usize) -> Self {
        self.full_eval_every = trials;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Resolve the both-or-neither budget fields.
    pub fn budget(&self) -> Result<Budget, ConfigurationError> {
        match (self.num_candidates, self.num_trials) {
            (Some(num_candidates), Some(num_trials)) => Ok(Budget {
                num_candidates,
                num_trials,
            }),
            (None, None) => Ok(Budget {
                num_candidates: self.preset.num_candidates(),
                num_trials: self.preset.num_trials(),
            }),
            (Some(_), None) => Err(ConfigurationError::PartialBudget {
                given: "num_candidates",
                missing: "num_trials",
            }),
            (None, Some(_)) => Err(ConfigurationError::PartialBudget {
                given: "num_trials",
                missing: "num_candidates",
            }),
        }
    }

    /// Check every numeric field and resolve the budget.
    pub fn validate(&self) -> Result<Budget, ConfigurationError> {
        let budget = self.budget()?;
        let positive = [
            ("num_candidates", budget.num_candidates),
            ("num_trials", budget.num_trials),
            ("num_threads", self.num_threads),
            ("minibatch_size", self.minibatch_size),
            ("full_eval_every", self.full_eval_every),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigurationError::InvalidParameter {
                    name,
                    reason: "must be at least 1".into(),
                });
            }
        }
        for (name, value) in [
            ("bootstrap_threshold", self.bootstrap_threshold),
            ("exploration", self.exploration),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigurationError::InvalidParameter {
                    name,
                    reason: format!("must be within [0, 1], got {value}"),
                });
            }
        }
        if self.task_model.is_empty() {
            return Err(ConfigurationError::InvalidParameter {
                name: "task_model",
                reason: "must not be empty".into(),
            });
        }
        Ok(budget)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neither_budget_field_uses_preset() {
        let budget = OptimizeParams::default().budget().unwrap();
        assert_eq!(
            budget,
            Budget {
                num_candidates: 12,
                num_trials: 18
            }
        );
        let budget = OptimizeParams::default()
            .with_preset(BudgetPreset::Heavy)
            .budget()
            .unwrap();
        assert_eq!(budget.num_trials, 27);
    }

    #[test]
    fn partial_budget_is_rejected() {
        let params = OptimizeParams {
            num_candidates: Some(3),
            ..Default::default()
        };
        assert_eq!(
            params.budget(),
            Err(ConfigurationError::PartialBudget {
                given: "num_candidates",
                missing: "num_trials"
            })
        );
        let params = OptimizeParams {
            num_trials: Some(3),
            ..Default::default()
        };
        assert!(matches!(
            params.budget(),
            Err(ConfigurationError::PartialBudget { given: "num_trials", .. })
        ));
    }

    #[test]
    fn validate_rejects_zero_and_out_of_range() {
        let params = OptimizeParams::default().with_num_threads(0);
        assert!(matches!(
            params.validate(),
            Err(ConfigurationError::InvalidParameter { name: "num_threads", .. })
        ));
        let params = OptimizeParams {
            bootstrap_threshold: 1.5,
            ..Default::default()
        };
        assert!(params.validate().is_err());
        assert!(OptimizeParams::default().with_budget(2, 3).validate().is_ok());
    }

    #[test]
    fn preset_parses_case_insensitively() {
        assert_eq!("Light".parse::<BudgetPreset>(), Ok(BudgetPreset::Light));
        assert!("extreme".parse::<BudgetPreset>().is_err());
    }
}
