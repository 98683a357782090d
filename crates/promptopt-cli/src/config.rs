//! Run configuration with command-line tuned defaults.
//!
//! [`RunConfig`] holds what one `promptopt optimize` invocation needs and
//! converts it into library types via [`build_params`](RunConfig::build_params),
//! [`build_inference_config`](RunConfig::build_inference_config) and
//! [`build_mode`](RunConfig::build_mode).

use promptopt::inference::{InferenceConfig, RetryPolicy};
use promptopt::optimizer::{BudgetPreset, OptimizeParams, OptimizerMode};
use promptopt::{DEFAULT_PROMPTER_MODEL, DEFAULT_TASK_MODEL};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings for one optimization run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    /// Named mode (`micro`, `lite`, `pro`, `premier`). When set, it
    /// decides models and budget and the fields below are ignored.
    pub mode: Option<String>,
    /// Default: `"amazon/nova-lite-v1"`.
    pub task_model: String,
    /// Default: `"amazon/nova-pro-v1"`.
    pub prompter_model: String,
    /// Defaults to the prompter model.
    pub meta_prompt_model: Option<String>,
    pub num_candidates: Option<usize>,
    pub num_trials: Option<usize>,
    /// Used when neither budget field is set. Default: light.
    pub preset: BudgetPreset,
    /// Default: `2`.
    pub num_threads: usize,
    pub max_bootstrapped_demos: usize,
    pub max_labeled_demos: usize,
    /// Default: `20`.
    pub minibatch_size: usize,
    pub full_eval_every: usize,
    pub seed: u64,
    /// Requests per second; `0` disables limiting. Default: `2`.
    pub rate_limit: i64,
    /// Default: `5`.
    pub max_attempts: u32,
    /// Default: `120`.
    pub call_timeout_secs: u64,
    /// Share of rows used for training. Default: `0.5`.
    pub train_fraction: f64,
    pub stratified: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        let params = OptimizeParams::default();
        Self {
            mode: None,
            task_model: DEFAULT_TASK_MODEL.to_string(),
            prompter_model: DEFAULT_PROMPTER_MODEL.to_string(),
            meta_prompt_model: None,
            num_candidates: None,
            num_trials: None,
            preset: BudgetPreset::Light,
            num_threads: params.num_threads,
            max_bootstrapped_demos: params.max_bootstrapped_demos,
            max_labeled_demos: params.max_labeled_demos,
            minibatch_size: 20,
            full_eval_every: params.full_eval_every,
            seed: params.seed,
            rate_limit: 2,
            max_attempts: 5,
            call_timeout_secs: 120,
            train_fraction: 0.5,
            stratified: false,
        }
    }
}

impl RunConfig {
    pub fn build_params(&self) -> OptimizeParams {
        OptimizeParams {
            num_candidates: self.num_candidates,
            num_trials: self.num_trials,
            preset: self.preset,
            ..OptimizeParams::new(self.task_model.as_str(), self.prompter_model.as_str())
        }
        .with_num_threads(self.num_threads)
        .with_demos(self.max_bootstrapped_demos, self.max_labeled_demos)
        .with_minibatch_size(self.minibatch_size)
        .with_full_eval_every(self.full_eval_every)
        .with_seed(self.seed)
    }

    pub fn build_inference_config(&self) -> InferenceConfig {
        InferenceConfig::default()
            .with_rate_limit(self.rate_limit)
            .with_retry(RetryPolicy::default().with_max_attempts(self.max_attempts))
            .with_call_timeout(Duration::from_secs(self.call_timeout_secs))
    }

    /// Resolve the pipeline mode. Unknown names are an error.
    pub fn build_mode(&self) -> Result<OptimizerMode, String> {
        match &self.mode {
            Some(name) => name.parse(),
            None => Ok(OptimizerMode::Custom {
                params: self.build_params(),
                meta_prompt_model: self.meta_prompt_model.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_cli_tuned() {
        let config = RunConfig::default();
        assert_eq!(config.minibatch_size, 20);
        assert_eq!(config.preset, BudgetPreset::Light);
        assert_eq!(config.rate_limit, 2);
        assert!((config.train_fraction - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn build_params_carries_fields() {
        let config = RunConfig {
            num_candidates: Some(3),
            num_trials: Some(7),
            num_threads: 5,
            seed: 9,
            ..Default::default()
        };
        let params = config.build_params();
        assert_eq!(params.budget().unwrap().num_trials, 7);
        assert_eq!(params.num_threads, 5);
        assert_eq!(params.seed, 9);
        assert_eq!(params.minibatch_size, 20);
        assert_eq!(params.task_model, DEFAULT_TASK_MODEL);
    }

    #[test]
    fn preset_applies_without_budget() {
        let budget = RunConfig::default().build_params().validate().unwrap();
        assert_eq!((budget.num_candidates, budget.num_trials), (6, 10));
    }

    #[test]
    fn inference_config_uses_rate_and_retries() {
        let config = RunConfig {
            rate_limit: 0,
            max_attempts: 2,
            call_timeout_secs: 7,
            ..Default::default()
        }
        .build_inference_config();
        assert_eq!(config.rate_limit, 0);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.call_timeout, Duration::from_secs(7));
    }

    #[test]
    fn named_mode_overrides_custom() {
        let config = RunConfig {
            mode: Some("lite".into()),
            ..Default::default()
        };
        assert_eq!(config.build_mode().unwrap(), OptimizerMode::Lite);
        let config = RunConfig {
            mode: Some("ultra".into()),
            ..Default::default()
        };
        assert!(config.build_mode().is_err());
        assert!(matches!(
            RunConfig::default().build_mode().unwrap(),
            OptimizerMode::Custom { .. }
        ));
    }
}
