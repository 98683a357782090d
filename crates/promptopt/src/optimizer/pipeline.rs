//! Meta-prompting followed by search, with named model presets.

use super::config::OptimizeParams;
use super::meta_prompt::MetaPrompter;
use super::proposer::CandidateProposer;
use super::search::{OptimizationLoop, OptimizationReport};
use crate::dataset::Dataset;
use crate::error::OptimizeError;
use crate::inference::InferenceAdapter;
use crate::metric::MetricAdapter;
use crate::prompt::PromptDocument;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

pub const NOVA_MICRO: &str = "amazon/nova-micro-v1";
pub const NOVA_LITE: &str = "amazon/nova-lite-v1";
pub const NOVA_PRO: &str = "amazon/nova-pro-v1";
pub const NOVA_PREMIER: &str = "amazon/nova-premier-v1";

/// Which task model to tune for, and with what budget.
///
/// The named modes all meta-prompt and propose with the premier model and
/// search 20 candidates over 30 trials with up to 4 + 4 demos.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerMode {
    Micro,
    Lite,
    #[default]
    Pro,
    Premier,
    Custom {
        params: OptimizeParams,
        /// Falls back to `params.prompter_model` when unset.
        meta_prompt_model: Option<String>,
    },
}

impl OptimizerMode {
    pub fn params(&self) -> OptimizeParams {
        let task_model = match self {
            OptimizerMode::Micro => NOVA_MICRO,
            OptimizerMode::Lite => NOVA_LITE,
            OptimizerMode::Pro => NOVA_PRO,
            OptimizerMode::Premier => NOVA_PREMIER,
            OptimizerMode::Custom { params, .. } => return params.clone(),
        };
        OptimizeParams::new(task_model, NOVA_PREMIER)
            .with_budget(20, 30)
            .with_demos(4, 4)
    }

    pub fn meta_prompt_model(&self) -> String {
        match self {
            OptimizerMode::Custom {
                params,
                meta_prompt_model,
            } => meta_prompt_model
                .clone()
                .unwrap_or_else(|| params.prompter_model.clone()),
            _ => NOVA_PREMIER.to_string(),
        }
    }
}

impl fmt::Display for OptimizerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerMode::Micro => write!(f, "micro"),
            OptimizerMode::Lite => write!(f, "lite"),
            OptimizerMode::Pro => write!(f, "pro"),
            OptimizerMode::Premier => write!(f, "premier"),
            OptimizerMode::Custom { .. } => write!(f, "custom"),
        }
    }
}

impl FromStr for OptimizerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "micro" => Ok(OptimizerMode::Micro),
            "lite" => Ok(OptimizerMode::Lite),
            "pro" => Ok(OptimizerMode::Pro),
            "premier" => Ok(OptimizerMode::Premier),
            other => Err(format!(
                "unknown mode '{other}' (expected micro, lite, pro or premier)"
            )),
        }
    }
}

/// What a pipeline run produced.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PipelineReport {
    pub mode: String,
    /// The meta-prompter's output.
    pub intermediate: PromptDocument,
    /// Absent when no dataset or metric was supplied.
    pub search: Option<OptimizationReport>,
}

impl PipelineReport {
    /// The prompt to use: the search winner, or the meta-prompted one.
    pub fn prompt(&self) -> &PromptDocument {
        self.search
            .as_ref()
            .map_or(&self.intermediate, |s| &s.prompt)
    }
}

/// Meta-prompts the initial prompt, then searches instructions and demos
/// from there.
#[derive(Clone, Default)]
pub struct PromptOptimizer {
    train: Option<Dataset>,
    test: Option<Dataset>,
    metric: Option<Arc<dyn MetricAdapter>>,
    proposer: Option<Arc<dyn CandidateProposer>>,
    meta_prompter: MetaPrompter,
}

impl PromptOptimizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_datasets(mut self, train: Dataset, test: Dataset) -> Self {
        self.train = Some(train);
        self.test = Some(test);
        self
    }

    pub fn with_metric(self, metric: impl MetricAdapter + 'static) -> Self {
        self.with_shared_metric(Arc::new(metric))
    }

    pub fn with_shared_metric(mut self, metric: Arc<dyn MetricAdapter>) -> Self {
        self.metric = Some(metric);
        self
    }

    pub fn with_proposer(mut self, proposer: impl CandidateProposer + 'static) -> Self {
        self.proposer = Some(Arc::new(proposer));
        self
    }

    pub fn with_meta_prompter(mut self, meta_prompter: MetaPrompter) -> Self {
        self.meta_prompter = meta_prompter;
        self
    }

    pub async fn optimize(
        &self,
        prompt: &PromptDocument,
        inference: &InferenceAdapter,
        mode: &OptimizerMode,
    ) -> Result<PromptDocument, OptimizeError> {
        Ok(self.run(prompt, inference, mode).await?.prompt().clone())
    }

    pub async fn run(
        &self,
        prompt: &PromptDocument,
        inference: &InferenceAdapter,
        mode: &OptimizerMode,
    ) -> Result<PipelineReport, OptimizeError> {
        let params = mode.params();
        params.validate()?;
        info!("[pipeline] mode {mode}, task model {}", params.task_model);

        let intermediate = self
            .meta_prompter
            .clone()
            .with_sampling(params.max_tokens, params.prompter_temperature)
            .optimize(prompt, inference, &mode.meta_prompt_model())
            .await?;

        let (Some(train), Some(test), Some(metric)) = (&self.train, &self.test, &self.metric)
        else {
            info!("[pipeline] no dataset or metric given; returning the meta-prompted prompt");
            return Ok(PipelineReport {
                mode: mode.to_string(),
                intermediate,
                search: None,
            });
        };

        let mut search = OptimizationLoop::new(params)
            .with_datasets(train.clone(), test.clone())
            .with_shared_metric(metric.clone());
        if let Some(proposer) = &self.proposer {
            search = search.with_shared_proposer(proposer.clone());
        }
        let report = search.run(&intermediate, inference).await?;
        Ok(PipelineReport {
            mode: mode.to_string(),
            intermediate,
            search: Some(report),
        })
    }
}
