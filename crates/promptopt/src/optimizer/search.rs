//! The instruction/demo search.
//!
//! One [`OptimizationLoop::run`] goes through these stages in order:
//!
//! 1. **Preconditions.** Datasets, metric and budget are checked before any
//!    model call is made.
//! 2. **Bootstrap.** The seed predictor runs over the training split and the
//!    [`BootstrapSampler`] builds demo sets from what scored well.
//! 3. **Propose.** The injected [`CandidateProposer`] writes alternative
//!    instructions. The seed instruction is always candidate zero.
//! 4. **Trials.** Each trial scores one (instruction, demo set) pairing on a
//!    minibatch of the validation split. Untried pairings go first, then
//!    epsilon-greedy on the running mean.
//! 5. **Full validation.** Every `full_eval_every` trials, and once at the
//!    end, the best-by-running-mean candidate is scored on the whole
//!    validation split. Only these scores decide the winner.
//! 6. **Emit.** The winner is materialized into a new [`PromptDocument`].
//!
//! Trials run one after another on the calling task, which owns the
//! [`OptimizationState`]. Inside a trial the rows are scored concurrently,
//! `num_threads` at a time.

use super::bootstrap::BootstrapSampler;
use super::candidate::{Candidate, OptimizationState};
use super::config::{Budget, MIN_TRAIN_EXAMPLES, OptimizeParams};
use super::proposer::{CandidateProposer, GroundedProposer, ProposalRequest};
use crate::dataset::{Dataset, Example};
use crate::error::{ConfigurationError, InferenceError, OptimizeError};
use crate::inference::{Generation, InferenceAdapter};
use crate::metric::{self, MetricAdapter};
use crate::prompt::PromptDocument;
use futures::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything a run produced, for callers that want more than the prompt.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct OptimizationReport {
    pub prompt: PromptDocument,
    /// Full-validation score of the emitted prompt.
    pub best_score: f64,
    pub budget: Budget,
    /// Seed first, then proposals.
    pub instructions: Vec<String>,
    pub demo_set_sizes: Vec<usize>,
    pub state: OptimizationState,
}

/// Search driver. Datasets, metric and proposer are injected; the proposer
/// defaults to a [`GroundedProposer`] on the prompter model.
#[derive(Clone)]
pub struct OptimizationLoop {
    params: OptimizeParams,
    train: Option<Dataset>,
    test: Option<Dataset>,
    metric: Option<Arc<dyn MetricAdapter>>,
    proposer: Option<Arc<dyn CandidateProposer>>,
}

impl OptimizationLoop {
    pub fn new(params: OptimizeParams) -> Self {
        Self {
            params,
            train: None,
            test: None,
            metric: None,
            proposer: None,
        }
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

    pub fn with_proposer(self, proposer: impl CandidateProposer + 'static) -> Self {
        self.with_shared_proposer(Arc::new(proposer))
    }

    pub fn with_shared_proposer(mut self, proposer: Arc<dyn CandidateProposer>) -> Self {
        self.proposer = Some(proposer);
        self
    }

    pub fn params(&self) -> &OptimizeParams {
        &self.params
    }

    /// Run the search and return only the optimized prompt.
    pub async fn optimize(
        &self,
        prompt: &PromptDocument,
        inference: &InferenceAdapter,
    ) -> Result<PromptDocument, OptimizeError> {
        Ok(self.run(prompt, inference).await?.prompt)
    }

    /// Run the search.
    ///
    /// Only configuration and format problems are returned as errors. Model
    /// failures cost the trial they happen in and nothing more.
    pub async fn run(
        &self,
        prompt: &PromptDocument,
        inference: &InferenceAdapter,
    ) -> Result<OptimizationReport, OptimizeError> {
        let (train, test, metric) = self.preconditions()?;
        let budget = self.params.validate()?;
        if train.len() < MIN_TRAIN_EXAMPLES {
            return Err(ConfigurationError::TrainingSetTooSmall {
                actual: train.len(),
                required: MIN_TRAIN_EXAMPLES,
            }
            .into());
        }
        if test.is_empty() {
            return Err(ConfigurationError::EmptyValidationSet.into());
        }

        info!(
            "[search] starting: {} candidate instruction(s), {} trial(s), train={}, validation={}",
            budget.num_candidates,
            budget.num_trials,
            train.len(),
            test.len()
        );

        let run = SearchRun {
            params: &self.params,
            metric,
            inference,
            generation: Generation::new(
                self.params.task_model.as_str(),
                self.params.max_tokens,
                self.params.temperature,
            ),
        };

        // ── Bootstrap ──
        let seed_instruction = seed_instruction(prompt, train);
        let predictor = Candidate::new(0, 0, 0, seed_instruction.as_str(), Vec::new())
            .materialize(prompt)?;
        let sampler = BootstrapSampler::from_params(&self.params);
        let bootstrapped = sampler
            .bootstrap(&predictor, train, &run.metric, inference, &run.generation)
            .await;
        let demo_sets = sampler.demo_sets(&bootstrapped, train, budget.num_candidates);

        // ── Propose ──
        let instructions = self
            .instructions(&seed_instruction, prompt, train, &demo_sets, budget, inference)
            .await;

        // ── Candidate pool ──
        let mut candidates = Vec::with_capacity(instructions.len() * demo_sets.len());
        for (i, instruction) in instructions.iter().enumerate() {
            for (d, demos) in demo_sets.iter().enumerate() {
                candidates.push(Candidate::new(
                    candidates.len(),
                    i,
                    d,
                    instruction.as_str(),
                    demos.clone(),
                ));
            }
        }
        info!(
            "[search] {} instruction(s) x {} demo set(s) = {} candidate(s)",
            instructions.len(),
            demo_sets.len(),
            candidates.len()
        );

        let mut state = OptimizationState::default();
        let mut rng = StdRng::seed_from_u64(self.params.seed);

        // Baseline gives the winner a floor even if every trial fails.
        let baseline_score = run.full_validation(&candidates[0], prompt, test).await?;
        state.offer(&candidates[0], baseline_score);
        info!("[search] baseline full-validation score {baseline_score:.4}");

        // ── Trials ──
        let minibatch_size = self.params.minibatch_size.min(test.len());
        let mut failed_trials = 0usize;
        for trial in 0..budget.num_trials {
            let index = select_candidate(&candidates, self.params.exploration, &mut rng);
            let rows: Vec<&Example> = rand::seq::index::sample(&mut rng, test.len(), minibatch_size)
                .into_iter()
                .filter_map(|i| test.get(i))
                .collect();

            let document = candidates[index].materialize(prompt)?;
            let score = match run.minibatch(&document, &rows).await {
                Ok(score) => score,
                Err(e) => {
                    warn!("[search] trial {} failed, scoring 0: {e}", trial + 1);
                    failed_trials += 1;
                    0.0
                }
            };
            candidates[index].record_trial(score);
            state.record_trial(&candidates[index], score);
            info!(
                "[search] trial {}/{}: candidate {} (instruction {}, demos {}) scored {score:.4}, running {:.4}",
                trial + 1,
                budget.num_trials,
                index,
                candidates[index].instruction_index,
                candidates[index].demo_set_index,
                candidates[index].running_score
            );

            if (trial + 1) % self.params.full_eval_every == 0 {
                run.promote(&candidates, &mut state, prompt, test).await?;
            }
        }
        if budget.num_trials % self.params.full_eval_every != 0 {
            run.promote(&candidates, &mut state, prompt, test).await?;
        }
        if failed_trials == budget.num_trials {
            warn!("[search] every trial failed; returning the best candidate seen");
        }

        // ── Emit ──
        let best = state.best_candidate.clone().unwrap_or_else(|| candidates[0].clone());
        info!(
            "[search] done: candidate {} with full-validation score {:.4}",
            best.id, state.best_score
        );
        Ok(OptimizationReport {
            prompt: best.materialize(prompt)?,
            best_score: state.best_score,
            budget,
            instructions,
            demo_set_sizes: demo_sets.iter().map(Vec::len).collect(),
            state,
        })
    }

    fn preconditions(
        &self,
    ) -> Result<(&Dataset, &Dataset, Arc<dyn MetricAdapter>), ConfigurationError> {
        let train = self
            .train
            .as_ref()
            .ok_or(ConfigurationError::MissingAdapter("training dataset"))?;
        let test = self
            .test
            .as_ref()
            .ok_or(ConfigurationError::MissingAdapter("validation dataset"))?;
        let metric = self
            .metric
            .clone()
            .ok_or(ConfigurationError::MissingAdapter("metric adapter"))?;
        Ok((train, test, metric))
    }

    async fn instructions(
        &self,
        seed_instruction: &str,
        prompt: &PromptDocument,
        train: &Dataset,
        demo_sets: &[Vec<Example>],
        budget: Budget,
        inference: &InferenceAdapter,
    ) -> Vec<String> {
        let mut instructions = vec![seed_instruction.to_string()];
        let wanted = budget.num_candidates.saturating_sub(1);
        if wanted == 0 {
            return instructions;
        }
        let proposer: Arc<dyn CandidateProposer> = match &self.proposer {
            Some(p) => p.clone(),
            None => Arc::new(
                GroundedProposer::new(self.params.prompter_model.as_str())
                    .with_sampling(self.params.max_tokens, self.params.prompter_temperature)
                    .with_seed(self.params.seed),
            ),
        };
        let request = ProposalRequest {
            seed_instruction,
            user_template: prompt.fetch_user_template(),
            num_candidates: wanted,
            train,
            demo_sets,
        };
        match proposer.propose(request, inference).await {
            Ok(proposals) => {
                for proposal in proposals {
                    if instructions.len() > wanted {
                        break;
                    }
                    if !proposal.trim().is_empty() && !instructions.contains(&proposal) {
                        instructions.push(proposal);
                    }
                }
            }
            Err(e) => warn!("[search] proposer failed, searching demos only: {e}"),
        }
        instructions
    }
}

/// Borrowed context shared by every evaluation in one run.
struct SearchRun<'a> {
    params: &'a OptimizeParams,
    metric: Arc<dyn MetricAdapter>,
    inference: &'a InferenceAdapter,
    generation: Generation,
}

impl SearchRun<'_> {
    async fn score_row(
        &self,
        document: &PromptDocument,
        example: &Example,
    ) -> Result<f64, InferenceError> {
        let prediction = self
            .inference
            .generate(document, &example.inputs, &self.generation)
            .await?;
        Ok(metric::score(self.metric.clone(), prediction, example.output().to_string()).await)
    }

    /// Mean score on `rows`. Any failed call fails the whole trial.
    async fn minibatch(
        &self,
        document: &PromptDocument,
        rows: &[&Example],
    ) -> Result<f64, InferenceError> {
        let scores: Vec<Result<f64, InferenceError>> = futures::stream::iter(rows.iter().copied())
            .map(|example| self.score_row(document, example))
            .buffer_unordered(self.params.num_threads.max(1))
            .collect()
            .await;
        let scores = scores.into_iter().collect::<Result<Vec<f64>, _>>()?;
        Ok(mean(&scores))
    }

    /// Mean score over the whole validation split. Failed rows score 0.
    async fn full_validation(
        &self,
        candidate: &Candidate,
        base: &PromptDocument,
        test: &Dataset,
    ) -> Result<f64, OptimizeError> {
        let document = candidate.materialize(base)?;
        let scores: Vec<f64> = futures::stream::iter(test.fetch())
            .map(|example| {
                let document = &document;
                async move {
                    self.score_row(document, example).await.unwrap_or_else(|e| {
                        warn!("[search] validation row failed, scoring 0: {e}");
                        0.0
                    })
                }
            })
            .buffer_unordered(self.params.num_threads.max(1))
            .collect()
            .await;
        Ok(mean(&scores))
    }

    /// Fully validate the best-by-running-mean candidate, unless it already was.
    async fn promote(
        &self,
        candidates: &[Candidate],
        state: &mut OptimizationState,
        base: &PromptDocument,
        test: &Dataset,
    ) -> Result<(), OptimizeError> {
        let Some(leader) = best_by_running_score(candidates) else {
            return Ok(());
        };
        if state.is_fully_evaluated(leader.id) {
            debug!("[search] candidate {} already fully validated", leader.id);
            return Ok(());
        }
        let score = self.full_validation(leader, base, test).await?;
        let promoted = state.offer(leader, score);
        info!(
            "[search] full validation of candidate {}: {score:.4}{}",
            leader.id,
            if promoted { " (new best)" } else { "" }
        );
        Ok(())
    }
}

fn mean(scores: &[f64]) -> f64 {
    if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    }
}

/// The instruction the search starts from: the system template, or a
/// generic one built from the dataset's columns when there is none.
pub fn seed_instruction(prompt: &PromptDocument, train: &Dataset) -> String {
    let system = prompt.fetch_system_template().trim();
    if !system.is_empty() {
        return system.to_string();
    }
    let inputs: Vec<String> = train
        .input_columns()
        .iter()
        .map(|c| format!("`{c}`"))
        .collect();
    format!(
        "Given the fields {}, produce the field `{}`.",
        inputs.join(", "),
        train.output_column()
    )
}

/// Highest running mean among tried candidates. Ties go to the lower id.
fn best_by_running_score(candidates: &[Candidate]) -> Option<&Candidate> {
    candidates
        .iter()
        .filter(|c| c.is_tried())
        .fold(None, |best: Option<&Candidate>, c| match best {
            Some(b) if b.running_score >= c.running_score => Some(b),
            _ => Some(c),
        })
}

/// Untried candidates first (random among them), then epsilon-greedy.
fn select_candidate(candidates: &[Candidate], exploration: f64, rng: &mut impl Rng) -> usize {
    let untried: Vec<usize> = candidates
        .iter()
        .filter(|c| !c.is_tried())
        .map(|c| c.id)
        .collect();
    if !untried.is_empty() {
        return untried[rng.gen_range(0..untried.len())];
    }
    if rng.gen_bool(exploration) {
        return rng.gen_range(0..candidates.len());
    }
    best_by_running_score(candidates).map_or(0, |c| c.id)
}

/// Run the search with every collaborator passed explicitly.
///
/// Each `None` is a configuration error raised before any model call.
pub async fn optimize(
    initial_prompt: &PromptDocument,
    train: Option<&Dataset>,
    test: Option<&Dataset>,
    metric: Option<Arc<dyn MetricAdapter>>,
    inference: Option<&InferenceAdapter>,
    params: &OptimizeParams,
) -> Result<PromptDocument, OptimizeError> {
    let train = train.ok_or(ConfigurationError::MissingAdapter("training dataset"))?;
    let test = test.ok_or(ConfigurationError::MissingAdapter("validation dataset"))?;
    let metric = metric.ok_or(ConfigurationError::MissingAdapter("metric adapter"))?;
    let inference = inference.ok_or(ConfigurationError::MissingAdapter("inference adapter"))?;
    OptimizationLoop::new(params.clone())
        .with_datasets(train.clone(), test.clone())
        .with_shared_metric(metric)
        .optimize(initial_prompt, inference)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{FnBackend, InferenceConfig, ModelRequest};
    use crate::metric::ExactMatch;
    use crate::optimizer::StaticProposer;
    use crate::prompt::PromptBuilder;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tried(id: usize, score: f64) -> Candidate {
        let mut c = Candidate::new(id, id, 0, "i", vec![]);
        c.record_trial(score);
        c
    }

    #[test]
    fn running_leader_breaks_ties_by_id() {
        let pool = vec![
            Candidate::new(0, 0, 0, "i", vec![]),
            tried(1, 0.5),
            tried(2, 0.5),
            tried(3, 0.2),
        ];
        assert_eq!(best_by_running_score(&pool).unwrap().id, 1);
        assert!(best_by_running_score(&pool[..1]).is_none());
    }

    #[test]
    fn selection_tries_everything_before_exploiting() {
        let mut pool: Vec<Candidate> = (0..4)
            .map(|i| Candidate::new(i, i, 0, "i", vec![]))
            .collect();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..4 {
            let i = select_candidate(&pool, 0.0, &mut rng);
            assert!(!pool[i].is_tried());
            pool[i].record_trial(if i == 2 { 1.0 } else { 0.0 });
        }
        assert_eq!(select_candidate(&pool, 0.0, &mut rng), 2);
    }

    #[test]
    fn seed_instruction_falls_back_to_columns() {
        let rows = [serde_json::json!({"q": "1", "a": "2"})];
        let data = Dataset::from_rows(rows, &["q"], &["a"]).unwrap();
        let bare = PromptBuilder::new()
            .set_user_prompt("{{q}}", ["q"])
            .adapt()
            .unwrap();
        assert_eq!(
            seed_instruction(&bare, &data),
            "Given the fields `q`, produce the field `a`."
        );
        let full = PromptBuilder::new()
            .set_system_prompt("Solve it.", Vec::<String>::new())
            .set_user_prompt("{{q}}", ["q"])
            .adapt()
            .unwrap();
        assert_eq!(seed_instruction(&full, &data), "Solve it.");
    }

    fn arithmetic() -> (Dataset, Dataset) {
        let rows = (0..8)
            .map(|i| serde_json::json!({"n": i.to_string(), "double": (i * 2).to_string()}));
        Dataset::from_rows(rows, &["n"], &["double"])
            .unwrap()
            .split(0.5)
            .unwrap()
    }

    /// Doubles correctly only when the system prompt says "Double".
    fn doubling_backend()
    -> FnBackend<impl Fn(&ModelRequest) -> Result<String, String> + Send + Sync> {
        FnBackend::new(|req: &ModelRequest| Ok(answer(req)))
    }

    fn answer(req: &ModelRequest) -> String {
        let n: i64 = req
            .messages
            .last()
            .and_then(|m| m.content.trim().parse().ok())
            .unwrap_or(-1);
        if says_double(req) {
            (n * 2).to_string()
        } else {
            n.to_string()
        }
    }

    fn says_double(req: &ModelRequest) -> bool {
        req.messages
            .iter()
            .any(|m| m.role == crate::MessageRole::System && m.content.contains("Double"))
    }

    fn no_limit() -> InferenceConfig {
        InferenceConfig::default().with_rate_limit(0)
    }

    #[tokio::test]
    async fn search_promotes_the_better_instruction() {
        let (train, test) = arithmetic();
        let inference = InferenceAdapter::new(doubling_backend(), no_limit());
        let prompt = PromptBuilder::new()
            .set_system_prompt("Repeat the number.", Vec::<String>::new())
            .set_user_prompt("{{n}}", ["n"])
            .adapt()
            .unwrap();
        let params = OptimizeParams::default()
            .with_budget(2, 4)
            .with_demos(0, 0)
            .with_full_eval_every(2);

        let report = OptimizationLoop::new(params)
            .with_datasets(train, test)
            .with_metric(ExactMatch)
            .with_proposer(StaticProposer::new(["Double the number."]))
            .run(&prompt, &inference)
            .await
            .unwrap();

        assert_eq!(report.prompt.fetch_system_template(), "Double the number.");
        assert_eq!(report.best_score, 1.0);
        assert_eq!(report.state.trials_run, 4);
        assert_eq!(report.instructions.len(), 2);
        assert_eq!(report.prompt.fetch_user_template(), "{{n}}");
    }

    #[tokio::test]
    async fn failing_model_still_returns_baseline() {
        let (train, test) = arithmetic();
        let backend = FnBackend::new(|_: &ModelRequest| Err("HTTP 400 bad request".to_string()));
        let inference = InferenceAdapter::new(backend, no_limit());
        let prompt = PromptBuilder::new()
            .set_user_prompt("{{n}}", ["n"])
            .adapt()
            .unwrap();

        let report = OptimizationLoop::new(OptimizeParams::default().with_budget(2, 3))
            .with_datasets(train, test)
            .with_metric(ExactMatch)
            .with_proposer(StaticProposer::new(["Alt."]))
            .run(&prompt, &inference)
            .await
            .unwrap();
        assert_eq!(report.best_score, 0.0);
        assert_eq!(report.state.best_candidate.as_ref().unwrap().id, 0);
        assert!(!report.prompt.fetch_system_template().is_empty());
    }

    #[tokio::test]
    async fn failed_trials_score_zero_and_search_continues() {
        let (train, test) = arithmetic();
        // The second call made under the "Double" instruction is rejected.
        let double_calls = AtomicUsize::new(0);
        let backend = FnBackend::new(move |req: &ModelRequest| {
            if says_double(req) && double_calls.fetch_add(1, Ordering::SeqCst) == 1 {
                return Err("HTTP 400 bad request".to_string());
            }
            Ok(answer(req))
        });
        let inference = InferenceAdapter::new(backend, no_limit());
        let prompt = PromptBuilder::new()
            .set_system_prompt("Repeat the number.", Vec::<String>::new())
            .set_user_prompt("{{n}}", ["n"])
            .adapt()
            .unwrap();
        let params = OptimizeParams {
            exploration: 0.0,
            ..OptimizeParams::default()
                .with_budget(2, 5)
                .with_demos(0, 0)
                .with_minibatch_size(1)
                .with_full_eval_every(5)
        };

        let report = OptimizationLoop::new(params)
            .with_datasets(train, test)
            .with_metric(ExactMatch)
            .with_proposer(StaticProposer::new(["Double the number."]))
            .run(&prompt, &inference)
            .await
            .unwrap();

        assert_eq!(report.state.trials_run, 5);
        let double_trials: Vec<f64> = report
            .state
            .history
            .iter()
            .filter(|(c, _)| c.id == 1)
            .map(|(_, score)| *score)
            .collect();
        assert_eq!(double_trials.len(), 4);
        assert_eq!(double_trials.iter().filter(|s| **s == 0.0).count(), 1);
        assert_eq!(report.state.best_candidate.as_ref().unwrap().id, 1);
        assert_eq!(report.best_score, 1.0);
        assert_eq!(report.prompt.fetch_system_template(), "Double the number.");
    }

    #[tokio::test]
    async fn missing_metric_fails_before_any_call() {
        let (train, test) = arithmetic();
        let inference = InferenceAdapter::new(doubling_backend(), no_limit());
        let prompt = PromptBuilder::new()
            .set_user_prompt("{{n}}", ["n"])
            .adapt()
            .unwrap();
        let params = OptimizeParams::default();
        let err = optimize(&prompt, Some(&train), Some(&test), None, Some(&inference), &params)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OptimizeError::Configuration(ConfigurationError::MissingAdapter("metric adapter"))
        ));
        assert_eq!(inference.attempts(), 0);
    }
}
