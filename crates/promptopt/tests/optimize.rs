//! End-to-end runs of the search against a scripted in-process backend.

use promptopt::optimizer::{OptimizationLoop, OptimizeParams, StaticProposer, optimize};
use promptopt::prelude::*;
use std::sync::Arc;

/// Answers with the doubled number, but only when told to double.
fn scripted_inference() -> InferenceAdapter {
    let backend = FnBackend::new(|req: &ModelRequest| {
        let told_to_double = req
            .messages
            .iter()
            .any(|m| m.role == MessageRole::System && m.content.contains("double"));
        let n: i64 = req
            .messages
            .last()
            .and_then(|m| m.content.trim().parse().ok())
            .ok_or_else(|| "HTTP 400 bad request: not a number".to_string())?;
        Ok(if told_to_double { n * 2 } else { n }.to_string())
    });
    InferenceAdapter::new(backend, InferenceConfig::default().with_rate_limit(0))
}

fn numbers(range: std::ops::Range<i64>) -> Dataset {
    let rows = range.map(|n| serde_json::json!({"n": n, "twice": n * 2}));
    Dataset::from_rows(rows, &["n"], &["twice"]).unwrap()
}

fn prompt() -> PromptDocument {
    PromptBuilder::new()
        .set_user_prompt("{{n}}", ["n"])
        .adapt()
        .unwrap()
}

#[tokio::test]
async fn missing_dataset_or_metric_fails_before_any_model_call() {
    let inference = scripted_inference();
    let data = numbers(0..4);
    let params = OptimizeParams::default();
    let metric: Arc<dyn MetricAdapter> = Arc::new(ExactMatch);

    let err = optimize(
        &prompt(),
        None,
        Some(&data),
        Some(metric.clone()),
        Some(&inference),
        &params,
    )
    .await
        .unwrap_err();
    assert!(matches!(
        err,
        OptimizeError::Configuration(ConfigurationError::MissingAdapter(_))
    ));

    let err = optimize(&prompt(), Some(&data), Some(&data), None, Some(&inference), &params)
        .await
        .unwrap_err();
    assert!(matches!(err, OptimizeError::Configuration(_)));

    let err = optimize(&prompt(), Some(&data), Some(&data), Some(metric), None, &params)
        .await
        .unwrap_err();
    assert!(matches!(err, OptimizeError::Configuration(_)));

    assert_eq!(inference.attempts(), 0);
}

#[tokio::test]
async fn partial_budget_and_tiny_train_split_are_rejected_up_front() {
    let inference = scripted_inference();
    let params = OptimizeParams {
        num_trials: Some(5),
        ..Default::default()
    };
    let err = OptimizationLoop::new(params)
        .with_datasets(numbers(0..4), numbers(4..8))
        .with_metric(ExactMatch)
        .optimize(&prompt(), &inference)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OptimizeError::Configuration(ConfigurationError::PartialBudget { .. })
    ));

    let err = OptimizationLoop::new(OptimizeParams::default())
        .with_datasets(numbers(0..1), numbers(4..8))
        .with_metric(ExactMatch)
        .optimize(&prompt(), &inference)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OptimizeError::Configuration(ConfigurationError::TrainingSetTooSmall {
            actual: 1,
            required: 2
        })
    ));
    assert_eq!(inference.attempts(), 0);
}

#[tokio::test]
async fn two_training_examples_yield_a_system_prompt() {
    let inference = scripted_inference();
    let metric: Arc<dyn MetricAdapter> = Arc::new(ExactMatch);
    let params = OptimizeParams::default().with_budget(2, 3);

    let optimized = OptimizationLoop::new(params)
        .with_datasets(numbers(0..2), numbers(2..5))
        .with_shared_metric(metric)
        .with_proposer(StaticProposer::new(["Always double the number you are given."]))
        .optimize(&prompt(), &inference)
        .await
        .unwrap();

    assert!(!optimized.fetch_system_template().is_empty());
    assert_eq!(optimized.fetch_user_template(), "{{n}}");
    assert!(optimized.user_variables().contains("n"));
}

#[tokio::test]
async fn winner_is_chosen_by_full_validation() {
    let inference = scripted_inference();
    let params = OptimizeParams::default()
        .with_budget(3, 6)
        .with_demos(0, 0)
        .with_minibatch_size(2)
        .with_full_eval_every(3);

    let report = OptimizationLoop::new(params)
        .with_datasets(numbers(0..4), numbers(4..10))
        .with_metric(ExactMatch)
        .with_proposer(StaticProposer::new(["Repeat it.", "Please double it."]))
        .run(&prompt(), &inference)
        .await
        .unwrap();

    assert_eq!(report.prompt.fetch_system_template(), "Please double it.");
    assert_eq!(report.best_score, 1.0);
    let best = report.state.best_candidate.as_ref().unwrap();
    assert!(report.state.is_fully_evaluated(best.id));
    assert_eq!(report.state.trials_run, 6);
}

#[tokio::test]
async fn saved_result_round_trips_through_disk() {
    let inference = scripted_inference();
    let optimized = OptimizationLoop::new(OptimizeParams::default().with_budget(2, 2))
        .with_datasets(numbers(0..4), numbers(4..6))
        .with_metric(ExactMatch)
        .with_proposer(StaticProposer::new(["Please double it."]))
        .optimize(&prompt(), &inference)
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    optimized.save(dir.path()).unwrap();
    let loaded = PromptDocument::load(dir.path()).unwrap();
    assert_eq!(loaded, optimized);
}
