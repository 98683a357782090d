//! Few-shot demo pools bootstrapped from the training split.
//!
//! The seed predictor (initial instruction, no demos) runs over a sample of
//! training examples. Predictions the metric scores above the threshold
//! become bootstrapped demos, carrying the model's own output. Demo sets are
//! then assembled from those plus raw labeled examples:
//!
//! - set 0: no demos (zero-shot)
//! - set 1: the first `max_labeled_demos` labeled examples
//! - set 2..: a seeded shuffle of up to `max_bootstrapped_demos`
//!   bootstrapped demos, topped up with shuffled labeled examples to
//!   `max_labeled_demos`
//!
//! Identical sets are dropped, so fewer than requested may come back.

use super::config::OptimizeParams;
use crate::dataset::{Dataset, Example};
use crate::inference::{Generation, InferenceAdapter};
use crate::metric::{self, MetricAdapter};
use crate::prompt::PromptDocument;
use futures::StreamExt;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapSampler {
    pub max_bootstrapped_demos: usize,
    pub max_labeled_demos: usize,
    /// Demos must score strictly above this.
    pub threshold: f64,
    /// Training examples run through the predictor.
    pub max_sample: usize,
    pub num_threads: usize,
    pub seed: u64,
}

impl BootstrapSampler {
    pub fn from_params(params: &OptimizeParams) -> Self {
        Self {
            max_bootstrapped_demos: params.max_bootstrapped_demos,
            max_labeled_demos: params.max_labeled_demos,
            threshold: params.bootstrap_threshold,
            max_sample: params.max_bootstrap_sample,
            num_threads: params.num_threads,
            seed: params.seed,
        }
    }

    /// Run `predictor` over the training sample and keep what scores well.
    ///
    /// Failed model calls are skipped. Returns examples whose output is the
    /// model's prediction, in training order.
    pub async fn bootstrap(
        &self,
        predictor: &PromptDocument,
        train: &Dataset,
        metric: &Arc<dyn MetricAdapter>,
        inference: &InferenceAdapter,
        generation: &Generation,
    ) -> Vec<Example> {
        if self.max_bootstrapped_demos == 0 {
            return Vec::new();
        }
        let sample = self.max_sample.min(train.len());
        info!("[bootstrap] running seed predictor over {sample} training example(s)");

        let output_column = train.output_column().to_string();
        let results: Vec<Option<Example>> = futures::stream::iter(train.fetch().take(sample))
            .map(|example| {
                let output_column = output_column.clone();
                async move {
                    let prediction = match inference
                        .generate(predictor, &example.inputs, generation)
                        .await
                    {
                        Ok(p) => p,
                        Err(e) => {
                            warn!("[bootstrap] skipping example: {e}");
                            return None;
                        }
                    };
                    let score = metric::score(
                        metric.clone(),
                        prediction.clone(),
                        example.output().to_string(),
                    )
                    .await;
                    (score > self.threshold).then(|| Example {
                        inputs: example.inputs.clone(),
                        outputs: BTreeMap::from([(output_column, prediction)]),
                    })
                }
            })
            .buffered(self.num_threads.max(1))
            .collect()
            .await;

        let successes: Vec<Example> = results.into_iter().flatten().collect();
        info!(
            "[bootstrap] {} of {sample} example(s) scored above {}",
            successes.len(),
            self.threshold
        );
        successes
    }

    /// Assemble up to `num_sets` distinct demo sets.
    pub fn demo_sets(
        &self,
        bootstrapped: &[Example],
        train: &Dataset,
        num_sets: usize,
    ) -> Vec<Vec<Example>> {
        let num_sets = num_sets.max(1);
        let labeled: Vec<Example> = train.fetch().cloned().collect();
        let mut rng = StdRng::seed_from_u64(self.seed);

        let mut sets: Vec<Vec<Example>> = vec![Vec::new()];
        if num_sets > 1 && self.max_labeled_demos > 0 {
            push_distinct(
                &mut sets,
                labeled.iter().take(self.max_labeled_demos).cloned().collect(),
            );
        }

        // Each remaining slot gets one shuffle; duplicates just shrink the pool.
        let attempts = num_sets.saturating_sub(sets.len());
        for _ in 0..attempts {
            if sets.len() >= num_sets {
                break;
            }
            let mut boot = bootstrapped.to_vec();
            boot.shuffle(&mut rng);
            boot.truncate(self.max_bootstrapped_demos);

            let mut rest: Vec<Example> = labeled
                .iter()
                .filter(|e| !boot.iter().any(|b| b.inputs == e.inputs))
                .cloned()
                .collect();
            rest.shuffle(&mut rng);
            rest.truncate(self.max_labeled_demos.saturating_sub(boot.len()));

            boot.extend(rest);
            push_distinct(&mut sets, boot);
        }

        debug!(
            "[bootstrap] built {} demo set(s) (sizes {:?})",
            sets.len(),
            sets.iter().map(Vec::len).collect::<Vec<_>>()
        );
        sets
    }
}

fn push_distinct(sets: &mut Vec<Vec<Example>>, set: Vec<Example>) {
    if !sets.contains(&set) {
        sets.push(set);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{FnBackend, InferenceConfig, ModelRequest};
    use crate::metric::ExactMatch;
    use crate::prompt::PromptBuilder;

    fn train(n: usize) -> Dataset {
        let rows =
            (0..n).map(|i| serde_json::json!({"x": format!("{i}"), "y": format!("{}", i * 2)}));
        Dataset::from_rows(rows, &["x"], &["y"]).unwrap()
    }

    fn sampler() -> BootstrapSampler {
        BootstrapSampler::from_params(&OptimizeParams::default())
    }

    #[test]
    fn first_sets_are_zero_shot_then_labeled() {
        let data = train(6);
        let sets = sampler().demo_sets(&[], &data, 4);
        assert!(sets[0].is_empty());
        assert_eq!(sets[1].len(), 4);
        assert_eq!(sets[1][0].inputs["x"], "0");
        assert!(sets.len() <= 4);
        for set in &sets[1..] {
            assert!(set.len() <= 4);
        }
    }

    #[test]
    fn bootstrapped_sets_mix_in_labeled_and_are_deterministic() {
        let data = train(8);
        let boot = vec![
            Example::new([("x", "1")], [("y", "2")]),
            Example::new([("x", "3")], [("y", "6")]),
        ];
        let params = OptimizeParams::default().with_demos(2, 3);
        let sampler = BootstrapSampler::from_params(&params);

        let a = sampler.demo_sets(&boot, &data, 5);
        let b = sampler.demo_sets(&boot, &data, 5);
        assert_eq!(a, b);
        for set in &a[2..] {
            assert_eq!(set.len(), 3);
            let boot_count = set.iter().filter(|e| boot.contains(e)).count();
            assert_eq!(boot_count, 2);
        }
    }

    #[test]
    fn single_set_is_zero_shot() {
        let sets = sampler().demo_sets(&[], &train(3), 1);
        assert_eq!(sets, vec![Vec::<Example>::new()]);
    }

    #[tokio::test]
    async fn bootstrap_keeps_only_high_scores() {
        // Doubles correctly except for "3", fails outright on "4".
        let backend = FnBackend::new(|req: &ModelRequest| {
            let x: u32 = req
                .messages
                .last()
                .and_then(|m| m.content.parse().ok())
                .unwrap_or(0);
            match x {
                3 => Ok("wrong".into()),
                4 => Err("HTTP 400 bad request".into()),
                _ => Ok((x * 2).to_string()),
            }
        });
        let inference =
            InferenceAdapter::new(backend, InferenceConfig::default().with_rate_limit(0));
        let predictor = PromptBuilder::new()
            .set_user_prompt("{x}", ["x"])
            .adapt()
            .unwrap();
        let metric: Arc<dyn MetricAdapter> = Arc::new(ExactMatch);

        let kept = sampler()
            .bootstrap(&predictor, &train(6), &metric, &inference, &Generation::new("m", 8, 0.0))
            .await;
        let xs: Vec<_> = kept.iter().map(|e| e.inputs["x"].as_str()).collect();
        assert_eq!(xs, vec!["0", "1", "2", "5"]);
        assert_eq!(kept[3].output(), "10");
    }
}
