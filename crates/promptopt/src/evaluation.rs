//! Scoring a prompt over a whole dataset.
//!
//! The [`Evaluator`] runs inference for every row, scores each prediction
//! with the guarded metric, and can write the per-row results as JSON Lines.
//! Inference results are cached per model id, so `scores` followed by
//! `aggregate_score` calls the model once per row, not twice.

use crate::dataset::{Dataset, Example};
use crate::error::FormatError;
use crate::inference::{Generation, InferenceAdapter, InferenceRecord, run_dataset};
use crate::metric::{self, MetricAdapter};
use crate::prompt::PromptDocument;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Default concurrent model calls during evaluation.
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// One scored row.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EvaluationRecord {
    pub inputs: BTreeMap<String, String>,
    pub outputs: BTreeMap<String, String>,
    pub inference_output: String,
    pub score: f64,
}

/// Evaluates one prompt on one dataset with one metric.
pub struct Evaluator<'a> {
    prompt: PromptDocument,
    dataset: Dataset,
    metric: Arc<dyn MetricAdapter>,
    inference: &'a InferenceAdapter,
    max_workers: usize,
    max_tokens: u32,
    temperature: f32,
    cache: Mutex<HashMap<String, Arc<Vec<InferenceRecord>>>>,
    results: Mutex<Vec<EvaluationRecord>>,
}

impl<'a> Evaluator<'a> {
    pub fn new(
        prompt: PromptDocument,
        dataset: Dataset,
        metric: Arc<dyn MetricAdapter>,
        inference: &'a InferenceAdapter,
    ) -> Self {
        Self {
            prompt,
            dataset,
            metric,
            inference,
            max_workers: DEFAULT_MAX_WORKERS,
            max_tokens: crate::optimizer::DEFAULT_MAX_TOKENS,
            temperature: 0.0,
            cache: Mutex::new(HashMap::new()),
            results: Mutex::new(Vec::new()),
        }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn with_sampling(mut self, max_tokens: u32, temperature: f32) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    async fn inference_results(&self, model_id: &str) -> Arc<Vec<InferenceRecord>> {
        let cached = self
            .cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(model_id)
            .cloned();
        if let Some(records) = cached {
            info!("Using cached inference results for {model_id}");
            return records;
        }

        info!("Cache miss - running inference on {} row(s)", self.dataset.len());
        let generation = Generation::new(model_id, self.max_tokens, self.temperature);
        let records = Arc::new(
            run_dataset(
                self.inference,
                &self.prompt,
                &self.dataset,
                &generation,
                self.max_workers,
            )
            .await,
        );
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(model_id.to_string(), records.clone());
        records
    }

    fn successful(records: &[InferenceRecord]) -> Vec<(&Example, &str)> {
        records
            .iter()
            .filter_map(|r| match &r.output {
                Ok(text) => Some((&r.example, text.as_str())),
                Err(e) => {
                    warn!("Dropping row from evaluation: {e}");
                    None
                }
            })
            .collect()
    }

    /// Score every row individually. Rows whose inference failed are dropped.
    pub async fn scores(&self, model_id: &str) -> Vec<EvaluationRecord> {
        let records = self.inference_results(model_id).await;
        info!("Running evaluation on dataset with per-row metric");

        let mut results = Vec::new();
        for (example, prediction) in Self::successful(&records) {
            let score = metric::score(
                self.metric.clone(),
                prediction.to_string(),
                example.output().to_string(),
            )
            .await;
            results.push(EvaluationRecord {
                inputs: example.inputs.clone(),
                outputs: example.outputs.clone(),
                inference_output: prediction.to_string(),
                score,
            });
        }

        *self.results.lock().unwrap_or_else(|e| e.into_inner()) = results.clone();
        results
    }

    /// Batch score over all successful rows.
    pub async fn aggregate_score(&self, model_id: &str) -> f64 {
        let records = self.inference_results(model_id).await;
        let (predictions, references): (Vec<String>, Vec<String>) = Self::successful(&records)
            .into_iter()
            .map(|(example, prediction)| (prediction.to_string(), example.output().to_string()))
            .unzip();

        // Populate per-row results so save() has something to write.
        self.scores(model_id).await;

        info!("Running batch evaluation on dataset");
        let metric = self.metric.clone();
        match tokio::task::spawn_blocking(move || metric.batch_apply(&predictions, &references))
            .await
        {
            Ok(score) if score.is_finite() => score.clamp(0.0, 1.0),
            Ok(score) => {
                warn!("batch metric returned {score}; scoring 0.0");
                0.0
            }
            Err(e) => {
                warn!("batch metric failed: {e}; scoring 0.0");
                0.0
            }
        }
    }

    /// Write the last per-row results to `path` as JSON Lines.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), FormatError> {
        let path = path.as_ref();
        let results = self.results.lock().unwrap_or_else(|e| e.into_inner());
        if results.is_empty() {
            warn!("No results to save");
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
        for record in results.iter() {
            serde_json::to_writer(&mut file, record)?;
            file.write_all(b"\n")?;
        }
        file.flush()?;
        info!("Saved evaluation results to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{FnBackend, InferenceConfig, ModelRequest};
    use crate::metric::ExactMatch;
    use crate::prompt::PromptBuilder;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> (PromptDocument, Dataset) {
        let prompt = PromptBuilder::new()
            .set_user_prompt("{{word}}", ["word"])
            .adapt()
            .unwrap();
        let rows = ["cat", "dog", "fail", "owl"]
            .iter()
            .map(|w| serde_json::json!({"word": w, "answer": w.to_uppercase()}));
        (prompt, Dataset::from_rows(rows, &["word"], &["answer"]).unwrap())
    }

    fn adapter(calls: Arc<AtomicUsize>) -> InferenceAdapter {
        let backend = FnBackend::new(move |req: &ModelRequest| {
            calls.fetch_add(1, Ordering::SeqCst);
            let word = req.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            match word.as_str() {
                "fail" => Err("HTTP 400 bad request".to_string()),
                "owl" => Ok("wrong".to_string()),
                _ => Ok(word.to_uppercase()),
            }
        });
        InferenceAdapter::new(backend, InferenceConfig::default().with_rate_limit(0))
    }

    #[tokio::test]
    async fn scores_drop_failed_rows() {
        let calls = Arc::new(AtomicUsize::new(0));
        let inference = adapter(calls.clone());
        let (prompt, dataset) = setup();
        let evaluator = Evaluator::new(prompt, dataset, Arc::new(ExactMatch), &inference);

        let results = evaluator.scores("m").await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].inference_output, "CAT");
        assert_eq!(results[0].score, 1.0);
        assert_eq!(results[2].score, 0.0);
    }

    #[tokio::test]
    async fn aggregate_uses_cache_and_batch_mean() {
        let calls = Arc::new(AtomicUsize::new(0));
        let inference = adapter(calls.clone());
        let (prompt, dataset) = setup();
        let evaluator = Evaluator::new(prompt, dataset, Arc::new(ExactMatch), &inference);

        let score = evaluator.aggregate_score("m").await;
        assert!((score - 2.0 / 3.0).abs() < 1e-9, "{score}");
        evaluator.scores("m").await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        evaluator.scores("other-model").await;
        assert_eq!(calls.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn save_writes_jsonl() {
        let calls = Arc::new(AtomicUsize::new(0));
        let inference = adapter(calls);
        let (prompt, dataset) = setup();
        let evaluator = Evaluator::new(prompt, dataset, Arc::new(ExactMatch), &inference);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/eval.jsonl");
        evaluator.save(&path).unwrap();
        assert!(!path.exists());

        evaluator.scores("m").await;
        evaluator.save(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        let first: EvaluationRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.inputs["word"], "cat");
        assert_eq!(first.outputs["answer"], "CAT");
    }
}
