//! Narrow persistence seam for datasets and run results.
//!
//! The engine never holds a connection handle. Callers that keep job state
//! somewhere implement [`RunRepository`]; [`DirectoryRepository`] is the
//! filesystem version:
//!
//! ```text
//! <root>/datasets/<id>.jsonl     one {"inputs": .., "outputs": ..} per line
//! <root>/<run_id>/result.json    pretty-printed JSON
//! ```

use crate::dataset::{Dataset, Example};
use crate::error::{FormatError, StoreError};
use serde_json::Value;
use std::io::{BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const DATASETS_DIR: &str = "datasets";
pub const RESULT_FILE: &str = "result.json";

pub trait RunRepository: Send + Sync {
    fn get_dataset(&self, id: &str) -> Result<Dataset, StoreError>;
    fn save_result(&self, run_id: &str, result: &Value) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct DirectoryRepository {
    root: PathBuf,
}

impl DirectoryRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: &str) -> Result<PathBuf, StoreError> {
        Ok(self.root.join(checked_id(run_id)?))
    }

    fn dataset_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        Ok(self
            .root
            .join(DATASETS_DIR)
            .join(format!("{}.jsonl", checked_id(id)?)))
    }

    /// Store `dataset` under `id`, replacing any previous one.
    pub fn put_dataset(&self, id: &str, dataset: &Dataset) -> Result<(), StoreError> {
        let path = self.dataset_path(id)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = BufWriter::new(std::fs::File::create(&path)?);
        for example in dataset.fetch() {
            serde_json::to_writer(&mut file, example)?;
            file.write_all(b"\n")?;
        }
        file.flush()?;
        debug!("Stored {} example(s) at {}", dataset.len(), path.display());
        Ok(())
    }

    pub fn load_result(&self, run_id: &str) -> Result<Value, StoreError> {
        let path = self.run_dir(run_id)?.join(RESULT_FILE);
        if !path.exists() {
            return Err(StoreError::NotFound(format!("run {run_id}")));
        }
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }
}

impl RunRepository for DirectoryRepository {
    fn get_dataset(&self, id: &str) -> Result<Dataset, StoreError> {
        let path = self.dataset_path(id)?;
        if !path.exists() {
            return Err(StoreError::NotFound(format!("dataset {id}")));
        }
        let reader = std::io::BufReader::new(std::fs::File::open(&path)?);
        let mut examples = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let example: Example = serde_json::from_str(&line)?;
            examples.push(example);
        }

        // Columns come from the first record; from_examples checks the rest.
        let Some(first) = examples.first() else {
            return Err(FormatError::InvalidRecord {
                index: 0,
                reason: format!("dataset {id} is empty"),
            }
            .into());
        };
        let input_columns: Vec<String> = first.inputs.keys().cloned().collect();
        let output_column = first.outputs.keys().next().cloned().unwrap_or_default();
        Ok(Dataset::from_examples(input_columns, output_column, examples)?)
    }

    fn save_result(&self, run_id: &str, result: &Value) -> Result<(), StoreError> {
        let dir = self.run_dir(run_id)?;
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(RESULT_FILE), serde_json::to_string_pretty(result)?)?;
        debug!("Saved result for run {run_id}");
        Ok(())
    }
}

fn checked_id(id: &str) -> Result<&str, StoreError> {
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(id)
    } else {
        Err(StoreError::InvalidId(id.to_string()))
    }
}
