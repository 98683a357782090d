//! Labeled examples with fixed columns and deterministic splits.
//!
//! A [`Dataset`] is built once from parsed rows and never changes. Column
//! names are fixed at construction: every example carries exactly the
//! declared input columns and the single output column. Splits preserve
//! order and never shuffle, so the same data always yields the same
//! train/test partition.

use crate::error::FormatError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One labeled row.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Example {
    pub inputs: BTreeMap<String, String>,
    pub outputs: BTreeMap<String, String>,
}

impl Example {
    pub fn new<I, O, K, V>(inputs: I, outputs: O) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        O: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            inputs: inputs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            outputs: outputs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// The reference answer. Datasets have exactly one output column.
    pub fn output(&self) -> &str {
        self.outputs.values().next().map_or("", String::as_str)
    }
}

/// An ordered, immutable collection of [`Example`]s.
///
/// Cloning is cheap; clones share the underlying rows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dataset {
    input_columns: Vec<String>,
    output_column: String,
    examples: Arc<[Example]>,
}

impl Dataset {
    /// Build from JSON rows (one object per row, as read from JSONL).
    ///
    /// `output_columns` must name exactly one column. A column missing from
    /// a row reads as the empty string; numbers and booleans are converted
    /// to their text form; nested values are kept as compact JSON.
    pub fn from_rows<R, S>(
        rows: R,
        input_columns: &[S],
        output_columns: &[S],
    ) -> Result<Self, FormatError>
    where
        R: IntoIterator<Item = Value>,
        S: AsRef<str>,
    {
        let [output_column] = output_columns else {
            return Err(FormatError::OutputColumns(output_columns.len()));
        };
        let output_column = output_column.as_ref().to_string();
        let input_columns: Vec<String> = input_columns
            .iter()
            .map(|c| c.as_ref().to_string())
            .collect();

        let mut examples = Vec::new();
        for (index, row) in rows.into_iter().enumerate() {
            let Value::Object(fields) = row else {
                return Err(FormatError::InvalidRecord {
                    index,
                    reason: "expected a JSON object".into(),
                });
            };
            let cell = |col: &str| fields.get(col).map(value_text).unwrap_or_default();
            examples.push(Example {
                inputs: input_columns
                    .iter()
                    .map(|c| (c.clone(), cell(c)))
                    .collect(),
                outputs: BTreeMap::from([(output_column.clone(), cell(&output_column))]),
            });
        }

        Ok(Self {
            input_columns,
            output_column,
            examples: examples.into(),
        })
    }

    /// Build from ready-made examples. Each must carry exactly the declared
    /// columns.
    pub fn from_examples(
        input_columns: Vec<String>,
        output_column: impl Into<String>,
        examples: Vec<Example>,
    ) -> Result<Self, FormatError> {
        let output_column = output_column.into();
        for (index, example) in examples.iter().enumerate() {
            let inputs_match = example.inputs.len() == input_columns.len()
                && input_columns.iter().all(|c| example.inputs.contains_key(c));
            if !inputs_match {
                return Err(FormatError::InvalidRecord {
                    index,
                    reason: format!("inputs must be exactly {input_columns:?}"),
                });
            }
            if example.outputs.len() != 1 || !example.outputs.contains_key(&output_column) {
                return Err(FormatError::InvalidRecord {
                    index,
                    reason: format!("outputs must be exactly [{output_column:?}]"),
                });
            }
        }
        Ok(Self {
            input_columns,
            output_column,
            examples: examples.into(),
        })
    }

    fn with_rows(&self, examples: Vec<Example>) -> Self {
        Self {
            input_columns: self.input_columns.clone(),
            output_column: self.output_column.clone(),
            examples: examples.into(),
        }
    }

    pub fn input_columns(&self) -> &[String] {
        &self.input_columns
    }

    pub fn output_column(&self) -> &str {
        &self.output_column
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Example> {
        self.examples.get(index)
    }

    /// Iterate the examples in order. Each call starts from the beginning.
    pub fn fetch(&self) -> impl Iterator<Item = &Example> + '_ {
        self.examples.iter()
    }

    /// Split into `(train, test)` with `floor(len * fraction)` training rows.
    ///
    /// Order-preserving. Fails if the training half would be empty.
    pub fn split(&self, fraction: f64) -> Result<(Dataset, Dataset), FormatError> {
        check_fraction(fraction)?;
        let train_size = (self.len() as f64 * fraction).floor() as usize;
        if train_size == 0 {
            return Err(FormatError::EmptyTrainSplit {
                total: self.len(),
                fraction,
            });
        }
        let (train, test) = self.examples.split_at(train_size);
        Ok((self.with_rows(train.to_vec()), self.with_rows(test.to_vec())))
    }

    /// Split each output-value group separately, then concatenate groups in
    /// order of first appearance.
    pub fn split_stratified(&self, fraction: f64) -> Result<(Dataset, Dataset), FormatError> {
        check_fraction(fraction)?;

        let mut groups: Vec<(&str, Vec<&Example>)> = Vec::new();
        for example in self.fetch() {
            let key = example.output();
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, rows)) => rows.push(example),
                None => groups.push((key, vec![example])),
            }
        }

        let mut train = Vec::new();
        let mut test = Vec::new();
        for (_, rows) in groups {
            let cut = (rows.len() as f64 * fraction).floor() as usize;
            let (head, tail) = rows.split_at(cut);
            train.extend(head.iter().map(|e| (*e).clone()));
            test.extend(tail.iter().map(|e| (*e).clone()));
        }

        if train.is_empty() {
            return Err(FormatError::EmptyTrainSplit {
                total: self.len(),
                fraction,
            });
        }
        Ok((self.with_rows(train), self.with_rows(test)))
    }

    /// Borrow the first `n` examples as a new dataset.
    pub fn take(&self, n: usize) -> Dataset {
        self.with_rows(self.examples.iter().take(n).cloned().collect())
    }
}

fn check_fraction(fraction: f64) -> Result<(), FormatError> {
    if fraction > 0.0 && fraction < 1.0 {
        Ok(())
    } else {
        Err(FormatError::SplitFraction(fraction))
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(_) | Value::Number(_) => value.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}
