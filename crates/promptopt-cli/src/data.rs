//! Record loading: JSON Lines (or a JSON array) into a [`Dataset`].

use promptopt::dataset::Dataset;
use promptopt::error::FormatError;
use serde_json::Value;
use std::path::Path;

/// Read records from `path`. A `.json` file must hold one array; anything
/// else is read as JSON Lines, skipping blank lines.
pub fn load_records(path: &Path) -> Result<Vec<Value>, FormatError> {
    let text = std::fs::read_to_string(path)?;
    if path.extension().is_some_and(|ext| ext == "json") {
        return match serde_json::from_str::<Value>(&text)? {
            Value::Array(rows) => Ok(rows),
            _ => Err(FormatError::InvalidRecord {
                index: 0,
                reason: format!("{} must contain a JSON array", path.display()),
            }),
        };
    }
    parse_jsonl(&text)
}

pub fn parse_jsonl(text: &str) -> Result<Vec<Value>, FormatError> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line).map_err(|e| FormatError::InvalidRecord {
                index,
                reason: format!("line {}: {e}", index + 1),
            })
        })
        .collect()
}

/// Split a comma-separated column list, dropping empty entries.
pub fn parse_columns(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(String::from)
        .collect()
}

pub fn load_dataset(
    path: &Path,
    input_columns: &[String],
    output_column: &str,
) -> Result<Dataset, FormatError> {
    let rows = load_records(path)?;
    Dataset::from_rows(rows, input_columns, &[output_column.to_string()])
}
