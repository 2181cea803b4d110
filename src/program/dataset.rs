//! JSON persistence for programs and example sets.
//!
//! Programs are stored as a single JSON object. Datasets are either a JSON
//! array of examples or JSON Lines (one example per line); examples without an
//! `id` get their zero-based position as id.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use super::types::{Example, Fields, Program};

impl Program {
    /// Load a program from a JSON file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read program from {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse program from {}", path.display()))
    }

    /// Write the program as pretty-printed JSON, creating parent directories.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write program to {}", path.display()))
    }
}

/// On-disk shape of one example.
#[derive(Deserialize)]
struct RawExample {
    /// Falls back to the example's position in the file.
    #[serde(default)]
    id: Option<String>,
    /// Values for the program's input fields.
    inputs: Fields,
    /// Expected outputs; may be absent for unlabeled data.
    #[serde(default)]
    outputs: Fields,
}

/// Parse a dataset from JSON array or JSON Lines text.
///
/// Text starting with `[` is read as one array; anything else is read line
/// by line with blank lines skipped. Missing ids become the zero-based
/// position among the parsed examples.
pub fn parse_examples(text: &str) -> Result<Vec<Example>> {
    let trimmed = text.trim_start();
    let raw: Vec<RawExample> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).context("Failed to parse dataset as a JSON array")?
    } else {
        trimmed
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(lineno, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("Failed to parse dataset line {}", lineno + 1))
            })
            .collect::<Result<_>>()?
    };

    Ok(raw
        .into_iter()
        .enumerate()
        .map(|(i, r)| Example::new(r.id.unwrap_or_else(|| i.to_string()), r.inputs, r.outputs))
        .collect())
}

/// Load a dataset file (see [`parse_examples`]).
///
/// Errors carry the file path and, for JSON Lines, the offending line.
pub fn load_examples(path: impl AsRef<Path>) -> Result<Vec<Example>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read dataset from {}", path.display()))?;
    parse_examples(&text).with_context(|| format!("Invalid dataset {}", path.display()))
}
