//! Dataset bundle and metadata loading
//!
//! The bundle is a JSON object mapping string keys to arbitrary JSON values:
//! typically a representative row sample plus pre-aggregated summaries. The
//! metadata document describes columns, formats, null rates, and sensitivity
//! so prompts can show the model exact field names instead of letting it
//! guess.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::error::{ProbeError, Result};

/// The dataset bundle: string keys → JSON-shaped values
pub type Dataset = Map<String, Value>;

/// Per-column schema description
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ColumnSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub column_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Python-style strptime pattern for date columns, e.g. "%Y-%m-%d"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strptime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nullable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub null_rate: Option<f64>,
    /// e.g. "pii"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensitivity: Option<String>,
    /// Value enumeration where applicable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ColumnSpec {
    pub fn is_pii(&self) -> bool {
        self.sensitivity.as_deref() == Some("pii")
    }
}

/// Dataset metadata document
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub columns: BTreeMap<String, ColumnSpec>,
    /// Bundle key → human-readable description
    #[serde(default)]
    pub dataset_keys: BTreeMap<String, String>,
    /// Caveats the prompts must surface verbatim
    #[serde(default)]
    pub important_notes: Vec<String>,
}

/// Load the dataset bundle from disk and run the ingest gate.
///
/// Rejects a missing file, a non-object top level, and a bundle where every
/// key is empty. This is the only validation that happens before the first
/// LLM call.
pub fn load_dataset(path: &Path) -> Result<Dataset> {
    if !path.exists() {
        return Err(ProbeError::DatasetNotFound {
            path: path.display().to_string(),
        });
    }
    let raw = std::fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&raw)?;
    let dataset = match value {
        Value::Object(map) => map,
        other => {
            return Err(ProbeError::InvalidDataset {
                actual: json_type_name(&other).to_string(),
            })
        }
    };
    validate_dataset(&dataset)?;
    info!(keys = dataset.len(), "dataset ingested");
    Ok(dataset)
}

/// Ingest gate: at least one key must be non-empty
pub fn validate_dataset(dataset: &Dataset) -> Result<()> {
    let has_content = dataset.values().any(|v| match v {
        Value::Null => false,
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::String(s) => !s.is_empty(),
        _ => true,
    });
    if dataset.is_empty() || !has_content {
        return Err(ProbeError::EmptyDataset);
    }
    Ok(())
}

/// Load the metadata document; a missing file is non-fatal (`None`)
pub fn load_metadata(path: &Path) -> Result<Option<Metadata>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    let metadata: Metadata =
        serde_json::from_str(&raw).map_err(|e| ProbeError::InvalidMetadata {
            reason: e.to_string(),
        })?;
    Ok(Some(metadata))
}

/// Depth-limited structural summary of the bundle for prompts.
///
/// Shows keys, container shapes, scalar types, and truncated example values.
/// Never dumps raw rows: lists show only their first element.
pub fn summarize_structure(dataset: &Dataset, max_depth: usize) -> String {
    let mut lines = Vec::new();
    for (key, value) in dataset {
        summarize_value(key, value, "", 0, max_depth, &mut lines);
    }
    lines.join("\n")
}

fn summarize_value(
    key: &str,
    value: &Value,
    prefix: &str,
    depth: usize,
    max_depth: usize,
    lines: &mut Vec<String>,
) {
    if depth >= max_depth {
        lines.push(format!("{prefix}{key}: ... (truncated)"));
        return;
    }
    match value {
        Value::Object(map) => {
            lines.push(format!("{prefix}{key}: (object, {} keys)", map.len()));
            for (k, v) in map.iter().take(24) {
                summarize_value(k, v, &format!("{prefix}  "), depth + 1, max_depth, lines);
            }
            if map.len() > 24 {
                lines.push(format!("{prefix}  ... ({} more keys)", map.len() - 24));
            }
        }
        Value::Array(items) => {
            if items.is_empty() {
                lines.push(format!("{prefix}{key}: (empty list)"));
            } else {
                lines.push(format!(
                    "{prefix}{key}: (list of {} items, showing first)",
                    items.len()
                ));
                summarize_value("[0]", &items[0], &format!("{prefix}  "), depth + 1, max_depth, lines);
            }
        }
        scalar => {
            lines.push(format!(
                "{prefix}{key}: {} = {}",
                json_type_name(scalar),
                truncate(&scalar.to_string(), 80)
            ));
        }
    }
}

pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() > max_len {
        let cut: String = s.chars().take(max_len).collect();
        format!("{cut}...")
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_dataset() -> Dataset {
        json!({
            "total": 42,
            "category_stats": {
                "grocery": {"count": 10, "total_amt": 120.5},
                "travel": {"count": 3, "total_amt": 900.0}
            },
            "transactions": [
                {"amount": 10.0, "category": "grocery"},
                {"amount": 300.0, "category": "travel"}
            ]
        })
        .as_object()
        .unwrap()
        .clone()
    }

    #[test]
    fn ingest_gate_accepts_populated_bundle() {
        assert!(validate_dataset(&sample_dataset()).is_ok());
    }

    #[test]
    fn ingest_gate_rejects_empty_bundle() {
        let empty = Map::new();
        assert!(matches!(
            validate_dataset(&empty),
            Err(ProbeError::EmptyDataset)
        ));
    }

    #[test]
    fn ingest_gate_rejects_bundle_of_empty_values() {
        let dataset = json!({"rows": [], "stats": {}})
            .as_object()
            .unwrap()
            .clone();
        assert!(matches!(
            validate_dataset(&dataset),
            Err(ProbeError::EmptyDataset)
        ));
    }

    #[test]
    fn load_dataset_missing_file_is_validation_error() {
        let err = load_dataset(Path::new("/nonexistent/data.json")).unwrap_err();
        assert_eq!(err.code(), "PROBE-001");
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn load_dataset_rejects_non_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        std::fs::write(&path, "[1, 2, 3]").unwrap();
        let err = load_dataset(&path).unwrap_err();
        assert_eq!(err.code(), "PROBE-003");
    }

    #[test]
    fn load_metadata_missing_file_is_none() {
        let meta = load_metadata(Path::new("/nonexistent/meta.json")).unwrap();
        assert!(meta.is_none());
    }

    #[test]
    fn metadata_parses_recognized_fields() {
        let meta: Metadata = serde_json::from_value(json!({
            "description": "Credit card transactions",
            "domain": "finance",
            "columns": {
                "trans_date": {"type": "string", "strptime": "%Y-%m-%d %H:%M:%S"},
                "cc_num": {"type": "string", "sensitivity": "pii"},
                "category": {"type": "string", "values": ["grocery", "travel"]}
            },
            "dataset_keys": {"category_stats": "per-category aggregates"},
            "important_notes": ["time_series has NO per-category breakdown"]
        }))
        .unwrap();
        assert!(meta.columns["cc_num"].is_pii());
        assert_eq!(
            meta.columns["trans_date"].strptime.as_deref(),
            Some("%Y-%m-%d %H:%M:%S")
        );
        assert_eq!(meta.important_notes.len(), 1);
    }

    #[test]
    fn summary_shows_nested_field_names_without_row_dumps() {
        let summary = summarize_structure(&sample_dataset(), 3);
        assert!(summary.contains("category_stats"));
        assert!(summary.contains("grocery"));
        assert!(summary.contains("list of 2 items, showing first"));
        // Only the first transaction appears, not the second
        assert!(!summary.contains("300"));
    }
}
