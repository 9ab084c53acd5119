//! Reference expressions
//!
//! A node input is exactly one of:
//! - `dataset.<key>` — a value from the bundle; dots after the first key
//!   traverse nested objects and array indices
//! - `prev_node.<node_id>.output` — the output of an upstream node
//!
//! Anything else is a structural error.

use serde_json::Value;

use crate::dataset::{json_type_name, Dataset};

/// A parsed input reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputRef {
    /// Dotted path into the bundle; first segment is the top-level key
    Dataset(String),
    /// Upstream node whose output feeds this parameter
    NodeOutput(String),
}

impl InputRef {
    /// Parse a reference expression; the error string is critic-ready.
    pub fn parse(raw: &str) -> Result<Self, String> {
        if let Some(path) = raw.strip_prefix("dataset.") {
            if path.is_empty() {
                return Err(format!("malformed reference '{raw}': missing dataset key"));
            }
            return Ok(Self::Dataset(path.to_string()));
        }
        if let Some(rest) = raw.strip_prefix("prev_node.") {
            let mut parts = rest.splitn(2, '.');
            let node_id = parts.next().unwrap_or_default();
            let tail = parts.next();
            if node_id.is_empty() || tail != Some("output") {
                return Err(format!(
                    "malformed reference '{raw}' (expected 'prev_node.<node_id>.output')"
                ));
            }
            return Ok(Self::NodeOutput(node_id.to_string()));
        }
        Err(format!(
            "invalid reference '{raw}': must be 'dataset.<key>' or 'prev_node.<node_id>.output'"
        ))
    }

    /// The bundle key this reference reads, if it is a dataset reference
    pub fn dataset_key(&self) -> Option<&str> {
        match self {
            Self::Dataset(path) => Some(path.split('.').next().unwrap_or(path)),
            Self::NodeOutput(_) => None,
        }
    }

    /// Resolve against the dataset and previously computed node outputs.
    pub fn resolve(
        &self,
        dataset: &Dataset,
        node_outputs: &impl NodeOutputLookup,
    ) -> Result<Value, String> {
        match self {
            Self::Dataset(path) => resolve_dataset_path(dataset, path),
            Self::NodeOutput(node_id) => node_outputs
                .output_of(node_id)
                .ok_or_else(|| format!("output of node '{node_id}' not available")),
        }
    }
}

/// Lookup abstraction so the executor can hand over whatever map it keeps
pub trait NodeOutputLookup {
    fn output_of(&self, node_id: &str) -> Option<Value>;
}

impl NodeOutputLookup for std::collections::BTreeMap<String, Value> {
    fn output_of(&self, node_id: &str) -> Option<Value> {
        self.get(node_id).cloned()
    }
}

/// Walk a dotted path into the bundle: object keys and array indices.
fn resolve_dataset_path(dataset: &Dataset, path: &str) -> Result<Value, String> {
    let mut segments = path.split('.');
    let first = segments.next().expect("split yields at least one segment");

    let mut current = dataset
        .get(first)
        .ok_or_else(|| format!("dataset key '{first}' not found"))?;

    for segment in segments {
        current = match current {
            Value::Object(map) => map
                .get(segment)
                .ok_or_else(|| format!("key '{segment}' not found under 'dataset.{path}'"))?,
            Value::Array(items) => {
                let idx: usize = segment.parse().map_err(|_| {
                    format!("'{segment}' is not a valid index into a list in 'dataset.{path}'")
                })?;
                items.get(idx).ok_or_else(|| {
                    format!("index {idx} out of bounds in 'dataset.{path}'")
                })?
            }
            other => {
                return Err(format!(
                    "cannot access '{segment}' on {} in 'dataset.{path}'",
                    json_type_name(other)
                ))
            }
        };
    }

    Ok(current.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn dataset() -> Dataset {
        json!({
            "total": 42,
            "category_stats": {"grocery": {"count": 10}},
            "top_merchants": [{"merchant": "acme"}]
        })
        .as_object()
        .unwrap()
        .clone()
    }

    // ═══════════════════════════════════════════════════════════════
    // Parsing
    // ═══════════════════════════════════════════════════════════════

    #[test]
    fn parses_dataset_reference() {
        assert_eq!(
            InputRef::parse("dataset.total").unwrap(),
            InputRef::Dataset("total".into())
        );
    }

    #[test]
    fn parses_prev_node_reference() {
        assert_eq!(
            InputRef::parse("prev_node.step_1a.output").unwrap(),
            InputRef::NodeOutput("step_1a".into())
        );
    }

    #[test]
    fn rejects_other_shapes() {
        assert!(InputRef::parse("42").is_err());
        assert!(InputRef::parse("total").is_err());
        assert!(InputRef::parse("prev_node.step_1a").is_err());
        assert!(InputRef::parse("prev_node..output").is_err());
        assert!(InputRef::parse("dataset.").is_err());
    }

    #[test]
    fn dataset_key_is_first_segment() {
        let r = InputRef::parse("dataset.category_stats.grocery.count").unwrap();
        assert_eq!(r.dataset_key(), Some("category_stats"));
    }

    // ═══════════════════════════════════════════════════════════════
    // Resolution
    // ═══════════════════════════════════════════════════════════════

    #[test]
    fn resolves_top_level_key() {
        let outputs = BTreeMap::new();
        let v = InputRef::parse("dataset.total")
            .unwrap()
            .resolve(&dataset(), &outputs)
            .unwrap();
        assert_eq!(v, json!(42));
    }

    #[test]
    fn resolves_nested_path_with_index() {
        let outputs = BTreeMap::new();
        let v = InputRef::parse("dataset.top_merchants.0.merchant")
            .unwrap()
            .resolve(&dataset(), &outputs)
            .unwrap();
        assert_eq!(v, json!("acme"));
    }

    #[test]
    fn missing_dataset_key_errors() {
        let outputs = BTreeMap::new();
        let err = InputRef::parse("dataset.nope")
            .unwrap()
            .resolve(&dataset(), &outputs)
            .unwrap_err();
        assert!(err.contains("nope"));
    }

    #[test]
    fn resolves_node_output() {
        let mut outputs = BTreeMap::new();
        outputs.insert("step_1a".to_string(), json!([1, 2]));
        let v = InputRef::parse("prev_node.step_1a.output")
            .unwrap()
            .resolve(&dataset(), &outputs)
            .unwrap();
        assert_eq!(v, json!([1, 2]));
    }

    #[test]
    fn missing_node_output_errors() {
        let outputs = BTreeMap::new();
        let err = InputRef::parse("prev_node.ghost.output")
            .unwrap()
            .resolve(&dataset(), &outputs)
            .unwrap_err();
        assert!(err.contains("ghost"));
    }
}
