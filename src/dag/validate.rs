//! Structural validation - deterministic checks over DAG shape and code
//!
//! Each validator returns a (possibly empty) list of error strings; the
//! critic concatenates them into feedback. A DAG is *critically broken*
//! (skip semantic review entirely) if any of: empty node list, cycle,
//! missing `final_answer_node`, or a node whose code fails to parse.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::dataset::Dataset;
use crate::model::GeneratedDag;
use crate::sandbox;

use super::graph::NodeGraph;
use super::refs::InputRef;

/// Outcome of the full structural suite
#[derive(Debug, Clone, Default)]
pub struct StructuralReport {
    pub errors: Vec<String>,
    /// True when the DAG is too broken for layer-by-layer semantic review
    pub critical: bool,
}

impl StructuralReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Cheap critical-brokenness probe used before building feedback
pub fn is_critically_broken(dag: &GeneratedDag) -> bool {
    if dag.nodes.is_empty() || dag.final_answer_node.is_empty() {
        return true;
    }
    if dag.node(&dag.final_answer_node).is_none() {
        return true;
    }
    if NodeGraph::from_dag(dag).detect_cycles().is_err() {
        return true;
    }
    dag.nodes
        .iter()
        .any(|n| sandbox::check_function(&n.code, &n.function_name).is_err())
}

/// Run the full structural validator suite.
///
/// `dataset` is needed to verify that every `dataset.<key>` reference
/// resolves to a real bundle key.
pub fn run_all_structural_validations(dag: &GeneratedDag, dataset: &Dataset) -> StructuralReport {
    let mut report = StructuralReport::default();

    if dag.nodes.is_empty() {
        report.errors.push("DAG has no nodes".to_string());
        report.critical = true;
        return report;
    }

    if dag.final_answer_node.is_empty() {
        report
            .errors
            .push("DAG has no final_answer_node specified".to_string());
        report.critical = true;
    } else if dag.node(&dag.final_answer_node).is_none() {
        report.errors.push(format!(
            "final_answer_node '{}' does not exist in the DAG",
            dag.final_answer_node
        ));
        report.critical = true;
    }

    report.errors.extend(validate_node_ids_unique(dag));
    report.errors.extend(validate_edge_endpoints(dag));

    let graph = NodeGraph::from_dag(dag);

    if let Err(cycle) = graph.detect_cycles() {
        report
            .errors
            .push(format!("DAG contains a cycle: {cycle}"));
        report.critical = true;
    }

    report.errors.extend(validate_layer_monotonicity(dag));
    if !report.critical {
        report.errors.extend(validate_connectivity(dag, &graph));
    }
    report
        .errors
        .extend(validate_input_references(dag, dataset, &graph));

    for node in &dag.nodes {
        match sandbox::check_function(&node.code, &node.function_name) {
            Ok(()) => {
                for issue in sandbox::scan_code(&node.code) {
                    report
                        .errors
                        .push(format!("Node '{}': {}", node.node_id, issue));
                }
            }
            Err(e) => {
                report
                    .errors
                    .push(format!("Node '{}': {}", node.node_id, e));
                report.critical = true;
            }
        }
    }

    report
}

/// Node IDs must be unique within the DAG
fn validate_node_ids_unique(dag: &GeneratedDag) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen: FxHashSet<&str> = FxHashSet::default();
    for node in &dag.nodes {
        if !seen.insert(node.node_id.as_str()) {
            errors.push(format!("Duplicate node_id '{}'", node.node_id));
        }
    }
    errors
}

/// All edge endpoints must name existing nodes
fn validate_edge_endpoints(dag: &GeneratedDag) -> Vec<String> {
    let node_ids: FxHashSet<&str> = dag.nodes.iter().map(|n| n.node_id.as_str()).collect();
    let mut errors = Vec::new();
    for edge in &dag.edges {
        if !node_ids.contains(edge.source.as_str()) {
            errors.push(format!("Edge source '{}' does not exist", edge.source));
        }
        if !node_ids.contains(edge.target.as_str()) {
            errors.push(format!("Edge target '{}' does not exist", edge.target));
        }
    }
    errors
}

/// For every edge u → v: u.layer < v.layer
fn validate_layer_monotonicity(dag: &GeneratedDag) -> Vec<String> {
    let layer_of: FxHashMap<&str, u32> = dag
        .nodes
        .iter()
        .map(|n| (n.node_id.as_str(), n.layer))
        .collect();

    let mut errors = Vec::new();
    for edge in &dag.edges {
        let (Some(&src_layer), Some(&tgt_layer)) = (
            layer_of.get(edge.source.as_str()),
            layer_of.get(edge.target.as_str()),
        ) else {
            continue; // reported by validate_edge_endpoints
        };
        if src_layer >= tgt_layer {
            errors.push(format!(
                "Node '{}' (layer {}) depends on '{}' (layer {}): dependency must be in an earlier layer",
                edge.target, tgt_layer, edge.source, src_layer
            ));
        }
    }
    errors
}

/// Final node must exist, be reachable from a root, and every node must
/// contribute to it (no dead nodes).
fn validate_connectivity(dag: &GeneratedDag, graph: &NodeGraph) -> Vec<String> {
    let mut errors = Vec::new();

    if dag.final_answer_node.is_empty() {
        return errors; // already reported as critical
    }
    if dag.node(&dag.final_answer_node).is_none() {
        errors.push(format!(
            "final_answer_node '{}' does not exist in the DAG",
            dag.final_answer_node
        ));
        return errors;
    }

    let roots = graph.roots();
    if roots.is_empty() {
        errors.push("No root nodes found (all nodes have incoming edges)".to_string());
        return errors;
    }

    let reachable = roots
        .iter()
        .any(|root| graph.has_path(root, &dag.final_answer_node));
    if !reachable {
        errors.push(format!(
            "final_answer_node '{}' is not reachable from any root node",
            dag.final_answer_node
        ));
    }

    let contributing = graph.ancestors_of(&dag.final_answer_node);
    let mut orphaned: Vec<&str> = dag
        .nodes
        .iter()
        .map(|n| n.node_id.as_str())
        .filter(|id| !contributing.contains(*id))
        .collect();
    if !orphaned.is_empty() {
        orphaned.sort_unstable();
        errors.push(format!(
            "Orphaned nodes that don't contribute to the final answer: {}",
            orphaned.join(", ")
        ));
    }

    errors
}

/// Every input reference must be well-formed and point at a real entity:
/// a bundle key for `dataset.<key>`, or an existing earlier-layer node
/// connected by an edge for `prev_node.<id>.output`.
fn validate_input_references(
    dag: &GeneratedDag,
    dataset: &Dataset,
    graph: &NodeGraph,
) -> Vec<String> {
    let layer_of: FxHashMap<&str, u32> = dag
        .nodes
        .iter()
        .map(|n| (n.node_id.as_str(), n.layer))
        .collect();

    let mut errors = Vec::new();
    for node in &dag.nodes {
        for (param, raw) in &node.inputs {
            let parsed = match InputRef::parse(raw) {
                Ok(p) => p,
                Err(e) => {
                    errors.push(format!(
                        "Node '{}', input '{}': {}",
                        node.node_id, param, e
                    ));
                    continue;
                }
            };
            match &parsed {
                InputRef::Dataset(_) => {
                    let key = parsed.dataset_key().unwrap_or_default();
                    if !dataset.contains_key(key) {
                        errors.push(format!(
                            "Node '{}', input '{}': dataset key '{}' does not exist in the bundle",
                            node.node_id, param, key
                        ));
                    }
                }
                InputRef::NodeOutput(ref_id) => {
                    let Some(&ref_layer) = layer_of.get(ref_id.as_str()) else {
                        errors.push(format!(
                            "Node '{}', input '{}': references non-existent node '{}'",
                            node.node_id, param, ref_id
                        ));
                        continue;
                    };
                    if ref_layer >= node.layer {
                        errors.push(format!(
                            "Node '{}', input '{}': references '{}' (layer {}) which is not in an earlier layer",
                            node.node_id, param, ref_id, ref_layer
                        ));
                    }
                    let has_edge = graph
                        .dependencies(&node.node_id)
                        .iter()
                        .any(|d| d.as_ref() == ref_id);
                    if !has_edge {
                        errors.push(format!(
                            "Node '{}', input '{}': references '{}' but there is no edge from it",
                            node.node_id, param, ref_id
                        ));
                    }
                }
            }
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DagEdge, DagNode};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn dataset() -> Dataset {
        json!({"total": 42, "rows": [1, 2, 3]})
            .as_object()
            .unwrap()
            .clone()
    }

    fn node(id: &str, layer: u32, inputs: &[(&str, &str)], code: &str) -> DagNode {
        DagNode {
            node_id: id.into(),
            operation: String::new(),
            function_name: "f".into(),
            inputs: inputs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            expected_output_type: String::new(),
            layer,
            code: code.into(),
        }
    }

    fn edge(s: &str, t: &str) -> DagEdge {
        DagEdge {
            source: s.into(),
            target: t.into(),
        }
    }

    const OK_CODE: &str = "def f(x):\n    return x";

    fn one_node_dag() -> GeneratedDag {
        GeneratedDag {
            question_id: "q_01".into(),
            description: String::new(),
            nodes: vec![node("a", 0, &[("x", "dataset.total")], OK_CODE)],
            edges: vec![],
            final_answer_node: "a".into(),
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // BOUNDARY BEHAVIORS
    // ═══════════════════════════════════════════════════════════════

    #[test]
    fn empty_dag_is_critically_broken() {
        let dag = GeneratedDag::empty("q_01", "fallback");
        assert!(is_critically_broken(&dag));
        let report = run_all_structural_validations(&dag, &dataset());
        assert!(report.critical);
        assert!(report.errors.iter().any(|e| e.contains("no nodes")));
    }

    #[test]
    fn one_node_dag_at_layer_zero_is_valid() {
        let dag = one_node_dag();
        assert!(!is_critically_broken(&dag));
        let report = run_all_structural_validations(&dag, &dataset());
        assert!(report.is_clean(), "unexpected errors: {:?}", report.errors);
    }

    #[test]
    fn cycle_is_critical() {
        let dag = GeneratedDag {
            question_id: "q".into(),
            description: String::new(),
            nodes: vec![
                node("a", 0, &[("x", "dataset.total")], OK_CODE),
                node("b", 1, &[("x", "prev_node.a.output")], OK_CODE),
            ],
            edges: vec![edge("a", "b"), edge("b", "a")],
            final_answer_node: "b".into(),
        };
        assert!(is_critically_broken(&dag));
        let report = run_all_structural_validations(&dag, &dataset());
        assert!(report.critical);
        assert!(report.errors.iter().any(|e| e.contains("cycle")));
    }

    #[test]
    fn missing_final_node_is_critical() {
        let mut dag = one_node_dag();
        dag.final_answer_node = "ghost".into();
        assert!(is_critically_broken(&dag));
    }

    #[test]
    fn unparseable_code_is_critical() {
        let mut dag = one_node_dag();
        dag.nodes[0].code = "def f(x:\n    return".into();
        assert!(is_critically_broken(&dag));
        let report = run_all_structural_validations(&dag, &dataset());
        assert!(report.critical);
    }

    // ═══════════════════════════════════════════════════════════════
    // INDIVIDUAL VALIDATORS
    // ═══════════════════════════════════════════════════════════════

    #[test]
    fn duplicate_node_ids_are_reported() {
        let mut dag = one_node_dag();
        dag.nodes.push(node("a", 0, &[("x", "dataset.total")], OK_CODE));
        let report = run_all_structural_validations(&dag, &dataset());
        assert!(report.errors.iter().any(|e| e.contains("Duplicate")));
    }

    #[test]
    fn dangling_edge_endpoints_are_reported() {
        let mut dag = one_node_dag();
        dag.edges.push(edge("a", "ghost"));
        let report = run_all_structural_validations(&dag, &dataset());
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("Edge target 'ghost'")));
    }

    #[test]
    fn layer_monotonicity_violation_is_reported() {
        let dag = GeneratedDag {
            question_id: "q".into(),
            description: String::new(),
            nodes: vec![
                node("a", 1, &[("x", "dataset.total")], OK_CODE),
                node("b", 1, &[("x", "prev_node.a.output")], OK_CODE),
            ],
            edges: vec![edge("a", "b")],
            final_answer_node: "b".into(),
        };
        let report = run_all_structural_validations(&dag, &dataset());
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("earlier layer")));
    }

    #[test]
    fn orphan_nodes_are_reported() {
        let dag = GeneratedDag {
            question_id: "q".into(),
            description: String::new(),
            nodes: vec![
                node("a", 0, &[("x", "dataset.total")], OK_CODE),
                node("stray", 0, &[("x", "dataset.total")], OK_CODE),
            ],
            edges: vec![],
            final_answer_node: "a".into(),
        };
        let report = run_all_structural_validations(&dag, &dataset());
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("Orphaned") && e.contains("stray")));
    }

    #[test]
    fn unknown_dataset_key_is_reported() {
        let dag = GeneratedDag {
            question_id: "q".into(),
            description: String::new(),
            nodes: vec![node("a", 0, &[("x", "dataset.nope")], OK_CODE)],
            edges: vec![],
            final_answer_node: "a".into(),
        };
        let report = run_all_structural_validations(&dag, &dataset());
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("'nope' does not exist")));
    }

    #[test]
    fn literal_input_is_rejected_with_reference_hint() {
        let dag = GeneratedDag {
            question_id: "q".into(),
            description: String::new(),
            nodes: vec![node("a", 0, &[("x", "42")], OK_CODE)],
            edges: vec![],
            final_answer_node: "a".into(),
        };
        let report = run_all_structural_validations(&dag, &dataset());
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("invalid reference '42'")));
    }

    #[test]
    fn prev_node_without_edge_is_reported() {
        let dag = GeneratedDag {
            question_id: "q".into(),
            description: String::new(),
            nodes: vec![
                node("a", 0, &[("x", "dataset.total")], OK_CODE),
                node("b", 1, &[("x", "prev_node.a.output")], OK_CODE),
            ],
            edges: vec![], // reference without a matching edge
            final_answer_node: "b".into(),
        };
        let report = run_all_structural_validations(&dag, &dataset());
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("no edge from it")));
    }

    #[test]
    fn import_in_code_fails_safety_scan() {
        let mut dag = one_node_dag();
        dag.nodes[0].code = "def f(x):\n    import os\n    return 1".into();
        let report = run_all_structural_validations(&dag, &dataset());
        assert!(
            report.errors.iter().any(|e| e.to_lowercase().contains("import")),
            "expected an import violation, got {:?}",
            report.errors
        );
        // Topology is fine, so this is not critical — but it is rejected.
        assert!(!report.is_clean());
    }
}
