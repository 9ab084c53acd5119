//! Layer extraction
//!
//! Nodes are grouped by their declared `layer` field. Both the executor
//! (evaluation order) and the critic (scoping the semantic review) iterate
//! the same grouping, so it lives here and nowhere else.

use crate::model::{DagNode, GeneratedDag};

/// Group DAG nodes by layer, ascending.
///
/// Index `i` of the result holds all nodes declared at layer `i`; interior
/// layers with no nodes are preserved as empty groups so layer indices stay
/// aligned with the declared values.
pub fn extract_layers(dag: &GeneratedDag) -> Vec<Vec<&DagNode>> {
    let Some(max_layer) = dag.nodes.iter().map(|n| n.layer).max() else {
        return Vec::new();
    };

    let mut layers: Vec<Vec<&DagNode>> = vec![Vec::new(); max_layer as usize + 1];
    for node in &dag.nodes {
        layers[node.layer as usize].push(node);
    }
    layers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DagNode;
    use std::collections::BTreeMap;

    fn node(id: &str, layer: u32) -> DagNode {
        DagNode {
            node_id: id.into(),
            operation: String::new(),
            function_name: "f".into(),
            inputs: BTreeMap::new(),
            expected_output_type: String::new(),
            layer,
            code: String::new(),
        }
    }

    fn dag_with(nodes: Vec<DagNode>) -> GeneratedDag {
        GeneratedDag {
            question_id: "q".into(),
            description: String::new(),
            nodes,
            edges: vec![],
            final_answer_node: String::new(),
        }
    }

    #[test]
    fn groups_by_declared_layer() {
        let dag = dag_with(vec![node("a", 0), node("b", 1), node("c", 0)]);
        let layers = extract_layers(&dag);
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].len(), 2);
        assert_eq!(layers[1].len(), 1);
        assert_eq!(layers[1][0].node_id, "b");
    }

    #[test]
    fn empty_dag_has_no_layers() {
        assert!(extract_layers(&dag_with(vec![])).is_empty());
    }

    #[test]
    fn gap_layers_are_preserved_empty() {
        let dag = dag_with(vec![node("a", 0), node("b", 2)]);
        let layers = extract_layers(&dag);
        assert_eq!(layers.len(), 3);
        assert!(layers[1].is_empty());
        assert_eq!(layers[2][0].node_id, "b");
    }
}
