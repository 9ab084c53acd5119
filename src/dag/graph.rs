//! NodeGraph - adjacency structure built from a generated DAG's edges
//!
//! Performance idioms:
//! - Arc<str> for zero-cost cloning of node IDs
//! - FxHashMap for faster hashing (non-crypto)
//! - SmallVec for stack-allocated small neighbor lists (0-4 items)
//!
//! Cycle detection uses the DFS three-color algorithm.

use std::collections::VecDeque;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::model::GeneratedDag;

/// Stack-allocated neighbors: most nodes have 0-4 edges
pub type EdgeVec = SmallVec<[Arc<str>; 4]>;

/// Graph of node dependencies built from a DAG's edge list
pub struct NodeGraph {
    /// node_id → successor node_ids
    adjacency: FxHashMap<Arc<str>, EdgeVec>,
    /// node_id → predecessor node_ids
    predecessors: FxHashMap<Arc<str>, EdgeVec>,
    /// All node IDs, in DAG declaration order
    node_ids: Vec<Arc<str>>,
    /// Quick lookup for node existence
    node_set: FxHashSet<Arc<str>>,
}

impl NodeGraph {
    /// Build the graph from a generated DAG.
    ///
    /// Edges whose endpoints are unknown node IDs are skipped here; the
    /// structural validator reports them separately.
    pub fn from_dag(dag: &GeneratedDag) -> Self {
        let capacity = dag.nodes.len();
        let mut adjacency: FxHashMap<Arc<str>, EdgeVec> =
            FxHashMap::with_capacity_and_hasher(capacity, Default::default());
        let mut predecessors: FxHashMap<Arc<str>, EdgeVec> =
            FxHashMap::with_capacity_and_hasher(capacity, Default::default());
        let mut node_ids: Vec<Arc<str>> = Vec::with_capacity(capacity);
        let mut node_set: FxHashSet<Arc<str>> =
            FxHashSet::with_capacity_and_hasher(capacity, Default::default());

        for node in &dag.nodes {
            let id: Arc<str> = Arc::from(node.node_id.as_str());
            if node_set.insert(Arc::clone(&id)) {
                node_ids.push(Arc::clone(&id));
                adjacency.insert(Arc::clone(&id), EdgeVec::new());
                predecessors.insert(id, EdgeVec::new());
            }
        }

        for edge in &dag.edges {
            let (Some(src), Some(tgt)) = (
                node_set.get(edge.source.as_str()).cloned(),
                node_set.get(edge.target.as_str()).cloned(),
            ) else {
                continue;
            };
            adjacency
                .entry(Arc::clone(&src))
                .or_default()
                .push(Arc::clone(&tgt));
            predecessors.entry(tgt).or_default().push(src);
        }

        Self {
            adjacency,
            predecessors,
            node_ids,
            node_set,
        }
    }

    #[inline]
    pub fn contains(&self, node_id: &str) -> bool {
        self.node_set.contains(node_id)
    }

    /// Predecessors of a node
    #[inline]
    pub fn dependencies(&self, node_id: &str) -> &[Arc<str>] {
        static EMPTY: &[Arc<str>] = &[];
        self.predecessors
            .get(node_id)
            .map_or(EMPTY, SmallVec::as_slice)
    }

    /// Successors of a node
    #[inline]
    pub fn successors(&self, node_id: &str) -> &[Arc<str>] {
        static EMPTY: &[Arc<str>] = &[];
        self.adjacency
            .get(node_id)
            .map_or(EMPTY, SmallVec::as_slice)
    }

    /// Nodes with no incoming edges
    pub fn roots(&self) -> Vec<Arc<str>> {
        self.node_ids
            .iter()
            .filter(|id| {
                self.predecessors
                    .get(id.as_ref())
                    .is_none_or(SmallVec::is_empty)
            })
            .cloned()
            .collect()
    }

    /// Check if there's a path from `from` to `to` (BFS over successors)
    pub fn has_path(&self, from: &str, to: &str) -> bool {
        if from == to {
            return self.contains(from);
        }

        let mut visited: FxHashSet<&str> = FxHashSet::default();
        let mut queue: VecDeque<&str> = VecDeque::new();

        queue.push_back(from);
        visited.insert(from);

        while let Some(current) = queue.pop_front() {
            if let Some(neighbors) = self.adjacency.get(current) {
                for neighbor in neighbors {
                    if neighbor.as_ref() == to {
                        return true;
                    }
                    if visited.insert(neighbor.as_ref()) {
                        queue.push_back(neighbor.as_ref());
                    }
                }
            }
        }

        false
    }

    /// The node plus everything upstream of it (BFS over predecessors)
    pub fn ancestors_of(&self, node_id: &str) -> FxHashSet<Arc<str>> {
        let mut seen: FxHashSet<Arc<str>> = FxHashSet::default();
        let Some(start) = self.node_set.get(node_id) else {
            return seen;
        };
        let mut queue: VecDeque<Arc<str>> = VecDeque::new();
        queue.push_back(Arc::clone(start));
        seen.insert(Arc::clone(start));

        while let Some(current) = queue.pop_front() {
            for pred in self.dependencies(&current) {
                if seen.insert(Arc::clone(pred)) {
                    queue.push_back(Arc::clone(pred));
                }
            }
        }
        seen
    }

    /// Detect cycles using DFS with three-color marking.
    ///
    /// Returns `Ok(())` if acyclic, `Err(cycle path)` if a cycle is found.
    ///
    /// - White: unvisited
    /// - Gray: currently in DFS stack (visiting)
    /// - Black: fully processed
    ///
    /// A cycle exists when traversal reaches a Gray node.
    pub fn detect_cycles(&self) -> Result<(), String> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut colors: FxHashMap<Arc<str>, Color> = self
            .node_ids
            .iter()
            .map(|id| (Arc::clone(id), Color::White))
            .collect();
        let mut stack: Vec<Arc<str>> = Vec::new();

        fn dfs(
            node: Arc<str>,
            adjacency: &FxHashMap<Arc<str>, EdgeVec>,
            colors: &mut FxHashMap<Arc<str>, Color>,
            stack: &mut Vec<Arc<str>>,
        ) -> Result<(), String> {
            colors.insert(Arc::clone(&node), Color::Gray);
            stack.push(Arc::clone(&node));

            if let Some(neighbors) = adjacency.get(&node) {
                for neighbor in neighbors {
                    match colors.get(neighbor) {
                        Some(Color::Gray) => {
                            let cycle_start = stack
                                .iter()
                                .position(|x| x.as_ref() == neighbor.as_ref())
                                .unwrap_or(0);
                            let cycle: Vec<&str> =
                                stack[cycle_start..].iter().map(|s| s.as_ref()).collect();
                            return Err(format!("{} → {}", cycle.join(" → "), neighbor));
                        }
                        Some(Color::White) | None => {
                            dfs(Arc::clone(neighbor), adjacency, colors, stack)?;
                        }
                        Some(Color::Black) => {}
                    }
                }
            }

            stack.pop();
            colors.insert(node, Color::Black);
            Ok(())
        }

        for node_id in &self.node_ids {
            if colors.get(node_id) == Some(&Color::White) {
                dfs(Arc::clone(node_id), &self.adjacency, &mut colors, &mut stack)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DagEdge, DagNode, GeneratedDag};
    use std::collections::BTreeMap;

    fn node(id: &str, layer: u32) -> DagNode {
        DagNode {
            node_id: id.into(),
            operation: String::new(),
            function_name: "f".into(),
            inputs: BTreeMap::new(),
            expected_output_type: String::new(),
            layer,
            code: "def f():\n    return 1".into(),
        }
    }

    fn edge(s: &str, t: &str) -> DagEdge {
        DagEdge {
            source: s.into(),
            target: t.into(),
        }
    }

    fn dag(nodes: Vec<DagNode>, edges: Vec<DagEdge>, final_node: &str) -> GeneratedDag {
        GeneratedDag {
            question_id: "q_01".into(),
            description: String::new(),
            nodes,
            edges,
            final_answer_node: final_node.into(),
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // CYCLE DETECTION
    // ═══════════════════════════════════════════════════════════════

    #[test]
    fn test_detect_cycle_simple() {
        // a → b → a
        let d = dag(
            vec![node("a", 0), node("b", 1)],
            vec![edge("a", "b"), edge("b", "a")],
            "b",
        );
        let graph = NodeGraph::from_dag(&d);
        let err = graph.detect_cycles().unwrap_err();
        assert!(err.contains("→"));
    }

    #[test]
    fn test_no_cycle_linear() {
        let d = dag(
            vec![node("a", 0), node("b", 1), node("c", 2)],
            vec![edge("a", "b"), edge("b", "c")],
            "c",
        );
        let graph = NodeGraph::from_dag(&d);
        assert!(graph.detect_cycles().is_ok());
    }

    #[test]
    fn test_self_loop_is_cycle() {
        let d = dag(vec![node("a", 0)], vec![edge("a", "a")], "a");
        let graph = NodeGraph::from_dag(&d);
        assert!(graph.detect_cycles().is_err());
    }

    #[test]
    fn test_diamond_no_cycle() {
        let d = dag(
            vec![node("a", 0), node("b", 1), node("c", 1), node("d", 2)],
            vec![edge("a", "b"), edge("a", "c"), edge("b", "d"), edge("c", "d")],
            "d",
        );
        let graph = NodeGraph::from_dag(&d);
        assert!(graph.detect_cycles().is_ok());
        assert!(graph.has_path("a", "d"));
        assert!(graph.has_path("b", "d"));
        assert!(!graph.has_path("b", "c"));
        assert_eq!(graph.roots().len(), 1);
    }

    // ═══════════════════════════════════════════════════════════════
    // ANCESTORS / ROOTS
    // ═══════════════════════════════════════════════════════════════

    #[test]
    fn test_ancestors_of_final_node() {
        let d = dag(
            vec![node("a", 0), node("b", 0), node("c", 1), node("orphan", 0)],
            vec![edge("a", "c"), edge("b", "c")],
            "c",
        );
        let graph = NodeGraph::from_dag(&d);
        let ancestors = graph.ancestors_of("c");
        assert_eq!(ancestors.len(), 3);
        assert!(!ancestors.contains("orphan"));
    }

    #[test]
    fn test_roots_excludes_targets() {
        let d = dag(
            vec![node("a", 0), node("b", 1)],
            vec![edge("a", "b")],
            "b",
        );
        let graph = NodeGraph::from_dag(&d);
        let roots = graph.roots();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].as_ref(), "a");
    }

    #[test]
    fn test_unknown_edge_endpoints_are_skipped() {
        // The validator reports these; the graph just ignores them.
        let d = dag(vec![node("a", 0)], vec![edge("a", "ghost")], "a");
        let graph = NodeGraph::from_dag(&d);
        assert!(graph.detect_cycles().is_ok());
        assert!(graph.successors("a").is_empty());
    }
}
