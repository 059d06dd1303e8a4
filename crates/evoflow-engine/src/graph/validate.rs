use std::collections::{BTreeSet, HashMap, HashSet};

use evoflow_core::config::BudgetConfig;
use evoflow_core::graph::{WorkflowGraph, END_NODE};
use evoflow_core::{GraphError, GraphErrorKind};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;

use super::handoff::HandOffPlan;

/// Default cap on real nodes per graph.
pub const DEFAULT_MAX_NODES: usize = 20;

/// Static well-formedness checker for workflow graphs.
///
/// Validation is pure: the same document always yields the same verdict,
/// and re-validating the graph held by a [`ValidatedGraph`] succeeds again.
#[derive(Debug, Clone)]
pub struct GraphValidator {
    max_nodes: usize,
}

impl Default for GraphValidator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_NODES)
    }
}

impl GraphValidator {
    pub fn new(max_nodes: usize) -> Self {
        Self { max_nodes }
    }

    pub fn from_budget(budget: &BudgetConfig) -> Self {
        Self::new(budget.max_nodes)
    }

    pub fn max_nodes(&self) -> usize {
        self.max_nodes
    }

    /// Check a graph and resolve its hand-off plans.
    ///
    /// Checks run in a fixed order so a document with several defects always
    /// reports the same one.
    pub fn validate(&self, graph: &WorkflowGraph) -> Result<ValidatedGraph, GraphError> {
        use GraphErrorKind::*;

        if graph.nodes.is_empty() {
            return Err(GraphError::new(UnknownEntry, "graph has no nodes"));
        }
        if graph.nodes.len() > self.max_nodes {
            return Err(GraphError::new(
                TooManyNodes,
                format!("{} nodes exceeds the cap of {}", graph.nodes.len(), self.max_nodes),
            ));
        }

        let mut seen = HashSet::new();
        for node in &graph.nodes {
            if node.node_id == END_NODE {
                return Err(GraphError::at(
                    ReservedIdUsed,
                    END_NODE,
                    "'end' is the terminal sink and cannot be a node",
                ));
            }
            if !seen.insert(node.node_id.as_str()) {
                return Err(GraphError::at(
                    DuplicateNodeId,
                    &node.node_id,
                    "node id appears more than once",
                ));
            }
        }

        if !seen.contains(graph.entry_node_id.as_str()) {
            return Err(GraphError::at(
                UnknownEntry,
                &graph.entry_node_id,
                "entry node does not exist",
            ));
        }

        for node in &graph.nodes {
            let mut targets = HashSet::new();
            for target in &node.hand_offs {
                if target != END_NODE && !seen.contains(target.as_str()) {
                    return Err(GraphError::at(
                        DanglingHandoff,
                        &node.node_id,
                        format!("hand-off target '{}' does not exist", target),
                    ));
                }
                if !targets.insert(target.as_str()) {
                    return Err(GraphError::at(
                        DanglingHandoff,
                        &node.node_id,
                        format!("hand-off target '{}' is listed twice", target),
                    ));
                }
            }
            for pred in node.wait_for.iter().flatten() {
                if !seen.contains(pred.as_str()) {
                    return Err(GraphError::at(
                        InvalidWaitFor,
                        &node.node_id,
                        format!("waitFor names unknown node '{}'", pred),
                    ));
                }
            }
        }

        let mut plans = HashMap::new();
        for node in &graph.nodes {
            let plan = HandOffPlan::resolve(node);
            if let HandOffPlan::Parallel { targets } = &plan {
                if targets.iter().any(|t| t == END_NODE) {
                    return Err(GraphError::at(
                        ParallelIncludesEnd,
                        &node.node_id,
                        "parallel hand-off cannot include 'end'",
                    ));
                }
            }
            plans.insert(node.node_id.clone(), plan);
        }

        let mut dag: DiGraph<&str, ()> = DiGraph::new();
        let index: HashMap<&str, NodeIndex> = graph
            .nodes
            .iter()
            .map(|n| (n.node_id.as_str(), dag.add_node(n.node_id.as_str())))
            .collect();
        for node in &graph.nodes {
            let from = index[node.node_id.as_str()];
            for target in node.hand_offs.iter().filter(|t| *t != END_NODE) {
                if *target == node.node_id {
                    return Err(GraphError::at(
                        CycleDetected,
                        &node.node_id,
                        "node hands off to itself",
                    ));
                }
                dag.add_edge(from, index[target.as_str()], ());
            }
        }

        let order: Vec<String> = match toposort(&dag, None) {
            Ok(sorted) => sorted.into_iter().map(|i| dag[i].to_string()).collect(),
            Err(cycle) => {
                let at = dag[cycle.node_id()];
                return Err(GraphError::at(
                    CycleDetected,
                    at,
                    "hand-offs form a cycle through this node",
                ));
            }
        };

        let mut reachable = HashSet::new();
        let mut dfs = Dfs::new(&dag, index[graph.entry_node_id.as_str()]);
        while let Some(ix) = dfs.next(&dag) {
            reachable.insert(dag[ix]);
        }
        if let Some(node) = graph
            .nodes
            .iter()
            .find(|n| !reachable.contains(n.node_id.as_str()))
        {
            return Err(GraphError::at(
                UnreachableNode,
                &node.node_id,
                format!("not reachable from entry '{}'", graph.entry_node_id),
            ));
        }

        if let Some(node) = graph.nodes.iter().find(|n| n.hand_offs.is_empty()) {
            return Err(GraphError::at(
                NoTermination,
                &node.node_id,
                "node has no hand-offs, so its path never reaches 'end'",
            ));
        }

        let mut predecessors = HashMap::new();
        for node in &graph.nodes {
            let preds: Vec<String> = graph
                .predecessors_of(&node.node_id)
                .into_iter()
                .map(String::from)
                .collect();

            match &node.wait_for {
                None if preds.len() > 1 => {
                    return Err(GraphError::at(
                        MissingWaitFor,
                        &node.node_id,
                        format!("{} predecessors ({}) but no waitFor", preds.len(), preds.join(", ")),
                    ));
                }
                None => {}
                Some(wait) => {
                    let declared: BTreeSet<&str> = wait.iter().map(String::as_str).collect();
                    if declared.len() != wait.len() {
                        return Err(GraphError::at(
                            InvalidWaitFor,
                            &node.node_id,
                            "waitFor lists a predecessor twice",
                        ));
                    }
                    let actual: BTreeSet<&str> = preds.iter().map(String::as_str).collect();
                    if declared != actual {
                        return Err(GraphError::at(
                            InvalidWaitFor,
                            &node.node_id,
                            format!(
                                "waitFor [{}] does not match predecessors [{}]",
                                wait.join(", "),
                                preds.join(", ")
                            ),
                        ));
                    }
                }
            }
            predecessors.insert(node.node_id.clone(), preds);
        }

        Ok(ValidatedGraph {
            graph: graph.clone(),
            plans,
            predecessors,
            order,
        })
    }
}

/// A graph that passed validation, with hand-off plans resolved.
#[derive(Debug, Clone)]
pub struct ValidatedGraph {
    graph: WorkflowGraph,
    plans: HashMap<String, HandOffPlan>,
    predecessors: HashMap<String, Vec<String>>,
    order: Vec<String>,
}

impl ValidatedGraph {
    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    pub fn into_graph(self) -> WorkflowGraph {
        self.graph
    }

    pub fn entry(&self) -> &str {
        &self.graph.entry_node_id
    }

    pub fn plan(&self, node_id: &str) -> Option<&HandOffPlan> {
        self.plans.get(node_id)
    }

    pub fn predecessors(&self, node_id: &str) -> &[String] {
        self.predecessors
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether the node only runs once all of its predecessors succeed.
    pub fn is_join(&self, node_id: &str) -> bool {
        self.predecessors(node_id).len() > 1
    }

    /// Real successors of a node, in hand-off order.
    pub fn successors(&self, node_id: &str) -> Vec<&str> {
        self.graph
            .node(node_id)
            .map(|n| {
                n.hand_offs
                    .iter()
                    .filter(|h| *h != END_NODE)
                    .map(String::as_str)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Node ids in a topological order.
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.graph.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evoflow_core::graph::{HandOffType, WorkflowNode};
    use evoflow_test_utils::fixtures;

    fn node(id: &str, hand_offs: &[&str]) -> WorkflowNode {
        WorkflowNode::new(id, "m").with_hand_offs(hand_offs.iter().copied())
    }

    fn kind(graph: WorkflowGraph) -> GraphErrorKind {
        GraphValidator::default().validate(&graph).unwrap_err().kind
    }

    #[test]
    fn test_fixtures_are_valid() {
        for json in [
            fixtures::PARALLEL_FANOUT,
            fixtures::JOIN_DIAMOND,
            fixtures::SEQUENTIAL_CHAIN,
            fixtures::CONDITIONAL_ROUTER,
            fixtures::CHOICE_ROUTER,
            fixtures::SINGLE_NODE,
            fixtures::TOOL_NODE,
        ] {
            let graph = fixtures::graph(json);
            GraphValidator::default().validate(&graph).unwrap();
        }
    }

    #[test]
    fn test_revalidation_is_noop() {
        let graph = fixtures::graph(fixtures::JOIN_DIAMOND);
        let validator = GraphValidator::default();
        let first = validator.validate(&graph).unwrap();
        let second = validator.validate(first.graph()).unwrap();
        assert_eq!(first.graph(), second.graph());
        assert_eq!(first.topological_order(), second.topological_order());
        assert_eq!(second.graph(), &graph);
    }

    #[test]
    fn test_join_metadata() {
        let v = GraphValidator::default()
            .validate(&fixtures::graph(fixtures::JOIN_DIAMOND))
            .unwrap();
        assert!(v.is_join("D"));
        assert!(!v.is_join("B"));
        let mut preds = v.predecessors("D").to_vec();
        preds.sort();
        assert_eq!(preds, vec!["B", "C"]);
        assert_eq!(v.topological_order().first().map(String::as_str), Some("A"));
        assert_eq!(v.topological_order().last().map(String::as_str), Some("D"));
    }

    #[test]
    fn test_empty_and_unknown_entry() {
        assert_eq!(kind(WorkflowGraph::new("a", vec![])), GraphErrorKind::UnknownEntry);
        assert_eq!(
            kind(WorkflowGraph::new("x", vec![node("a", &["end"])])),
            GraphErrorKind::UnknownEntry
        );
    }

    #[test]
    fn test_too_many_nodes() {
        let nodes = (0..3).map(|i| node(&format!("n{}", i), &["end"])).collect();
        let err = GraphValidator::new(2)
            .validate(&WorkflowGraph::new("n0", nodes))
            .unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::TooManyNodes);
    }

    #[test]
    fn test_reserved_and_duplicate_ids() {
        assert_eq!(
            kind(WorkflowGraph::new("end", vec![node("end", &["end"])])),
            GraphErrorKind::ReservedIdUsed
        );
        assert_eq!(
            kind(WorkflowGraph::new("a", vec![node("a", &["end"]), node("a", &["end"])])),
            GraphErrorKind::DuplicateNodeId
        );
    }

    #[test]
    fn test_dangling_handoff() {
        let err = GraphValidator::default()
            .validate(&WorkflowGraph::new("a", vec![node("a", &["ghost"])]))
            .unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::DanglingHandoff);
        assert_eq!(err.node_id.as_deref(), Some("a"));

        assert_eq!(
            kind(WorkflowGraph::new("a", vec![node("a", &["b", "b"]), node("b", &["end"])])),
            GraphErrorKind::DanglingHandoff
        );
    }

    #[test]
    fn test_parallel_includes_end() {
        let a = node("a", &["b", "end"]).with_hand_off_type(HandOffType::Parallel);
        assert_eq!(
            kind(WorkflowGraph::new("a", vec![a, node("b", &["end"])])),
            GraphErrorKind::ParallelIncludesEnd
        );
    }

    #[test]
    fn test_cycles() {
        assert_eq!(
            kind(WorkflowGraph::new("a", vec![node("a", &["a", "end"])])),
            GraphErrorKind::CycleDetected
        );
        let graph = WorkflowGraph::new(
            "a",
            vec![
                node("a", &["b"]),
                node("b", &["c"]).with_wait_for(["a", "c"]),
                node("c", &["b", "end"]),
            ],
        );
        assert_eq!(kind(graph), GraphErrorKind::CycleDetected);
    }

    #[test]
    fn test_unreachable_node() {
        let err = GraphValidator::default()
            .validate(&WorkflowGraph::new(
                "a",
                vec![node("a", &["end"]), node("orphan", &["end"])],
            ))
            .unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::UnreachableNode);
        assert_eq!(err.node_id.as_deref(), Some("orphan"));
    }

    #[test]
    fn test_no_termination() {
        assert_eq!(
            kind(WorkflowGraph::new("a", vec![node("a", &["b"]), node("b", &[])])),
            GraphErrorKind::NoTermination
        );
    }

    #[test]
    fn test_missing_and_invalid_wait_for() {
        let fanout = node("a", &["b", "c"]).with_hand_off_type(HandOffType::Parallel);
        let missing = WorkflowGraph::new(
            "a",
            vec![fanout.clone(), node("b", &["d"]), node("c", &["d"]), node("d", &["end"])],
        );
        assert_eq!(kind(missing), GraphErrorKind::MissingWaitFor);

        let partial = WorkflowGraph::new(
            "a",
            vec![
                fanout.clone(),
                node("b", &["d"]),
                node("c", &["d"]),
                node("d", &["end"]).with_wait_for(["b"]),
            ],
        );
        assert_eq!(kind(partial), GraphErrorKind::InvalidWaitFor);

        let not_pointing = WorkflowGraph::new(
            "a",
            vec![
                fanout.clone(),
                node("b", &["d"]),
                node("c", &["end"]),
                node("d", &["end"]).with_wait_for(["b", "c"]),
            ],
        );
        assert_eq!(kind(not_pointing), GraphErrorKind::InvalidWaitFor);

        let duplicate = WorkflowGraph::new(
            "a",
            vec![
                fanout,
                node("b", &["d"]),
                node("c", &["d"]),
                node("d", &["end"]).with_wait_for(["b", "c", "b"]),
            ],
        );
        assert_eq!(kind(duplicate), GraphErrorKind::InvalidWaitFor);

        let unknown = WorkflowGraph::new(
            "a",
            vec![node("a", &["end"]).with_wait_for(["ghost"])],
        );
        assert_eq!(kind(unknown), GraphErrorKind::InvalidWaitFor);
    }

    #[test]
    fn test_three_way_join() {
        let graph = WorkflowGraph::new(
            "a",
            vec![
                node("a", &["b", "c", "d"]).with_hand_off_type(HandOffType::Parallel),
                node("b", &["j"]),
                node("c", &["j"]),
                node("d", &["j"]),
                node("j", &["end"]).with_wait_for(["d", "b", "c"]),
            ],
        );
        let v = GraphValidator::default().validate(&graph).unwrap();
        assert_eq!(v.predecessors("j").len(), 3);
    }

    #[test]
    fn test_accepted_graphs_reach_end_from_every_node() {
        for json in [fixtures::JOIN_DIAMOND, fixtures::CONDITIONAL_ROUTER, fixtures::CHOICE_ROUTER] {
            let v = GraphValidator::default().validate(&fixtures::graph(json)).unwrap();
            // Walk in reverse topological order: a node reaches end if it
            // hands off to end or to a node that does.
            let mut reaches = HashSet::new();
            for id in v.topological_order().iter().rev() {
                let node = v.graph().node(id).unwrap();
                if node.ends() || v.successors(id).iter().any(|s| reaches.contains(*s)) {
                    reaches.insert(id.as_str());
                }
                assert!(
                    v.successors(id).iter().all(|s| reaches.contains(*s)),
                    "every successor of {} must reach end",
                    id
                );
            }
            assert_eq!(reaches.len(), v.len());
        }
    }
}
