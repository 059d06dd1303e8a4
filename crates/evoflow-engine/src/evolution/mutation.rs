//! Mutation operators.
//!
//! Structural edits (`add_node`, `remove_node`, model swap, tool toggle) are
//! pure functions of the parent graph and an RNG. Prompt rewriting and
//! analyze-and-repair ask the mutation model. Every result goes back
//! through the validator before it can join a population.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use evoflow_core::config::{MutationWeights, NodeCatalog, NodeTemplate};
use evoflow_core::graph::{HandOffType, WorkflowGraph, WorkflowNode, END_NODE};
use evoflow_core::traits::ModelClient;
use evoflow_core::types::{ChatMessage, CompletionRequest};

use crate::fitness::judge::extract_json;
use crate::graph::GraphValidator;
use crate::rate::RateController;

use super::population::Origin;

/// Fallback model when the catalog lists none.
pub const DEFAULT_NODE_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MutationOperator {
    AddNode,
    RemoveNode,
    EditNode,
    AnalyzeAndRepair,
}

impl MutationOperator {
    pub const ALL: [MutationOperator; 4] = [
        Self::AddNode,
        Self::RemoveNode,
        Self::EditNode,
        Self::AnalyzeAndRepair,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AddNode => "add_node",
            Self::RemoveNode => "remove_node",
            Self::EditNode => "edit_node",
            Self::AnalyzeAndRepair => "analyze_and_repair",
        }
    }

    pub fn weight(&self, weights: &MutationWeights) -> f64 {
        match self {
            Self::AddNode => weights.add_node,
            Self::RemoveNode => weights.remove_node,
            Self::EditNode => weights.edit_node,
            Self::AnalyzeAndRepair => weights.analyze_and_repair,
        }
    }

    /// Whether the operator can run without a model call.
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::AddNode | Self::RemoveNode)
    }
}

impl fmt::Display for MutationOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn pick_model(catalog: &NodeCatalog, rng: &mut impl Rng) -> String {
    catalog
        .models
        .choose(rng)
        .cloned()
        .unwrap_or_else(|| DEFAULT_NODE_MODEL.to_string())
}

pub fn pick_role(catalog: &NodeCatalog, rng: &mut impl Rng) -> NodeTemplate {
    catalog.roles.choose(rng).cloned().unwrap_or(NodeTemplate {
        description: String::new(),
        system_prompt: String::new(),
    })
}

/// A node id not used in `graph`, of the form `n{k}`.
pub fn fresh_node_id(graph: &WorkflowGraph) -> String {
    let taken: HashSet<&str> = graph.node_ids().into_iter().collect();
    (1..)
        .map(|k| format!("n{}", k))
        .find(|id| !taken.contains(id.as_str()) && id != END_NODE)
        .unwrap_or_else(|| format!("n{}", graph.nodes.len() + 1))
}

/// Build a node from a random catalog role and model.
pub fn catalog_node(id: String, catalog: &NodeCatalog, rng: &mut impl Rng) -> WorkflowNode {
    let role = pick_role(catalog, rng);
    WorkflowNode::new(id, pick_model(catalog, rng))
        .with_description(role.description)
        .with_prompt(role.system_prompt)
}

/// Rewrite every node's `waitFor` from the current edges: a node with
/// several predecessors waits for all of them, others wait for nothing.
pub fn sync_wait_for(graph: &mut WorkflowGraph) {
    let preds: Vec<Vec<String>> = graph
        .nodes
        .iter()
        .map(|n| {
            graph
                .predecessors_of(&n.node_id)
                .into_iter()
                .map(String::from)
                .collect()
        })
        .collect();
    for (node, preds) in graph.nodes.iter_mut().zip(preds) {
        node.wait_for = (preds.len() > 1).then_some(preds);
    }
}

/// Insert a catalog node on a random edge `P -> T`, giving `P -> N -> T`.
pub fn add_node(
    parent: &WorkflowGraph,
    catalog: &NodeCatalog,
    rng: &mut impl Rng,
) -> Option<WorkflowGraph> {
    let edges: Vec<(usize, usize)> = parent
        .nodes
        .iter()
        .enumerate()
        .flat_map(|(i, n)| (0..n.hand_offs.len()).map(move |j| (i, j)))
        .collect();
    let &(pi, ti) = edges.choose(rng)?;

    let mut graph = parent.clone();
    let id = fresh_node_id(&graph);
    let target = graph.nodes[pi].hand_offs[ti].clone();
    let node = catalog_node(id.clone(), catalog, rng).with_hand_offs([target]);
    graph.nodes[pi].hand_offs[ti] = id;
    graph.nodes.push(node);
    sync_wait_for(&mut graph);
    Some(graph)
}

/// Remove a random non-entry node, splicing its successors into each of
/// its predecessors at the position it occupied.
pub fn remove_node(parent: &WorkflowGraph, rng: &mut impl Rng) -> Option<WorkflowGraph> {
    let removable: Vec<&str> = parent
        .nodes
        .iter()
        .map(|n| n.node_id.as_str())
        .filter(|id| *id != parent.entry_node_id)
        .collect();
    let victim = removable.choose(rng)?.to_string();
    let successors = parent.node(&victim)?.hand_offs.clone();

    let mut graph = parent.clone();
    graph.nodes.retain(|n| n.node_id != victim);
    for node in &mut graph.nodes {
        let Some(pos) = node.hand_offs.iter().position(|h| *h == victim) else {
            continue;
        };
        node.hand_offs.remove(pos);
        let mut insert_at = pos;
        for s in &successors {
            if !node.hand_offs.contains(s) {
                node.hand_offs.insert(insert_at, s.clone());
                insert_at += 1;
            }
        }
        // A parallel fan-out cannot include the sink; keep the other branches.
        if node.hand_off_type == Some(HandOffType::Parallel) && node.hand_offs.len() > 1 {
            node.hand_offs.retain(|h| h != END_NODE);
        }
        if node.hand_offs.len() < 2 {
            node.hand_off_type = None;
        }
    }
    sync_wait_for(&mut graph);
    Some(graph)
}

/// Give a random node a different catalog model.
pub fn swap_model(
    parent: &WorkflowGraph,
    catalog: &NodeCatalog,
    rng: &mut impl Rng,
) -> Option<WorkflowGraph> {
    let idx = (0..parent.nodes.len()).choose(rng)?;
    let current = &parent.nodes[idx].model_name;
    let model = catalog.models.iter().filter(|m| *m != current).choose(rng)?;
    let mut graph = parent.clone();
    graph.nodes[idx].model_name = model.clone();
    Some(graph)
}

/// Add or remove one catalog tool on a random node.
pub fn toggle_tool(
    parent: &WorkflowGraph,
    catalog: &NodeCatalog,
    rng: &mut impl Rng,
) -> Option<WorkflowGraph> {
    let tools: Vec<(bool, &String)> = catalog
        .code_tools
        .iter()
        .map(|t| (false, t))
        .chain(catalog.mcp_tools.iter().map(|t| (true, t)))
        .collect();
    let &(mcp, tool) = tools.choose(rng)?;
    let idx = (0..parent.nodes.len()).choose(rng)?;

    let mut graph = parent.clone();
    let node = &mut graph.nodes[idx];
    let list = if mcp {
        &mut node.mcp_tools
    } else {
        &mut node.code_tools
    };
    match list.iter().position(|t| t == tool) {
        Some(pos) => {
            list.remove(pos);
        }
        None => list.push(tool.clone()),
    }
    Some(graph)
}

const REWRITE_SYSTEM_PROMPT: &str =
    "You improve system prompts for nodes in multi-step AI agent workflows.";

const REPAIR_SYSTEM_PROMPT: &str =
    "You redesign AI agent workflows that are described as JSON graphs.";

fn rewrite_prompt_request(node: &WorkflowNode, graph: &WorkflowGraph, feedback: &str, model: &str) -> CompletionRequest {
    let role = if node.description.is_empty() {
        "(no description)"
    } else {
        node.description.as_str()
    };
    let user = format!(
        "Workflow nodes: {}\n\nNode `{}`: {}\n\nCurrent system prompt:\n{}\n\nRecent performance:\n{}\n\n\
         Write an improved system prompt for this node. Respond with ONLY the new prompt text.",
        graph.node_ids().join(", "),
        node.node_id,
        role,
        node.system_prompt,
        feedback
    );
    CompletionRequest::text(
        model,
        vec![ChatMessage::system(REWRITE_SYSTEM_PROMPT), ChatMessage::user(user)],
    )
}

fn repair_request(graph_json: &str, feedback: &str, catalog: &NodeCatalog, model: &str) -> CompletionRequest {
    let user = format!(
        r#"Current workflow graph:
{}

Performance of this workflow:
{}

Available models: {}
Available tools: {}

Analyze where the workflow loses accuracy, time or money and return an improved graph.
Rules: node ids are unique and never "end"; every node is reachable from entryNodeId;
handOffs name other nodes or "end"; no cycles; a parallel node never hands off to "end";
a node with several predecessors lists all of them in waitFor.

Respond with ONLY the improved graph as JSON in the same format."#,
        graph_json,
        feedback,
        catalog.models.join(", "),
        catalog
            .code_tools
            .iter()
            .chain(catalog.mcp_tools.iter())
            .cloned()
            .collect::<Vec<_>>()
            .join(", "),
    );
    CompletionRequest::text(
        model,
        vec![ChatMessage::system(REPAIR_SYSTEM_PROMPT), ChatMessage::user(user)],
    )
}

/// Result of one mutation: a valid child graph, or a copy of the parent
/// when every attempt was rejected.
#[derive(Debug, Clone)]
pub struct MutationOutcome {
    pub graph: WorkflowGraph,
    pub origin: Origin,
    /// Operator of the last attempt.
    pub operator: MutationOperator,
    pub attempts: u32,
    /// Model spend across all attempts.
    pub cost_usd: f64,
    /// Why the last attempt failed, when the child is a parent copy.
    pub rejection: Option<String>,
}

/// Applies weighted mutation operators with a bounded retry budget.
pub struct Mutator {
    model: Arc<dyn ModelClient>,
    rate: RateController,
    validator: GraphValidator,
    catalog: NodeCatalog,
    weights: MutationWeights,
    attempts: u32,
    mutation_model: String,
}

impl Mutator {
    pub fn new(
        model: Arc<dyn ModelClient>,
        rate: RateController,
        validator: GraphValidator,
        catalog: NodeCatalog,
        weights: MutationWeights,
        attempts: u32,
        mutation_model: impl Into<String>,
    ) -> Self {
        Self {
            model,
            rate,
            validator,
            catalog,
            weights,
            attempts: attempts.max(1),
            mutation_model: mutation_model.into(),
        }
    }

    pub fn catalog(&self) -> &NodeCatalog {
        &self.catalog
    }

    pub fn pick_operator(&self, rng: &mut impl Rng) -> MutationOperator {
        let weights: Vec<f64> = MutationOperator::ALL
            .iter()
            .map(|op| op.weight(&self.weights).max(0.0))
            .collect();
        match WeightedIndex::new(&weights) {
            Ok(dist) => MutationOperator::ALL[dist.sample(rng)],
            Err(_) => MutationOperator::EditNode,
        }
    }

    /// Mutate `parent`, retrying invalid results up to the attempt budget.
    pub async fn mutate(
        &self,
        parent: &WorkflowGraph,
        feedback: &str,
        rng: &mut StdRng,
    ) -> MutationOutcome {
        let mut cost_usd = 0.0;
        let mut operator = MutationOperator::EditNode;
        let mut rejection = String::new();

        for attempt in 1..=self.attempts {
            operator = self.pick_operator(rng);
            let (result, cost) = self.apply(operator, parent, feedback, rng).await;
            cost_usd += cost;

            let graph = match result {
                Ok(g) => g,
                Err(reason) => {
                    debug!(operator = %operator, attempt, reason = %reason, "Mutation attempt failed");
                    rejection = reason;
                    continue;
                }
            };
            if graph == *parent {
                rejection = "mutation left the graph unchanged".to_string();
                continue;
            }
            match self.validator.validate(&graph) {
                Ok(_) => {
                    return MutationOutcome {
                        graph,
                        origin: Origin::Mutation { operator },
                        operator,
                        attempts: attempt,
                        cost_usd,
                        rejection: None,
                    }
                }
                Err(e) => {
                    debug!(operator = %operator, attempt, error = %e, "Mutated graph rejected");
                    rejection = e.to_string();
                }
            }
        }

        warn!(
            operator = %operator,
            attempts = self.attempts,
            reason = %rejection,
            "Mutation budget exhausted, copying parent"
        );
        MutationOutcome {
            graph: parent.clone(),
            origin: Origin::ParentCopy,
            operator,
            attempts: self.attempts,
            cost_usd,
            rejection: Some(rejection),
        }
    }

    async fn apply(
        &self,
        operator: MutationOperator,
        parent: &WorkflowGraph,
        feedback: &str,
        rng: &mut StdRng,
    ) -> (Result<WorkflowGraph, String>, f64) {
        match operator {
            MutationOperator::AddNode => (
                add_node(parent, &self.catalog, rng).ok_or_else(|| "graph has no edges".to_string()),
                0.0,
            ),
            MutationOperator::RemoveNode => (
                remove_node(parent, rng).ok_or_else(|| "no removable node".to_string()),
                0.0,
            ),
            MutationOperator::EditNode => self.edit_node(parent, feedback, rng).await,
            MutationOperator::AnalyzeAndRepair => self.analyze_and_repair(parent, feedback).await,
        }
    }

    /// Rewrite a node's prompt, or swap its model, or toggle one tool.
    async fn edit_node(
        &self,
        parent: &WorkflowGraph,
        feedback: &str,
        rng: &mut StdRng,
    ) -> (Result<WorkflowGraph, String>, f64) {
        match rng.gen_range(0..3) {
            1 => {
                if let Some(g) = swap_model(parent, &self.catalog, rng) {
                    return (Ok(g), 0.0);
                }
            }
            2 => {
                if let Some(g) = toggle_tool(parent, &self.catalog, rng) {
                    return (Ok(g), 0.0);
                }
            }
            _ => {}
        }

        let Some(idx) = (0..parent.nodes.len()).choose(rng) else {
            return (Err("graph has no nodes".to_string()), 0.0);
        };
        let request = rewrite_prompt_request(&parent.nodes[idx], parent, feedback, &self.mutation_model);
        let response = match self.rate.complete(self.model.as_ref(), request).await {
            Ok(r) => r,
            Err(e) => return (Err(e.to_string()), 0.0),
        };
        let cost = response.usd_cost;
        let prompt = match response.into_result() {
            Ok(data) => data.as_text().trim().to_string(),
            Err(e) => return (Err(e), cost),
        };
        if prompt.is_empty() {
            return (Err("model returned an empty prompt".to_string()), cost);
        }
        let mut graph = parent.clone();
        graph.nodes[idx].system_prompt = prompt;
        (Ok(graph), cost)
    }

    async fn analyze_and_repair(
        &self,
        parent: &WorkflowGraph,
        feedback: &str,
    ) -> (Result<WorkflowGraph, String>, f64) {
        let graph_json = match parent.to_json_pretty() {
            Ok(j) => j,
            Err(e) => return (Err(e.to_string()), 0.0),
        };
        let request = repair_request(&graph_json, feedback, &self.catalog, &self.mutation_model);
        let response = match self.rate.complete(self.model.as_ref(), request).await {
            Ok(r) => r,
            Err(e) => return (Err(e.to_string()), 0.0),
        };
        let cost = response.usd_cost;
        let text = match response.into_result() {
            Ok(data) => data.as_text(),
            Err(e) => return (Err(e), cost),
        };
        let parsed = WorkflowGraph::from_json(extract_json(&text))
            .map_err(|e| format!("repaired graph did not parse: {}", e));
        (parsed, cost)
    }
}
