//! First-generation construction.

use rand::prelude::*;
use tracing::{debug, warn};

use evoflow_core::config::NodeCatalog;
use evoflow_core::error::Result;
use evoflow_core::graph::{HandOffType, WorkflowGraph, WorkflowNode, END_NODE};

use crate::graph::GraphValidator;

use super::mutation::{add_node, catalog_node, pick_model, remove_node, swap_model, sync_wait_for, toggle_tool};
use super::population::Candidate;

const MAX_SEED_ATTEMPTS: usize = 16;
const TOOL_PROBABILITY: f64 = 0.25;

/// Random graph from the catalog: a chain, or for four or more nodes
/// possibly a fan-out from the entry joined by the last node.
pub fn random_graph(catalog: &NodeCatalog, max_nodes: usize, rng: &mut impl Rng) -> WorkflowGraph {
    let cap = catalog.max_seed_nodes.min(max_nodes).max(1);
    let n = rng.gen_range(1..=cap);
    let ids: Vec<String> = (1..=n).map(|k| format!("n{}", k)).collect();

    let mut nodes: Vec<WorkflowNode> = Vec::with_capacity(n);
    for id in &ids {
        let mut node = catalog_node(id.clone(), catalog, rng);
        if !catalog.code_tools.is_empty() && rng.gen_bool(TOOL_PROBABILITY) {
            node.code_tools.extend(catalog.code_tools.choose(rng).cloned());
        }
        if !catalog.mcp_tools.is_empty() && rng.gen_bool(TOOL_PROBABILITY) {
            node.mcp_tools.extend(catalog.mcp_tools.choose(rng).cloned());
        }
        nodes.push(node);
    }

    let last = n - 1;
    if n >= 4 && rng.gen_bool(0.5) {
        nodes[0].hand_offs = ids[1..last].to_vec();
        nodes[0].hand_off_type = Some(HandOffType::Parallel);
        for node in &mut nodes[1..last] {
            node.hand_offs = vec![ids[last].clone()];
        }
    } else {
        for i in 0..last {
            nodes[i].hand_offs = vec![ids[i + 1].clone()];
        }
    }
    nodes[last].hand_offs = vec![END_NODE.to_string()];

    let mut graph = WorkflowGraph::new(ids[0].clone(), nodes);
    sync_wait_for(&mut graph);
    graph
}

/// Build the first generation.
///
/// With a seed graph the first candidate is the seed itself and the rest
/// are structural variants of it; otherwise every candidate is random.
/// A seed graph that fails validation is an error.
pub fn seed_population(
    seed: Option<&WorkflowGraph>,
    catalog: &NodeCatalog,
    size: usize,
    validator: &GraphValidator,
    rng: &mut impl Rng,
) -> Result<Vec<Candidate>> {
    let size = size.max(1);
    let mut population = Vec::with_capacity(size);

    match seed {
        Some(seed) => {
            validator.validate(seed)?;
            population.push(Candidate::seed(seed.clone()));
            while population.len() < size {
                let variant = (0..MAX_SEED_ATTEMPTS)
                    .find_map(|_| {
                        let graph = match rng.gen_range(0..4) {
                            0 => add_node(seed, catalog, rng),
                            1 => remove_node(seed, rng),
                            2 => swap_model(seed, catalog, rng),
                            _ => toggle_tool(seed, catalog, rng),
                        }?;
                        (graph != *seed && validator.validate(&graph).is_ok()).then_some(graph)
                    })
                    .unwrap_or_else(|| {
                        debug!("No valid seed variant found, reusing the seed graph");
                        seed.clone()
                    });
                population.push(Candidate::seed(variant));
            }
        }
        None => {
            while population.len() < size {
                let mut built = None;
                for _ in 0..MAX_SEED_ATTEMPTS {
                    let graph = random_graph(catalog, validator.max_nodes(), rng);
                    if validator.validate(&graph).is_ok() {
                        built = Some(graph);
                        break;
                    }
                }
                let graph = match built {
                    Some(g) => g,
                    None => {
                        warn!("Random construction kept failing validation, using a single node");
                        WorkflowGraph::new(
                            "n1",
                            vec![WorkflowNode::new("n1", pick_model(catalog, rng)).with_hand_offs([END_NODE])],
                        )
                    }
                };
                population.push(Candidate::seed(graph));
            }
        }
    }
    Ok(population)
}

#[cfg(test)]
mod tests {
    use super::*;
    use evoflow_test_utils::fixtures;
    use rand::rngs::StdRng;

    use crate::evolution::population::Origin;

    fn catalog() -> NodeCatalog {
        NodeCatalog {
            models: vec!["worker".into(), "strong".into()],
            code_tools: vec!["calculator".into()],
            max_seed_nodes: 6,
            ..NodeCatalog::default()
        }
    }

    #[test]
    fn test_random_graphs_are_valid() {
        let validator = GraphValidator::default();
        let mut rng = StdRng::seed_from_u64(42);
        let mut saw_fanout = false;
        for _ in 0..100 {
            let graph = random_graph(&catalog(), 20, &mut rng);
            assert!(graph.nodes.len() <= 6);
            saw_fanout |= graph.nodes[0].hand_off_type == Some(HandOffType::Parallel);
            if let Err(e) = validator.validate(&graph) {
                panic!("{}: {}", e, graph.to_json_pretty().unwrap());
            }
        }
        assert!(saw_fanout);
    }

    #[test]
    fn test_random_graph_respects_node_cap() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..20 {
            assert!(random_graph(&catalog(), 2, &mut rng).nodes.len() <= 2);
        }
    }

    #[test]
    fn test_seed_population_from_graph() {
        let seed = fixtures::graph(fixtures::SEQUENTIAL_CHAIN);
        let validator = GraphValidator::default();
        let mut rng = StdRng::seed_from_u64(9);
        let population = seed_population(Some(&seed), &catalog(), 5, &validator, &mut rng).unwrap();

        assert_eq!(population.len(), 5);
        assert_eq!(population[0].graph, seed);
        assert!(population.iter().all(|c| c.origin == Origin::Seed && c.parent.is_none()));
        assert!(population[1..].iter().any(|c| c.graph != seed));
        for c in &population {
            assert!(validator.validate(&c.graph).is_ok());
        }
    }

    #[test]
    fn test_invalid_seed_is_error() {
        let mut seed = fixtures::graph(fixtures::SINGLE_NODE);
        seed.entry_node_id = "missing".into();
        let result = seed_population(
            Some(&seed),
            &catalog(),
            3,
            &GraphValidator::default(),
            &mut StdRng::seed_from_u64(0),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_random_population_size() {
        let population = seed_population(
            None,
            &catalog(),
            4,
            &GraphValidator::default(),
            &mut StdRng::seed_from_u64(3),
        )
        .unwrap();
        assert_eq!(population.len(), 4);
        let ids: std::collections::HashSet<_> = population.iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids.len(), 4);
    }
}
