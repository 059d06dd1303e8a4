//! Graph documents for executor and evolution tests. Every node's system
//! prompt is `You are node <ID>.` so scripted rules can target single nodes.

use evoflow_core::graph::WorkflowGraph;

/// A fans out to B and C in parallel; both end.
pub const PARALLEL_FANOUT: &str = r#"{
    "entryNodeId": "A",
    "nodes": [
        {"nodeId": "A", "modelName": "worker", "systemPrompt": "You are node A.", "handOffs": ["B", "C"], "handOffType": "parallel"},
        {"nodeId": "B", "modelName": "worker", "systemPrompt": "You are node B.", "handOffs": ["end"]},
        {"nodeId": "C", "modelName": "worker", "systemPrompt": "You are node C.", "handOffs": ["end"]}
    ]
}"#;

/// A fans out to B and C; D joins on both and ends.
pub const JOIN_DIAMOND: &str = r#"{
    "entryNodeId": "A",
    "nodes": [
        {"nodeId": "A", "modelName": "worker", "systemPrompt": "You are node A.", "handOffs": ["B", "C"], "handOffType": "parallel"},
        {"nodeId": "B", "modelName": "worker", "systemPrompt": "You are node B.", "handOffs": ["D"]},
        {"nodeId": "C", "modelName": "worker", "systemPrompt": "You are node C.", "handOffs": ["D"]},
        {"nodeId": "D", "modelName": "worker", "systemPrompt": "You are node D.", "handOffs": ["end"], "waitFor": ["B", "C"]}
    ]
}"#;

/// A -> B -> C -> end.
pub const SEQUENTIAL_CHAIN: &str = r#"{
    "entryNodeId": "A",
    "nodes": [
        {"nodeId": "A", "modelName": "worker", "systemPrompt": "You are node A.", "handOffs": ["B"]},
        {"nodeId": "B", "modelName": "worker", "systemPrompt": "You are node B.", "handOffs": ["C"]},
        {"nodeId": "C", "modelName": "worker", "systemPrompt": "You are node C.", "handOffs": ["end"]}
    ]
}"#;

/// A routes to exactly one of B or C.
pub const CONDITIONAL_ROUTER: &str = r#"{
    "entryNodeId": "A",
    "nodes": [
        {"nodeId": "A", "modelName": "worker", "systemPrompt": "You are node A.", "handOffs": ["B", "C"], "handOffType": "conditional"},
        {"nodeId": "B", "modelName": "worker", "systemPrompt": "You are node B.", "description": "Handles arithmetic", "handOffs": ["end"]},
        {"nodeId": "C", "modelName": "worker", "systemPrompt": "You are node C.", "description": "Handles geography", "handOffs": ["end"]}
    ]
}"#;

/// A has two successors and no explicit type: sequential-with-choice.
pub const CHOICE_ROUTER: &str = r#"{
    "entryNodeId": "A",
    "nodes": [
        {"nodeId": "A", "modelName": "worker", "systemPrompt": "You are node A.", "handOffs": ["B", "C"]},
        {"nodeId": "B", "modelName": "worker", "systemPrompt": "You are node B.", "handOffs": ["end"]},
        {"nodeId": "C", "modelName": "worker", "systemPrompt": "You are node C.", "handOffs": ["end"]}
    ]
}"#;

/// A single node that answers directly.
pub const SINGLE_NODE: &str = r#"{
    "entryNodeId": "A",
    "nodes": [
        {"nodeId": "A", "modelName": "worker", "systemPrompt": "You are node A.", "handOffs": ["end"]}
    ]
}"#;

/// A single node allowed to call the `echo` tool.
pub const TOOL_NODE: &str = r#"{
    "entryNodeId": "A",
    "nodes": [
        {"nodeId": "A", "modelName": "worker", "systemPrompt": "You are node A.", "codeTools": ["echo"], "handOffs": ["end"]}
    ]
}"#;

/// Two evaluation tasks in the native dataset format.
pub const TASKS: &str = r#"[
    {"id": "t1", "input": "What is 6 * 7?", "groundTruth": "42"},
    {"id": "t2", "input": "Capital of France?", "groundTruth": "Paris", "rubric": "Exact city name"}
]"#;

/// Parse a fixture. Panics on malformed fixtures, which are test bugs.
pub fn graph(json: &str) -> WorkflowGraph {
    WorkflowGraph::from_json(json).expect("fixture graph must parse")
}
