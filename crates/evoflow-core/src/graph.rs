//! Workflow graph DSL: the serializable document describing one agent pipeline.
//!
//! A workflow is a set of nodes plus an entry node. Edges are implied by each
//! node's `handOffs` list; the reserved id [`END_NODE`] is a terminal sink.
//! This module only models the document. Well-formedness is checked by the
//! engine's validator before any execution or accepted mutation.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EvoflowError, Result};

/// Reserved terminal id. Never a real node.
pub const END_NODE: &str = "end";

/// How a node passes control to its successors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HandOffType {
    /// Try successors in order; the first satisfiable one wins.
    Sequential,
    /// Fire all successors at once.
    Parallel,
    /// A selection step picks exactly one successor.
    Conditional,
}

/// A node in a workflow graph.
///
/// Each node is one model invocation with its own system prompt, model and
/// tools. Successors are listed in `hand_offs`; order matters for sequential
/// hand-off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowNode {
    /// Unique identifier for this node.
    pub node_id: String,
    /// What this node is for. Shown to selectors and mutation prompts.
    #[serde(default)]
    pub description: String,
    /// System prompt for this node's model call.
    #[serde(default)]
    pub system_prompt: String,
    /// Model this node calls.
    pub model_name: String,
    /// MCP-served tools available to this node.
    #[serde(default)]
    pub mcp_tools: Vec<String>,
    /// Code tools available to this node.
    #[serde(default)]
    pub code_tools: Vec<String>,
    /// Successor node ids (or `"end"`).
    #[serde(default)]
    pub hand_offs: Vec<String>,
    /// Explicit hand-off type; inferred when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hand_off_type: Option<HandOffType>,
    /// Predecessors that must all succeed before this node may run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_for: Option<Vec<String>>,
    /// Static key/value notes injected into the node's prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<BTreeMap<String, String>>,
}

impl WorkflowNode {
    /// Create a new node with minimal configuration.
    pub fn new(node_id: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            description: String::new(),
            system_prompt: String::new(),
            model_name: model_name.into(),
            mcp_tools: vec![],
            code_tools: vec![],
            hand_offs: vec![],
            hand_off_type: None,
            wait_for: None,
            memory: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_hand_offs<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hand_offs = targets.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_hand_off_type(mut self, kind: HandOffType) -> Self {
        self.hand_off_type = Some(kind);
        self
    }

    pub fn with_wait_for<I, S>(mut self, preds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.wait_for = Some(preds.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_code_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.code_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_memory(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.memory
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// All tool names this node may call, MCP tools first.
    pub fn tool_refs(&self) -> impl Iterator<Item = &str> {
        self.mcp_tools
            .iter()
            .chain(self.code_tools.iter())
            .map(|s| s.as_str())
    }

    /// Whether this node hands off to the terminal sink.
    pub fn ends(&self) -> bool {
        self.hand_offs.iter().any(|h| h == END_NODE)
    }
}

/// A complete workflow document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowGraph {
    pub entry_node_id: String,
    pub nodes: Vec<WorkflowNode>,
}

impl WorkflowGraph {
    pub fn new(entry_node_id: impl Into<String>, nodes: Vec<WorkflowNode>) -> Self {
        Self {
            entry_node_id: entry_node_id.into(),
            nodes,
        }
    }

    /// Parse a graph document from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a graph document from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| EvoflowError::ConfigNotFound(path.display().to_string()))?;
        Self::from_json(&content)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.node_id == id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut WorkflowNode> {
        self.nodes.iter_mut().find(|n| n.node_id == id)
    }

    /// Node ids in document order.
    pub fn node_ids(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.node_id.as_str()).collect()
    }

    /// Ids of real nodes that list `id` in their hand-offs, in document order.
    pub fn predecessors_of(&self, id: &str) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.hand_offs.iter().any(|h| h == id))
            .map(|n| n.node_id.as_str())
            .collect()
    }
}
