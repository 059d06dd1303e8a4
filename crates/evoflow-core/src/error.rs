use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EvoflowError {
    // Model errors
    #[error("Model request failed: {0}")]
    ModelRequest(String),

    #[error("Model response parse error: {0}")]
    ModelParse(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("Tool input validation failed: {tool}: {message}")]
    ToolValidation { tool: String, message: String },

    // Graph errors
    #[error(transparent)]
    Graph(#[from] GraphError),

    // Run errors
    #[error("Execution stalled: no progress for {idle_secs}s despite available capacity")]
    Stalled { idle_secs: u64 },

    #[error("Spend limit exceeded: ${spent:.4} > ${limit:.4}")]
    SpendLimitExceeded { spent: f64, limit: f64 },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Rate controller closed")]
    RateControllerClosed,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EvoflowError>;

/// Kind of static well-formedness violation found in a workflow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GraphErrorKind {
    UnknownEntry,
    DuplicateNodeId,
    ReservedIdUsed,
    UnreachableNode,
    CycleDetected,
    DanglingHandoff,
    MissingWaitFor,
    InvalidWaitFor,
    NoTermination,
    TooManyNodes,
    ParallelIncludesEnd,
}

impl fmt::Display for GraphErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A graph rejected by validation. Always fatal to the candidate that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphError {
    pub kind: GraphErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub detail: String,
}

impl GraphError {
    pub fn new(kind: GraphErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            node_id: None,
            detail: detail.into(),
        }
    }

    pub fn at(kind: GraphErrorKind, node_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            node_id: Some(node_id.into()),
            detail: detail.into(),
        }
    }
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node_id {
            Some(id) => write!(f, "Invalid graph ({}) at node '{}': {}", self.kind, id, self.detail),
            None => write!(f, "Invalid graph ({}): {}", self.kind, self.detail),
        }
    }
}

impl std::error::Error for GraphError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_error_display() {
        let err = GraphError::at(GraphErrorKind::CycleDetected, "b", "b -> c -> b");
        assert_eq!(
            err.to_string(),
            "Invalid graph (CycleDetected) at node 'b': b -> c -> b"
        );

        let err = GraphError::new(GraphErrorKind::UnknownEntry, "entry 'x' not found");
        assert_eq!(err.to_string(), "Invalid graph (UnknownEntry): entry 'x' not found");
    }

    #[test]
    fn test_graph_error_converts() {
        let err: EvoflowError = GraphError::new(GraphErrorKind::NoTermination, "dead end").into();
        assert!(matches!(err, EvoflowError::Graph(ref g) if g.kind == GraphErrorKind::NoTermination));
    }
}
