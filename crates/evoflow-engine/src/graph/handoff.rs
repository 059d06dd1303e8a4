use std::fmt;

use evoflow_core::graph::{HandOffType, WorkflowNode, END_NODE};

/// A hand-off destination: a real node or the terminal sink.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Node(String),
    End,
}

impl Target {
    pub fn parse(id: &str) -> Self {
        if id == END_NODE {
            Self::End
        } else {
            Self::Node(id.to_string())
        }
    }

    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::Node(id) => Some(id),
            Self::End => None,
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, Self::End)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(id) => write!(f, "{}", id),
            Self::End => write!(f, "{}", END_NODE),
        }
    }
}

/// How a node picks its successors, resolved once at validation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandOffPlan {
    /// First satisfiable target wins. With `choice`, the node's own output
    /// may name the target on a `HANDOFF: <id>` line.
    Sequential { targets: Vec<Target>, choice: bool },
    /// Every target becomes ready at once. Never contains `End`.
    Parallel { targets: Vec<String> },
    /// A selection call picks exactly one target.
    Conditional { targets: Vec<Target> },
}

impl HandOffPlan {
    /// Resolve a node's plan. An omitted type means sequential, with choice
    /// when there is more than one successor.
    pub fn resolve(node: &WorkflowNode) -> Self {
        let targets: Vec<Target> = node.hand_offs.iter().map(|h| Target::parse(h)).collect();
        match node.hand_off_type {
            None => Self::Sequential {
                choice: targets.len() > 1,
                targets,
            },
            Some(HandOffType::Sequential) => Self::Sequential {
                targets,
                choice: false,
            },
            Some(HandOffType::Parallel) => Self::Parallel {
                targets: node.hand_offs.clone(),
            },
            Some(HandOffType::Conditional) => Self::Conditional { targets },
        }
    }

    pub fn targets(&self) -> Vec<Target> {
        match self {
            Self::Sequential { targets, .. } | Self::Conditional { targets } => targets.clone(),
            Self::Parallel { targets } => targets.iter().map(|t| Target::Node(t.clone())).collect(),
        }
    }

    /// Whether the node is expected to name its successor in its output.
    pub fn wants_choice(&self) -> bool {
        matches!(self, Self::Sequential { choice: true, .. })
    }
}

/// Find the last `HANDOFF: <id>` line in a node's output.
pub fn parse_handoff_choice(output: &str) -> Option<String> {
    output.lines().rev().find_map(|line| {
        let line = line.trim().trim_matches(|c| c == '*' || c == '`');
        let (key, value) = line.split_once(':')?;
        if !key.trim().eq_ignore_ascii_case("handoff") {
            return None;
        }
        let id = value.trim().trim_matches(|c: char| c == '`' || c == '"' || c == '\'' || c == '.');
        (!id.is_empty()).then(|| id.to_string())
    })
}
