use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::RunId;

/// Outcome of a single node invocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Succeeded,
    Failed,
}

/// A tool call made while a node was running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUsage {
    pub tool: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One record in a run trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInvocation {
    pub node_id: String,
    pub input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// USD cost of every model call made for this node, including selection.
    pub cost: f64,
    pub status: InvocationStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolUsage>,
}

impl NodeInvocation {
    pub fn succeeded(&self) -> bool {
        self.status == InvocationStatus::Succeeded
    }

    pub fn elapsed_secs(&self) -> f64 {
        (self.end_time - self.start_time).num_milliseconds().max(0) as f64 / 1000.0
    }
}

/// Which run budget stopped scheduling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BudgetKind {
    TotalInvocations,
    PerNodeInvocations,
    NodeCount,
    TimeBudget,
}

/// Why a run stopped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TerminationReason {
    /// The ready set emptied.
    Completed,
    /// A run budget was hit; the partial trace is still scoreable.
    Truncated { budget: BudgetKind },
    /// The caller cancelled the run (e.g. the evolution spend limit).
    Cancelled,
    /// No progress despite available capacity.
    Stalled { idle_secs: u64 },
}

/// Ordered record of everything one run did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTrace {
    pub run_id: RunId,
    /// Invocations in completion order.
    pub invocations: Vec<NodeInvocation>,
    pub total_invocations: u32,
    pub per_node_invocations: BTreeMap<String, u32>,
    pub termination: TerminationReason,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Outputs of nodes that handed off to `"end"`, merged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_output: Option<String>,
}

impl RunTrace {
    pub fn total_cost_usd(&self) -> f64 {
        self.invocations.iter().map(|i| i.cost).sum()
    }

    pub fn total_time_seconds(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds().max(0) as f64 / 1000.0
    }

    /// Truncated, cancelled and stalled runs all stopped short of completion.
    pub fn is_truncated(&self) -> bool {
        !matches!(self.termination, TerminationReason::Completed)
    }

    pub fn failed_nodes(&self) -> Vec<&str> {
        self.invocations
            .iter()
            .filter(|i| !i.succeeded())
            .map(|i| i.node_id.as_str())
            .collect()
    }

    /// Number of times a node was invoked in this run.
    pub fn invocations_of(&self, node_id: &str) -> u32 {
        self.per_node_invocations.get(node_id).copied().unwrap_or(0)
    }
}

/// Scalar quality signal for one candidate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FitnessResult {
    /// Combined score, rounded and capped to [0, 100].
    pub score: u32,
    /// Mean judged accuracy in [0, 100].
    pub accuracy: f64,
    pub total_cost_usd: f64,
    pub total_time_seconds: f64,
    /// Spend on judge calls (not part of the cost term).
    #[serde(default)]
    pub judge_cost_usd: f64,
    /// Judge rounds that produced a usable accuracy.
    #[serde(default)]
    pub judgements: u32,
}

impl FitnessResult {
    /// Result used when no usable signal exists (every judge round failed).
    pub fn zero(total_cost_usd: f64, total_time_seconds: f64, judge_cost_usd: f64) -> Self {
        Self {
            score: 0,
            accuracy: 0.0,
            total_cost_usd,
            total_time_seconds,
            judge_cost_usd,
            judgements: 0,
        }
    }

    /// Everything this evaluation spent.
    pub fn spend_usd(&self) -> f64 {
        self.total_cost_usd + self.judge_cost_usd
    }

    /// Average several per-task results into one candidate result.
    pub fn mean(results: &[FitnessResult]) -> Option<FitnessResult> {
        if results.is_empty() {
            return None;
        }
        let n = results.len() as f64;
        let score = results.iter().map(|r| r.score as f64).sum::<f64>() / n;
        Some(FitnessResult {
            score: score.round().clamp(0.0, 100.0) as u32,
            accuracy: results.iter().map(|r| r.accuracy).sum::<f64>() / n,
            total_cost_usd: results.iter().map(|r| r.total_cost_usd).sum(),
            total_time_seconds: results.iter().map(|r| r.total_time_seconds).sum(),
            judge_cost_usd: results.iter().map(|r| r.judge_cost_usd).sum(),
            judgements: results.iter().map(|r| r.judgements).sum(),
        })
    }
}
