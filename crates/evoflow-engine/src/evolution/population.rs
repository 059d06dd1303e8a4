//! Candidates and generations.
//!
//! Candidates live in an [`Arena`] and are never edited once inserted; a
//! [`Generation`] is an immutable list of candidate ids. Carrying an elite
//! forward means listing its id again, so its evaluation is reused.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use evoflow_core::graph::WorkflowGraph;
use evoflow_core::trace::FitnessResult;
use evoflow_core::types::CandidateId;

use super::mutation::MutationOperator;

/// How a candidate came to exist.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Origin {
    Seed,
    Mutation { operator: MutationOperator },
    /// Every mutation attempt was invalid; the child is the parent's graph.
    ParentCopy,
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: CandidateId,
    pub graph: WorkflowGraph,
    pub parent: Option<CandidateId>,
    pub origin: Origin,
    pub born_in: u32,
}

impl Candidate {
    pub fn seed(graph: WorkflowGraph) -> Self {
        Self {
            id: CandidateId::new(),
            graph,
            parent: None,
            origin: Origin::Seed,
            born_in: 0,
        }
    }

    pub fn child(parent: &CandidateId, graph: WorkflowGraph, origin: Origin, born_in: u32) -> Self {
        Self {
            id: CandidateId::new(),
            graph,
            parent: Some(parent.clone()),
            origin,
            born_in,
        }
    }
}

/// Outcome of one task for one candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskScore {
    pub task_id: String,
    pub fitness: FitnessResult,
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_nodes: Vec<String>,
}

/// A candidate's evaluation across all tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub fitness: FitnessResult,
    pub truncated: bool,
    pub tasks: Vec<TaskScore>,
}

impl Evaluation {
    pub fn from_tasks(tasks: Vec<TaskScore>) -> Self {
        let fitness = FitnessResult::mean(
            &tasks.iter().map(|t| t.fitness).collect::<Vec<_>>(),
        )
        .unwrap_or_else(|| FitnessResult::zero(0.0, 0.0, 0.0));
        Self {
            fitness,
            truncated: tasks.iter().any(|t| t.truncated),
            tasks,
        }
    }

    pub fn spend_usd(&self) -> f64 {
        self.fitness.spend_usd()
    }

    /// Plain-language notes on what went wrong, for repair prompts.
    pub fn feedback(&self) -> String {
        let mut lines = vec![format!(
            "Average score {}/100, accuracy {:.1}/100, cost ${:.4}.",
            self.fitness.score, self.fitness.accuracy, self.fitness.total_cost_usd
        )];
        for task in &self.tasks {
            let mut line = format!("Task {}: score {}", task.task_id, task.fitness.score);
            if !task.failed_nodes.is_empty() {
                line.push_str(&format!(", failed nodes: {}", task.failed_nodes.join(", ")));
            }
            if task.truncated {
                line.push_str(", run truncated by budget");
            }
            lines.push(line);
        }
        lines.join("\n")
    }
}

#[derive(Debug, Default)]
pub struct Arena {
    candidates: HashMap<CandidateId, Candidate>,
    evaluations: HashMap<CandidateId, Evaluation>,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, candidate: Candidate) -> CandidateId {
        let id = candidate.id.clone();
        self.candidates.insert(id.clone(), candidate);
        id
    }

    pub fn get(&self, id: &CandidateId) -> Option<&Candidate> {
        self.candidates.get(id)
    }

    pub fn evaluation(&self, id: &CandidateId) -> Option<&Evaluation> {
        self.evaluations.get(id)
    }

    pub fn record(&mut self, id: CandidateId, evaluation: Evaluation) {
        self.evaluations.insert(id, evaluation);
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Best evaluated candidate across every generation.
    pub fn best(&self) -> Option<(&Candidate, &Evaluation)> {
        let mut ids: Vec<&CandidateId> = self.evaluations.keys().collect();
        ids.sort();
        ids.into_iter()
            .filter_map(|id| Some((self.candidates.get(id)?, self.evaluations.get(id)?)))
            .fold(None, |best: Option<(&Candidate, &Evaluation)>, (c, e)| match best {
                Some((_, b)) if !better(&e.fitness, &b.fitness) => best,
                _ => Some((c, e)),
            })
    }
}

fn better(a: &FitnessResult, b: &FitnessResult) -> bool {
    a.score > b.score || (a.score == b.score && a.total_cost_usd < b.total_cost_usd)
}

/// One generation: an immutable snapshot of member ids.
#[derive(Debug, Clone)]
pub struct Generation {
    pub index: u32,
    pub members: Vec<CandidateId>,
}

/// Order members best first: score descending, then cost ascending, then
/// position. Unevaluated members rank last.
pub fn rank(members: &[CandidateId], arena: &Arena) -> Vec<CandidateId> {
    let mut ordered: Vec<(usize, &CandidateId, Option<&FitnessResult>)> = members
        .iter()
        .enumerate()
        .map(|(i, id)| (i, id, arena.evaluation(id).map(|e| &e.fitness)))
        .collect();
    ordered.sort_by(|(ia, _, fa), (ib, _, fb)| match (fa, fb) {
        (Some(a), Some(b)) => b
            .score
            .cmp(&a.score)
            .then(a.total_cost_usd.total_cmp(&b.total_cost_usd))
            .then(ia.cmp(ib)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => ia.cmp(ib),
    });
    ordered.into_iter().map(|(_, id, _)| id.clone()).collect()
}

/// Serializable record of a committed generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSummary {
    pub index: u32,
    pub members: Vec<MemberSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best: Option<CandidateId>,
    pub best_score: u32,
    pub mean_score: f64,
    pub evaluated: usize,
    pub spent_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberSummary {
    pub id: CandidateId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<CandidateId>,
    pub origin: Origin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fitness: Option<FitnessResult>,
}

impl GenerationSummary {
    pub fn build(generation: &Generation, arena: &Arena, spent_usd: f64) -> Self {
        let ranked = rank(&generation.members, arena);
        let members: Vec<MemberSummary> = ranked
            .iter()
            .filter_map(|id| {
                let c = arena.get(id)?;
                Some(MemberSummary {
                    id: id.clone(),
                    parent: c.parent.clone(),
                    origin: c.origin,
                    fitness: arena.evaluation(id).map(|e| e.fitness),
                })
            })
            .collect();
        let scores: Vec<u32> = members
            .iter()
            .filter_map(|m| m.fitness.map(|f| f.score))
            .collect();
        let mean_score = if scores.is_empty() {
            0.0
        } else {
            scores.iter().map(|s| *s as f64).sum::<f64>() / scores.len() as f64
        };
        Self {
            index: generation.index,
            best: members
                .first()
                .filter(|m| m.fitness.is_some())
                .map(|m| m.id.clone()),
            best_score: scores.iter().copied().max().unwrap_or(0),
            mean_score,
            evaluated: scores.len(),
            members,
            spent_usd,
        }
    }
}
