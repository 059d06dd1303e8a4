use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use evoflow_core::config::{AppConfig, BudgetConfig, EvolutionConfig, InitialStrategy};
use evoflow_core::error::{EvoflowError, Result};
use evoflow_core::event::EventBus;
use evoflow_core::graph::WorkflowGraph;
use evoflow_core::record::{fitness_id, generation_id, trace_id, Record, RecordKind};
use evoflow_core::trace::FitnessResult;
use evoflow_core::traits::{ModelClient, RecordStore};
use evoflow_core::types::{CandidateId, EvolutionEvent};
use evoflow_tools::ToolRegistry;

use crate::fitness::FitnessEvaluator;
use crate::graph::{Executor, GraphValidator, RunBudgets};
use crate::rate::RateController;
use crate::task::EvalTask;

use super::mutation::Mutator;
use super::population::{rank, Arena, Candidate, Evaluation, Generation, GenerationSummary, TaskScore};
use super::seed::seed_population;

/// Where the loop is. Transitions run
/// `Seeding -> Evaluating -> Selecting -> Mutating -> Evaluating -> ... -> Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Seeding,
    Evaluating,
    Selecting,
    Mutating,
    Terminated,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    GenerationsReached,
    TimeLimit,
    SpendLimit,
    Cancelled,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GenerationsReached => "generations_reached",
            Self::TimeLimit => "time_limit",
            Self::SpendLimit => "spend_limit",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The best graph found, with its evaluation when it was scored.
#[derive(Debug, Clone, Serialize)]
pub struct BestCandidate {
    pub id: CandidateId,
    pub born_in: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fitness: Option<FitnessResult>,
    pub graph: WorkflowGraph,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvolutionOutcome {
    pub evolution_id: String,
    pub stop_reason: StopReason,
    /// Generations that were evaluated, including a partial last one.
    pub generations: u32,
    pub spent_usd: f64,
    pub best: BestCandidate,
    pub history: Vec<GenerationSummary>,
}

/// Generational search over workflow graphs.
///
/// The engine owns the population exclusively. Candidates of a generation
/// are evaluated concurrently (the shared [`RateController`] bounds actual
/// model calls), but selection waits for the whole generation and
/// generations follow one another strictly in order. Spend and wall-clock
/// limits are checked after every candidate evaluation.
pub struct EvolutionEngine {
    evolution_id: String,
    executor: Executor,
    evaluator: FitnessEvaluator,
    mutator: Mutator,
    validator: GraphValidator,
    budget: BudgetConfig,
    evolution: EvolutionConfig,
    run_budgets: RunBudgets,
    store: Option<Arc<dyn RecordStore>>,
    events: Arc<EventBus>,
    seed_graph: Option<WorkflowGraph>,
}

impl EvolutionEngine {
    pub fn new(config: &AppConfig, model: Arc<dyn ModelClient>, tools: Arc<ToolRegistry>) -> Self {
        let rate = RateController::from_budget(&config.budget);
        let validator = GraphValidator::from_budget(&config.budget);
        let executor = Executor::new(model.clone(), tools, rate.clone())
            .with_validator(validator.clone())
            .with_max_tool_rounds(config.evolution.max_tool_rounds);
        let evaluator = FitnessEvaluator::new(model.clone(), rate.clone(), config.fitness.clone());
        let mutator = Mutator::new(
            model,
            rate,
            validator.clone(),
            config.evolution.catalog.clone(),
            config.evolution.mutation_weights.clone(),
            config.evolution.repair_attempts,
            config.evolution.mutation_model.clone(),
        );

        Self {
            evolution_id: format!(
                "{}-{}",
                Utc::now().format("%Y%m%d_%H%M%S"),
                CandidateId::new()
            ),
            executor,
            evaluator,
            mutator,
            validator,
            budget: config.budget.clone(),
            evolution: config.evolution.clone(),
            run_budgets: RunBudgets::from(&config.budget),
            store: None,
            events: Arc::new(EventBus::default()),
            seed_graph: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Seed the first generation from this graph, overriding the
    /// configured initial strategy.
    pub fn with_seed_graph(mut self, graph: WorkflowGraph) -> Self {
        self.seed_graph = Some(graph);
        self
    }

    pub fn evolution_id(&self) -> &str {
        &self.evolution_id
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    pub fn rate(&self) -> &RateController {
        self.executor.rate()
    }

    pub async fn run(&self, tasks: &[EvalTask]) -> Result<EvolutionOutcome> {
        self.run_with_cancel(tasks, CancellationToken::new()).await
    }

    /// Run the loop until a termination condition holds. Errors only for
    /// an unusable setup (no tasks, a missing or invalid seed graph).
    pub async fn run_with_cancel(
        &self,
        tasks: &[EvalTask],
        cancel: CancellationToken,
    ) -> Result<EvolutionOutcome> {
        if tasks.is_empty() {
            return Err(EvoflowError::Config("no evaluation tasks".to_string()));
        }
        let evolution_id = self.evolution_id.as_str();
        let started = Instant::now();
        let mut rng = match self.evolution.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let population_size = self.budget.population_size.max(1);
        let total_generations = self.budget.generations.max(1);

        self.enter(Phase::Seeding, 0);
        let seed = self.resolve_seed()?;
        let mut arena = Arena::new();
        let members = seed_population(
            seed.as_ref(),
            &self.evolution.catalog,
            population_size,
            &self.validator,
            &mut rng,
        )?
        .into_iter()
        .map(|c| arena.insert(c))
        .collect();
        let mut generation = Generation { index: 0, members };
        let mut spent = 0.0;
        let mut history: Vec<GenerationSummary> = Vec::new();

        info!(
            evolution_id,
            population = population_size,
            generations = total_generations,
            tasks = tasks.len(),
            "Starting evolution"
        );

        let stop_reason = loop {
            self.enter(Phase::Evaluating, generation.index);
            self.events.publish(EvolutionEvent::GenerationStarted {
                generation: generation.index,
                candidates: generation.members.len(),
            });
            let stop = self
                .evaluate_generation(&generation, &mut arena, tasks, &mut spent, started, &cancel)
                .await;

            let summary = GenerationSummary::build(&generation, &arena, spent);
            self.persist(
                generation_id(evolution_id, generation.index),
                RecordKind::Generation,
                &summary,
            )
            .await;
            info!(
                evolution_id,
                generation = generation.index,
                best_score = summary.best_score,
                mean_score = summary.mean_score,
                spent_usd = spent,
                "Generation committed"
            );
            self.events.publish(EvolutionEvent::GenerationCommitted {
                generation: generation.index,
                best_score: summary.best_score,
                mean_score: summary.mean_score,
                evaluated: summary.evaluated,
                spent_usd: spent,
            });
            history.push(summary);

            if let Some(reason) = stop {
                break reason;
            }
            if generation.index + 1 >= total_generations {
                break StopReason::GenerationsReached;
            }
            if self.out_of_time(started) {
                break StopReason::TimeLimit;
            }

            self.enter(Phase::Selecting, generation.index);
            let ranked = rank(&generation.members, &arena);
            let keep = survivor_count(population_size, self.evolution.survivor_ratio).min(ranked.len());
            let survivors = &ranked[..keep];

            self.enter(Phase::Mutating, generation.index);
            match self
                .breed(generation.index + 1, survivors, population_size, &mut arena, &mut rng, &mut spent, &cancel)
                .await
            {
                Ok(members) => {
                    generation = Generation {
                        index: generation.index + 1,
                        members,
                    }
                }
                Err(reason) => break reason,
            }
        };

        self.enter(Phase::Terminated, generation.index);
        let best = best_candidate(&arena, &generation)?;
        let generations = history.len() as u32;
        info!(
            evolution_id,
            reason = %stop_reason,
            generations,
            best = %best.id,
            best_score = best.fitness.map(|f| f.score).unwrap_or(0),
            spent_usd = spent,
            "Evolution finished"
        );
        self.events.publish(EvolutionEvent::Terminated {
            reason: stop_reason.to_string(),
            generations,
            best_score: best.fitness.map(|f| f.score).unwrap_or(0),
            spent_usd: spent,
            at: Utc::now(),
        });

        Ok(EvolutionOutcome {
            evolution_id: evolution_id.to_string(),
            stop_reason,
            generations,
            spent_usd: spent,
            best,
            history,
        })
    }

    fn enter(&self, phase: Phase, generation: u32) {
        debug!(evolution_id = %self.evolution_id, generation, phase = ?phase, "Evolution phase");
    }

    fn resolve_seed(&self) -> Result<Option<WorkflowGraph>> {
        if let Some(graph) = &self.seed_graph {
            return Ok(Some(graph.clone()));
        }
        match &self.evolution.initial {
            InitialStrategy::Random => Ok(None),
            InitialStrategy::SeedFile { path } => WorkflowGraph::from_file(Path::new(path)).map(Some),
        }
    }

    fn out_of_time(&self, started: Instant) -> bool {
        started.elapsed() >= Duration::from_secs(self.budget.maximum_time_minutes.saturating_mul(60))
    }

    fn over_spend(&self, spent: f64) -> bool {
        spent > self.budget.max_cost_usd_per_run
    }

    /// Evaluate every member without an evaluation. Returns a stop reason
    /// when a limit was hit. The candidates still running then are cancelled
    /// and drained: their spend is counted but they stay unevaluated.
    async fn evaluate_generation(
        &self,
        generation: &Generation,
        arena: &mut Arena,
        tasks: &[EvalTask],
        spent: &mut f64,
        started: Instant,
        cancel: &CancellationToken,
    ) -> Option<StopReason> {
        let index = generation.index;
        let halt = cancel.child_token();
        let mut pending: FuturesUnordered<_> = generation
            .members
            .iter()
            .filter(|id| arena.evaluation(id).is_none())
            .filter_map(|id| arena.get(id).cloned())
            .map(|candidate| self.evaluate_candidate(index, candidate, tasks, halt.clone()))
            .collect();
        debug!(
            generation = index,
            pending = pending.len(),
            reused = generation.members.len() - pending.len(),
            "Evaluating generation"
        );

        let stop = loop {
            let next = tokio::select! {
                biased;
                _ = halt.cancelled() => {
                    info!(generation = index, "Evolution cancelled during evaluation");
                    break Some(StopReason::Cancelled);
                }
                done = pending.next() => done,
            };
            let Some((id, evaluation)) = next else {
                break None;
            };

            *spent += evaluation.spend_usd();
            self.persist(
                fitness_id(&self.evolution_id, index, &id),
                RecordKind::Fitness,
                &evaluation,
            )
            .await;
            self.events.publish(EvolutionEvent::CandidateEvaluated {
                generation: index,
                candidate_id: id.clone(),
                score: evaluation.fitness.score,
                accuracy: evaluation.fitness.accuracy,
                cost_usd: evaluation.spend_usd(),
                truncated: evaluation.truncated,
            });
            arena.record(id, evaluation);

            if self.over_spend(*spent) {
                warn!(
                    generation = index,
                    spent_usd = *spent,
                    limit_usd = self.budget.max_cost_usd_per_run,
                    interrupted = pending.len(),
                    "Spend limit exceeded, stopping evolution"
                );
                break Some(StopReason::SpendLimit);
            }
            if self.out_of_time(started) {
                warn!(generation = index, interrupted = pending.len(), "Time limit reached, stopping evolution");
                break Some(StopReason::TimeLimit);
            }
        };

        if stop.is_some() && !pending.is_empty() {
            halt.cancel();
            let mut drained = 0.0;
            while let Some((id, evaluation)) = pending.next().await {
                debug!(candidate = %id, spent_usd = evaluation.spend_usd(), "Interrupted candidate drained");
                drained += evaluation.spend_usd();
            }
            *spent += drained;
            info!(generation = index, drained_usd = drained, spent_usd = *spent, "In-flight candidates drained");
        }
        stop
    }

    /// Run a candidate over every task and average the results.
    async fn evaluate_candidate(
        &self,
        generation: u32,
        candidate: Candidate,
        tasks: &[EvalTask],
        cancel: CancellationToken,
    ) -> (CandidateId, Evaluation) {
        let validated = match self.validator.validate(&candidate.graph) {
            Ok(v) => v,
            Err(e) => {
                warn!(candidate = %candidate.id, error = %e, "Candidate graph invalid, scoring zero");
                return (candidate.id, Evaluation::from_tasks(vec![]));
            }
        };

        let mut scores = Vec::with_capacity(tasks.len());
        for task in tasks {
            if cancel.is_cancelled() {
                break;
            }
            let trace = self
                .executor
                .run_validated(&validated, &task.input, &self.run_budgets, cancel.clone())
                .await;
            self.persist(
                trace_id(&self.evolution_id, generation, &candidate.id, &task.id),
                RecordKind::Trace,
                &trace,
            )
            .await;
            if cancel.is_cancelled() {
                // Interrupted runs are not worth a judge call; keep their cost.
                scores.push(TaskScore {
                    task_id: task.id.clone(),
                    fitness: FitnessResult::zero(trace.total_cost_usd(), trace.total_time_seconds(), 0.0),
                    truncated: true,
                    failed_nodes: trace.failed_nodes().into_iter().map(String::from).collect(),
                });
                break;
            }
            let fitness = self.evaluator.score_task(&trace, task).await;
            debug!(
                candidate = %candidate.id,
                task = %task.id,
                score = fitness.score,
                truncated = trace.is_truncated(),
                "Task scored"
            );
            scores.push(TaskScore {
                task_id: task.id.clone(),
                fitness,
                truncated: trace.is_truncated(),
                failed_nodes: trace.failed_nodes().into_iter().map(String::from).collect(),
            });
        }
        (candidate.id, Evaluation::from_tasks(scores))
    }

    /// Elites carry over unchanged; the rest of the next generation are
    /// mutated children of survivors, assigned round-robin.
    #[allow(clippy::too_many_arguments)]
    async fn breed(
        &self,
        next_index: u32,
        survivors: &[CandidateId],
        population_size: usize,
        arena: &mut Arena,
        rng: &mut StdRng,
        spent: &mut f64,
        cancel: &CancellationToken,
    ) -> std::result::Result<Vec<CandidateId>, StopReason> {
        let mut members = survivors.to_vec();
        if survivors.is_empty() {
            return Ok(members);
        }

        for parent_id in survivors.iter().cycle().take(population_size.saturating_sub(survivors.len())) {
            if cancel.is_cancelled() {
                return Err(StopReason::Cancelled);
            }
            let Some(parent) = arena.get(parent_id) else {
                continue;
            };
            let parent_graph = parent.graph.clone();
            let feedback = arena
                .evaluation(parent_id)
                .map(|e| e.feedback())
                .unwrap_or_default();

            let outcome = self.mutator.mutate(&parent_graph, &feedback, rng).await;
            *spent += outcome.cost_usd;

            let child = Candidate::child(parent_id, outcome.graph, outcome.origin, next_index);
            match &outcome.rejection {
                None => self.events.publish(EvolutionEvent::MutationApplied {
                    generation: next_index,
                    parent_id: parent_id.clone(),
                    child_id: child.id.clone(),
                    operator: outcome.operator.to_string(),
                    attempts: outcome.attempts,
                }),
                Some(reason) => self.events.publish(EvolutionEvent::MutationRejected {
                    generation: next_index,
                    parent_id: parent_id.clone(),
                    operator: outcome.operator.to_string(),
                    reason: reason.clone(),
                }),
            }
            members.push(arena.insert(child));

            if self.over_spend(*spent) {
                warn!(spent_usd = *spent, "Spend limit exceeded while mutating, stopping evolution");
                return Err(StopReason::SpendLimit);
            }
        }
        Ok(members)
    }

    async fn persist(&self, id: String, kind: RecordKind, payload: &impl Serialize) {
        let Some(store) = &self.store else {
            return;
        };
        let record = match Record::new(id.clone(), kind, payload) {
            Ok(r) => r,
            Err(e) => {
                warn!(record_id = %id, error = %e, "Failed to encode record");
                return;
            }
        };
        if let Err(e) = store.append(record).await {
            warn!(record_id = %id, error = %e, "Failed to persist record");
        }
    }
}

/// Survivors kept per generation: `ceil(size * ratio)`, at least one.
pub fn survivor_count(population_size: usize, ratio: f64) -> usize {
    let ratio = if ratio.is_finite() { ratio.clamp(0.0, 1.0) } else { 0.5 };
    ((population_size as f64 * ratio).ceil() as usize).clamp(1, population_size.max(1))
}

/// Best evaluated candidate overall, or the first member of the last
/// generation when nothing was scored.
fn best_candidate(arena: &Arena, last: &Generation) -> Result<BestCandidate> {
    if let Some((c, e)) = arena.best() {
        return Ok(BestCandidate {
            id: c.id.clone(),
            born_in: c.born_in,
            fitness: Some(e.fitness),
            graph: c.graph.clone(),
        });
    }
    last.members
        .first()
        .and_then(|id| arena.get(id))
        .map(|c| BestCandidate {
            id: c.id.clone(),
            born_in: c.born_in,
            fitness: None,
            graph: c.graph.clone(),
        })
        .ok_or_else(|| EvoflowError::Config("empty population".to_string()))
}
