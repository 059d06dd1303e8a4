pub mod evolution;
pub mod fitness;
pub mod graph;
pub mod rate;
pub mod run_log;
pub mod task;

pub use evolution::{EvolutionEngine, EvolutionOutcome, StopReason};
pub use fitness::FitnessEvaluator;
pub use graph::{Executor, GraphValidator, HandOffPlan, RunBudgets, Target, ValidatedGraph};
pub use rate::{RateController, RateLimits, RatePermit, StallGuard};
pub use run_log::EvolutionLogger;
pub use task::{load_tasks, EvalTask};
