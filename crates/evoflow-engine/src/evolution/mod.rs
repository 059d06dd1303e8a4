//! Evolutionary search over workflow graphs.

pub mod engine;
pub mod mutation;
pub mod population;
pub mod seed;

pub use engine::{survivor_count, BestCandidate, EvolutionEngine, EvolutionOutcome, Phase, StopReason};
pub use mutation::{MutationOperator, MutationOutcome, Mutator};
pub use population::{Arena, Candidate, Evaluation, Generation, GenerationSummary, Origin, TaskScore};
pub use seed::{random_graph, seed_population};
