//! Workflow DAG engine.
//!
//! A `WorkflowGraph` document is checked once by the [`GraphValidator`],
//! which resolves every node's hand-off type into a [`HandOffPlan`] and
//! yields a [`ValidatedGraph`]. The [`Executor`] only ever runs validated
//! graphs: it keeps a ready set seeded with the entry node, dispatches
//! ready nodes concurrently through the shared `RateController`, and
//! decides successors from each node's plan as invocations complete.

pub mod executor;
pub mod handoff;
pub mod validate;

pub use executor::{Executor, RunBudgets};
pub use handoff::{HandOffPlan, Target};
pub use validate::{GraphValidator, ValidatedGraph};
