//! Deterministic stand-ins for the model and tool capabilities, plus graph
//! fixtures for the executor and evolution scenarios.

pub mod fixtures;
pub mod model;
pub mod tools;

pub use model::{Reply, Rule, ScriptedModel};
pub use tools::{EchoTool, FailingTool, SlowTool};
