pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod record;
pub mod trace;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{EvoflowError, GraphError, GraphErrorKind, Result};
pub use event::EventBus;
pub use graph::{HandOffType, WorkflowGraph, WorkflowNode, END_NODE};
pub use record::{Record, RecordKind};
pub use trace::{FitnessResult, NodeInvocation, RunTrace, TerminationReason};
pub use types::*;
