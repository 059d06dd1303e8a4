use std::time::Duration;

use futures::future::BoxFuture;

use crate::error::{EvoflowError, Result};
use crate::record::Record;
use crate::types::*;

/// Model capability. Callers only see the returned USD cost,
/// never provider identity or pricing.
pub trait ModelClient: Send + Sync + 'static {
    /// Run one completion. `Err` means the call could not be made at all;
    /// a model-level failure is `Ok` with `success == false`.
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<CompletionResponse>>;

    /// A single attempt with no retries of its own. Rate-gated callers drive
    /// retries themselves so no call slot is held while backing off.
    fn attempt(&self, request: CompletionRequest) -> BoxFuture<'_, Result<CompletionResponse>> {
        self.complete(request)
    }

    /// Backoff before retrying after `error` on the zero-based `attempt`,
    /// or `None` to give up.
    fn retry_after(&self, _error: &EvoflowError, _attempt: u32) -> Option<Duration> {
        None
    }
}

/// A named callable with a declared parameter schema.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in model tool calls and node tool refs).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool with already-validated input.
    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }
}

/// Persistence boundary. Append and fetch by id only.
pub trait RecordStore: Send + Sync + 'static {
    /// Append a record. Appending an existing id replaces it.
    fn append(&self, record: Record) -> BoxFuture<'_, Result<()>>;

    /// Fetch a record by id.
    fn fetch(&self, id: &str) -> BoxFuture<'_, Result<Option<Record>>>;
}
