use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use evoflow_core::error::{EvoflowError, Result};
use evoflow_core::traits::Tool;
use evoflow_core::types::{ToolContext, ToolDefinition, ToolResult};

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    /// Compiled parameter schema; `None` when the declared schema is unusable.
    validator: Option<Arc<jsonschema::Validator>>,
}

/// Registry of available tools, dispatched by declared name.
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool, compiling its parameter schema once.
    pub fn register(&mut self, tool: impl Tool) {
        let name = tool.name().to_string();
        let validator = match jsonschema::validator_for(&tool.input_schema()) {
            Ok(v) => Some(Arc::new(v)),
            Err(e) => {
                warn!(tool = %name, error = %e, "Tool schema does not compile; input will not be validated");
                None
            }
        };
        self.tools.insert(
            name,
            RegisteredTool {
                tool: Arc::new(tool),
                validator,
            },
        );
    }

    /// Unregister a tool by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|r| r.tool.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// List all registered tools, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Definitions for the named tools, in the given order. Unknown names are skipped.
    pub fn definitions_for<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Vec<ToolDefinition> {
        names
            .into_iter()
            .filter_map(|n| self.tools.get(n))
            .map(|r| ToolDefinition {
                name: r.tool.name().to_string(),
                description: r.tool.description().to_string(),
                input_schema: r.tool.input_schema(),
            })
            .collect()
    }

    /// Check input against the tool's declared parameter schema.
    pub fn validate(&self, name: &str, input: &serde_json::Value) -> Result<()> {
        let registered = self
            .tools
            .get(name)
            .ok_or_else(|| EvoflowError::ToolNotFound(name.to_string()))?;
        if let Some(validator) = &registered.validator {
            validator
                .validate(input)
                .map_err(|e| EvoflowError::ToolValidation {
                    tool: name.to_string(),
                    message: e.to_string(),
                })?;
        }
        Ok(())
    }

    /// Validate and execute a tool by name, bounded by the tool's timeout.
    pub async fn execute(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolResult> {
        self.validate(name, &input)?;
        let tool = self
            .get(name)
            .ok_or_else(|| EvoflowError::ToolNotFound(name.to_string()))?;

        let timeout = std::time::Duration::from_secs(tool.timeout_secs());

        match tokio::time::timeout(timeout, tool.execute(input, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(EvoflowError::ToolTimeout {
                tool: name.to_string(),
                timeout_secs: tool.timeout_secs(),
            }),
        }
    }

    /// Create a registry with the built-in `calculator` code tool. Other
    /// tools are registered by the embedding application.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(crate::builtin::calculator::CalculatorTool);
        registry
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evoflow_core::types::RunId;
    use evoflow_test_utils::{EchoTool, FailingTool, SlowTool};

    fn ctx() -> ToolContext {
        ToolContext {
            run_id: RunId::new(),
            node_id: "n".into(),
        }
    }

    #[tokio::test]
    async fn test_execute_validated_input() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let result = registry
            .execute("echo", serde_json::json!({"text": "hi"}), ctx())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.content(), "hi");
    }

    #[tokio::test]
    async fn test_rejects_input_violating_schema() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let err = registry
            .execute("echo", serde_json::json!({"text": 5}), ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, EvoflowError::ToolValidation { .. }));
        let err = registry
            .execute("echo", serde_json::json!({}), ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, EvoflowError::ToolValidation { .. }));
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let registry = ToolRegistry::new();
        let err = registry
            .execute("nope", serde_json::json!({}), ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, EvoflowError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn test_failing_tool_propagates_error() {
        let mut registry = ToolRegistry::new();
        registry.register(FailingTool);
        let err = registry
            .execute("fail", serde_json::json!({}), ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, EvoflowError::ToolExecution { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tool_timeout() {
        let mut registry = ToolRegistry::new();
        registry.register(SlowTool { delay_secs: 10, timeout_secs: 1 });
        let err = registry
            .execute("slow", serde_json::json!({}), ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, EvoflowError::ToolTimeout { timeout_secs: 1, .. }));
    }

    #[test]
    fn test_definitions_follow_requested_order() {
        let mut registry = ToolRegistry::with_builtins();
        registry.register(EchoTool);
        let defs = registry.definitions_for(["echo", "missing", "calculator"]);
        let names: Vec<_> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["echo", "calculator"]);
        assert_eq!(ToolRegistry::with_builtins().list(), vec!["calculator"]);
    }
}
