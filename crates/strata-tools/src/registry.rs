use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use strata_core::error::{Result, StrataError};
use strata_core::traits::Tool;
use strata_core::types::{ToolContext, ToolResult};

/// Registry of tools available to the deterministic strategy.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. A tool with the same name is replaced.
    pub fn register(&mut self, tool: impl Tool) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        debug!(tool = %name, "Registered tool");
        self.tools.insert(name, tool);
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Execute a tool by name, bounded by the tool's timeout.
    pub async fn execute(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolResult> {
        let tool = self
            .get(name)
            .ok_or_else(|| StrataError::not_found("Tool", name))?;
        run_with_timeout(tool.as_ref(), input, ctx).await
    }

    /// Create a registry with the built-in deterministic tools.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(crate::builtin::data::JsonQueryTool);
        registry.register(crate::builtin::data::TemplateTool);
        registry.register(crate::builtin::math::MathTool);
        registry
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a tool under `tokio::time::timeout(tool.timeout_secs())`.
pub async fn run_with_timeout(
    tool: &dyn Tool,
    input: serde_json::Value,
    ctx: ToolContext,
) -> Result<ToolResult> {
    let timeout = std::time::Duration::from_secs(tool.timeout_secs());

    match tokio::time::timeout(timeout, tool.execute(input, ctx)).await {
        Ok(result) => result,
        Err(_) => Err(StrataError::StepExecution {
            step: tool.name().to_string(),
            message: format!("tool timed out after {}s", tool.timeout_secs()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use serde_json::json;
    use strata_core::types::RunId;

    struct SlowTool;

    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "Never finishes in time."
        }
        fn input_schema(&self) -> serde_json::Value {
            json!({"type": "object"})
        }
        fn execute(
            &self,
            _input: serde_json::Value,
            _ctx: ToolContext,
        ) -> BoxFuture<'_, Result<ToolResult>> {
            Box::pin(async {
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                Ok(ToolResult::success(json!(null)))
            })
        }
        fn timeout_secs(&self) -> u64 {
            1
        }
    }

    fn ctx() -> ToolContext {
        ToolContext {
            run_id: RunId::from("run-1"),
            step_id: "s1".into(),
        }
    }

    #[test]
    fn builtins_are_registered() {
        let registry = ToolRegistry::with_builtins();
        assert_eq!(registry.list(), vec!["json_query", "math", "template"]);
    }

    #[tokio::test]
    async fn missing_tool_is_not_found() {
        let registry = ToolRegistry::new();
        let err = registry.execute("nope", json!({}), ctx()).await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tool_times_out() {
        let mut registry = ToolRegistry::new();
        registry.register(SlowTool);
        let err = registry.execute("slow", json!({}), ctx()).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
