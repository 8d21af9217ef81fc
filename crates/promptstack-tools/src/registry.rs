//! Tool registry.

use crate::{BoxedTool, ToolContext, ToolError, ToolOutput, ToolResult};
use promptstack_provider::ToolDefinition;
use promptstack_util::TimingGuard;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// Name-keyed tool table. Ordered so tool definitions are sent to the model
/// in a stable order.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, BoxedTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the tools that need no sandbox.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(std::sync::Arc::new(crate::navigate::NavigateTool));
        registry.register(std::sync::Arc::new(crate::docs::ReadDocsTool::new()));
        registry
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: BoxedTool) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&BoxedTool> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Definitions in the shape the model adapters expect.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.json_schema(),
            })
            .collect()
    }

    /// Look up and run one tool. An unregistered name is `NotFound`.
    pub async fn invoke(&self, name: &str, args: Value, ctx: &ToolContext) -> ToolResult<ToolOutput> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::not_found(format!("tool {name}")))?;
        let _timing = TimingGuard::tool(name);
        debug!(tool = name, project_id = %ctx.project_id, "Invoking tool");
        tool.invoke(args, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_are_sorted_by_name() {
        let registry = ToolRegistry::with_builtins();
        assert_eq!(registry.list(), vec!["navigate_to", "read_docs"]);
        let defs = registry.definitions();
        assert_eq!(defs[0].name, "navigate_to");
        assert_eq!(defs[1].parameters["required"][0], "page");
    }

    #[tokio::test]
    async fn test_invoke_unknown_tool() {
        let registry = ToolRegistry::new();
        let err = registry
            .invoke("nope", Value::Null, &ToolContext::new("prj_1", "cht_1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
    }
}
