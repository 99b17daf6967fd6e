//! Tool registry - manages available tools for the agent
//!
//! Tools arrive from providers (native, MCP servers, skills) and are
//! grouped by a source label so a whole provider can be removed at
//! once. Names are unique; re-registering overwrites.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::agent::types::ToolDefinition;
use crate::error::Result;

use super::traits::Tool;

/// Source label for tools registered directly on the agent
pub const NATIVE_SOURCE: &str = "native";

/// A provider contributes a batch of tools under one source label
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// Source label, e.g. `mcp__filesystem` or a skill name
    fn source(&self) -> &str;

    /// Produce the provider's tools
    async fn provide(&self) -> Result<Vec<Arc<dyn Tool>>>;
}

/// Registry of available tools
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    sources: HashMap<String, String>,
}

impl ToolRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        ToolRegistry {
            tools: HashMap::new(),
            sources: HashMap::new(),
        }
    }

    /// Register a native tool. An existing tool with the same name is
    /// overwritten.
    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        self.register_arc(Arc::new(tool), NATIVE_SOURCE);
    }

    /// Register a shared tool under a source label
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>, source: &str) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            debug!("Tool {} re-registered (overwritten)", name);
        }
        self.sources.insert(name, source.to_string());
    }

    /// Register every tool a provider offers
    pub async fn register_provider(&mut self, provider: &dyn ToolProvider) -> Result<usize> {
        let tools = provider.provide().await?;
        let count = tools.len();
        for tool in tools {
            self.register_arc(tool, provider.source());
        }
        info!("Registered {} tools from {}", count, provider.source());
        Ok(count)
    }

    /// Get a tool by exact name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Remove a tool by name
    pub fn remove(&mut self, name: &str) -> bool {
        self.sources.remove(name);
        self.tools.remove(name).is_some()
    }

    /// Remove every tool registered under a source label
    pub fn remove_by_source(&mut self, source: &str) -> usize {
        let names: Vec<String> = self
            .sources
            .iter()
            .filter(|(_, s)| s.as_str() == source)
            .map(|(n, _)| n.clone())
            .collect();
        for name in &names {
            self.tools.remove(name);
            self.sources.remove(name);
        }
        names.len()
    }

    /// Source label a tool was registered under
    pub fn source_of(&self, name: &str) -> Option<&str> {
        self.sources.get(name).map(String::as_str)
    }

    /// Get all tool definitions (stable name order)
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut names: Vec<&String> = self.tools.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|n| self.tools[n].to_definition())
            .collect()
    }

    /// Get tool count
    pub fn count(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry has no tools
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// List tool names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::super::traits::{Tool, ToolResult};
    use crate::error::Result;
    use async_trait::async_trait;
    use serde_json::Value;

    /// Echo tool used throughout the test suite
    pub struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo the given text back"
        }

        fn parameters_schema(&self) -> Value {
            serde_json::json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string", "description": "Text to echo" }
                },
                "required": ["text"]
            })
        }

        async fn execute(&self, args: Value) -> Result<ToolResult> {
            let text = args.get("text").and_then(|v| v.as_str()).unwrap_or("");
            Ok(ToolResult::success(text))
        }
    }

    /// Tool that sleeps then returns a fixed string
    pub struct SleepTool {
        pub name: String,
        pub sleep_ms: u64,
        pub output: String,
    }

    #[async_trait]
    impl Tool for SleepTool {
        fn name(&self) -> &str {
            &self.name
        }

        fn description(&self) -> &str {
            "Sleep for a while, then answer"
        }

        fn parameters_schema(&self) -> Value {
            serde_json::json!({ "type": "object", "properties": {} })
        }

        async fn execute(&self, _args: Value) -> Result<ToolResult> {
            tokio::time::sleep(std::time::Duration::from_millis(self.sleep_ms)).await;
            Ok(ToolResult::success(self.output.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::EchoTool;
    use super::*;
    use crate::tools::traits::ToolResult;

    struct StaticProvider;

    #[async_trait]
    impl ToolProvider for StaticProvider {
        fn source(&self) -> &str {
            "test_provider"
        }

        async fn provide(&self) -> Result<Vec<Arc<dyn Tool>>> {
            Ok(vec![Arc::new(EchoTool)])
        }
    }

    #[tokio::test]
    async fn register_get_execute() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);

        let tool = registry.get("echo").unwrap();
        let result = tool
            .execute(serde_json::json!({ "text": "hello" }))
            .await
            .unwrap();
        assert_eq!(result.content.as_deref(), Some("hello"));
        assert!(registry.get("missing").is_none());
    }

    #[tokio::test]
    async fn provider_tools_are_grouped_and_removable() {
        let mut registry = ToolRegistry::new();
        registry.register_provider(&StaticProvider).await.unwrap();

        assert_eq!(registry.count(), 1);
        assert_eq!(registry.source_of("echo"), Some("test_provider"));

        assert_eq!(registry.remove_by_source("test_provider"), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn reregistration_overwrites() {
        struct EchoV2;

        #[async_trait]
        impl Tool for EchoV2 {
            fn name(&self) -> &str {
                "echo"
            }
            fn description(&self) -> &str {
                "v2"
            }
            fn parameters_schema(&self) -> serde_json::Value {
                serde_json::json!({})
            }
            async fn execute(&self, _args: serde_json::Value) -> Result<ToolResult> {
                Ok(ToolResult::success("v2"))
            }
        }

        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(EchoV2);

        assert_eq!(registry.count(), 1);
        assert_eq!(registry.get("echo").unwrap().description(), "v2");
    }

    #[test]
    fn definitions_are_sorted_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let defs = registry.definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].function.name, "echo");
    }
}
