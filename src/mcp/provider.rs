//! MCP-to-tool bridge
//!
//! Adapts a connected MCP server's advertised tools into the [`Tool`]
//! trait so they register alongside native tools. The transport
//! (stdio or HTTP JSON-RPC) is a trait seam; this module only speaks
//! requests and responses. Advertised names are rewritten by a
//! configurable transformer, `mcp__{server}__{tool}` by default.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::protocol::{McpRequest, McpResponse, McpTool, McpToolResult};
use crate::error::{Error, Result};
use crate::tools::{Tool, ToolProvider, ToolResult};

/// JSON-RPC transport to one MCP server
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a request and await its response
    async fn request(&self, request: McpRequest) -> Result<McpResponse>;
}

/// Rewrites advertised tool names before registration
pub type NameTransformer = Arc<dyn Fn(&str, &str) -> String + Send + Sync>;

/// The default transformer: `mcp__{server}__{tool}`
pub fn default_name_transformer() -> NameTransformer {
    Arc::new(|server, tool| format!("mcp__{}__{}", server, tool))
}

/// Exposes one MCP server's tools through the registry
pub struct McpToolProvider {
    transport: Arc<dyn McpTransport>,
    server_name: String,
    source: String,
    transform: NameTransformer,
    next_id: Arc<AtomicU64>,
}

impl McpToolProvider {
    pub fn new(server_name: impl Into<String>, transport: Arc<dyn McpTransport>) -> Self {
        let server_name = server_name.into();
        McpToolProvider {
            transport,
            source: format!("mcp__{}", server_name),
            server_name,
            transform: default_name_transformer(),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Replace the name transformer
    pub fn with_name_transformer(mut self, transform: NameTransformer) -> Self {
        self.transform = transform;
        self
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn call(&self, request: McpRequest) -> Result<Value> {
        let response = self.transport.request(request).await?;
        if let Some(error) = response.error {
            return Err(Error::Tool(format!(
                "MCP server {} error {}: {}",
                self.server_name, error.code, error.message
            )));
        }
        response
            .result
            .ok_or_else(|| Error::Tool(format!("MCP server {} returned no result", self.server_name)))
    }

    /// List the server's advertised tools
    pub async fn list_tools(&self) -> Result<Vec<McpTool>> {
        let result = self.call(McpRequest::list_tools(self.next_id())).await?;
        let tools: Vec<McpTool> = serde_json::from_value(
            result
                .get("tools")
                .cloned()
                .unwrap_or_else(|| serde_json::json!([])),
        )?;
        debug!(
            "MCP server {} advertises {} tools",
            self.server_name,
            tools.len()
        );
        Ok(tools)
    }
}

#[async_trait]
impl ToolProvider for McpToolProvider {
    fn source(&self) -> &str {
        &self.source
    }

    async fn provide(&self) -> Result<Vec<Arc<dyn Tool>>> {
        let tools = self.list_tools().await?;
        Ok(tools
            .into_iter()
            .map(|tool| {
                Arc::new(McpBridgedTool {
                    exposed_name: (self.transform)(&self.server_name, &tool.name),
                    tool,
                    transport: self.transport.clone(),
                    server_name: self.server_name.clone(),
                    next_id: self.next_id.clone(),
                }) as Arc<dyn Tool>
            })
            .collect())
    }
}

/// One MCP tool wrapped as a registry tool
struct McpBridgedTool {
    exposed_name: String,
    tool: McpTool,
    transport: Arc<dyn McpTransport>,
    server_name: String,
    next_id: Arc<AtomicU64>,
}

#[async_trait]
impl Tool for McpBridgedTool {
    fn name(&self) -> &str {
        &self.exposed_name
    }

    fn description(&self) -> &str {
        &self.tool.description
    }

    fn parameters_schema(&self) -> Value {
        if self.tool.input_schema.is_null() {
            serde_json::json!({ "type": "object", "properties": {} })
        } else {
            self.tool.input_schema.clone()
        }
    }

    async fn execute(&self, args: Value) -> Result<ToolResult> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let response = self
            .transport
            .request(McpRequest::call_tool(id, &self.tool.name, args))
            .await?;

        if let Some(error) = response.error {
            return Ok(ToolResult::failure(format!(
                "MCP tool '{}' failed: {}",
                self.tool.name, error.message
            )));
        }

        let result: McpToolResult = serde_json::from_value(
            response
                .result
                .ok_or_else(|| Error::Tool(format!("MCP server {} returned no result", self.server_name)))?,
        )?;

        // Combine all text content blocks
        let text: String = result
            .content
            .iter()
            .filter_map(|c| c.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");

        if result.is_error {
            Ok(ToolResult::failure(text))
        } else {
            Ok(ToolResult::success(text))
        }
    }
}
