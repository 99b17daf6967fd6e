//! MCP: tool provider over a JSON-RPC transport seam

pub mod protocol;
pub mod provider;

pub use protocol::{McpContent, McpError, McpRequest, McpResponse, McpTool, McpToolResult};
pub use provider::{default_name_transformer, McpToolProvider, McpTransport, NameTransformer};
