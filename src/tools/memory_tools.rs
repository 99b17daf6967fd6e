//! Memory tools - AI-callable surfaces over the memory stores
//!
//! Let the LLM persist and retrieve long-term context. The loop
//! injects `_session_id` into tool arguments before execution; the
//! model never supplies it.

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::error::{Error, Result};
use crate::memory::{
    ProfileSetOptions, ProfileStore, SearchOptions, SemanticChunk, SemanticStore,
};
use crate::tools::traits::{Tool, ToolCategory, ToolResult};

fn session_id(args: &Value) -> Option<String> {
    args.get("_session_id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// Tool to save a memory chunk
pub struct MemorySaveTool {
    store: SemanticStore,
}

impl MemorySaveTool {
    pub fn new(store: SemanticStore) -> Self {
        MemorySaveTool { store }
    }
}

#[async_trait]
impl Tool for MemorySaveTool {
    fn name(&self) -> &str {
        "memory_save"
    }

    fn description(&self) -> &str {
        "Save an important fact or piece of context to long-term memory. Use when the user shares something worth remembering across sessions."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": {
                    "type": "string",
                    "description": "The fact to remember, phrased as a standalone statement"
                },
                "tags": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Optional categorization tags"
                }
            },
            "required": ["text"]
        })
    }

    fn category(&self) -> Option<ToolCategory> {
        Some(ToolCategory::Memory)
    }

    async fn execute(&self, args: Value) -> Result<ToolResult> {
        let text = args
            .get("text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::InvalidInput("Missing 'text' parameter".into()))?;

        let tags: Vec<String> = args
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let mut chunk = SemanticChunk::new(text)
            .with_tags(tags)
            .with_source("memory_tool");
        if let Some(session) = session_id(&args) {
            chunk = chunk.with_session(session);
        }

        self.store.add(&chunk).await?;
        info!("Saved memory chunk {}", chunk.id);
        Ok(ToolResult::success(format!("Remembered: {}", text)))
    }
}

/// Tool to search saved memories
pub struct MemorySearchTool {
    store: SemanticStore,
}

impl MemorySearchTool {
    pub fn new(store: SemanticStore) -> Self {
        MemorySearchTool { store }
    }
}

#[async_trait]
impl Tool for MemorySearchTool {
    fn name(&self) -> &str {
        "memory_search"
    }

    fn description(&self) -> &str {
        "Search long-term memory for relevant facts. Use before asking the user for information they may have shared before."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "What to look for"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum results (default 5)"
                }
            },
            "required": ["query"]
        })
    }

    fn category(&self) -> Option<ToolCategory> {
        Some(ToolCategory::Memory)
    }

    fn retryable(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value) -> Result<ToolResult> {
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::InvalidInput("Missing 'query' parameter".into()))?;
        let limit = args.get("limit").and_then(|v| v.as_u64()).unwrap_or(5) as usize;

        let results = self
            .store
            .search_fts(
                query,
                &SearchOptions {
                    limit,
                    ..Default::default()
                },
            )
            .await?;

        if results.is_empty() {
            return Ok(ToolResult::success("No matching memories found."));
        }

        let listing: String = results
            .iter()
            .enumerate()
            .map(|(i, s)| format!("{}. {}\n", i + 1, s.chunk.text))
            .collect();
        Ok(ToolResult::success(listing))
    }
}

/// Tool to record a profile fact about the user
pub struct ProfileSetTool {
    store: ProfileStore,
}

impl ProfileSetTool {
    pub fn new(store: ProfileStore) -> Self {
        ProfileSetTool { store }
    }
}

#[async_trait]
impl Tool for ProfileSetTool {
    fn name(&self) -> &str {
        "profile_set"
    }

    fn description(&self) -> &str {
        "Record a stable fact about the user (name, preferences, timezone). Only use for facts the user stated explicitly."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "key": {
                    "type": "string",
                    "description": "Snake_case fact name, e.g. preferred_language"
                },
                "value": {
                    "description": "The fact value"
                }
            },
            "required": ["key", "value"]
        })
    }

    fn category(&self) -> Option<ToolCategory> {
        Some(ToolCategory::Memory)
    }

    async fn execute(&self, args: Value) -> Result<ToolResult> {
        let key = args
            .get("key")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::InvalidInput("Missing 'key' parameter".into()))?;
        let value = args
            .get("value")
            .cloned()
            .ok_or_else(|| Error::InvalidInput("Missing 'value' parameter".into()))?;

        self.store
            .set(
                key,
                value.clone(),
                ProfileSetOptions {
                    confidence: Some(0.9),
                    explicit: true,
                    ..Default::default()
                },
            )
            .await?;

        Ok(ToolResult::success(format!("Noted {} = {}", key, value)))
    }
}
