//! # Agentry
//!
//! A framework for building tool-using conversational agents: given a
//! user utterance, the agent repeatedly consults an LLM, executes any
//! tools the model requests, feeds results back, and returns a
//! synthesized answer — under resource limits, safety policies, and a
//! persistent memory that survives sessions.
//!
//! ## Architecture
//!
//! - **Agent** (`agent`): the execution loop, stop-condition checker,
//!   state machine, model router, metrics, and evaluator
//! - **Tools** (`tools`): the tool trait, registry, permission policy,
//!   and the dispatch pipeline
//! - **Memory** (`memory`): event log, task state with optimistic
//!   concurrency, profile, hybrid FTS + vector semantic store,
//!   summarizer, compaction, and the retriever that assembles prompt
//!   context
//! - **Recovery** (`recovery`): retry with backoff and a circuit
//!   breaker for LLM and tool calls
//! - **Guardrail** (`guardrail`): input/output/tool-call rule engine
//! - **Providers** (`providers`): the LLM client seam and an
//!   OpenAI-compatible adapter
//! - **Skills** (`skills`) / **MCP** (`mcp`): pluggable tool providers
//! - **Configuration** (`config`): strict `agent.json` loading
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use agentry::agent::{Agent, ChatOptions};
//! use agentry::providers::{OpenAiCompatibleClient, OpenAiConfig};
//! use agentry::Result;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let llm = OpenAiCompatibleClient::new(OpenAiConfig::new(
//!         std::env::var("OPENAI_API_KEY").unwrap().into(),
//!         "https://api.openai.com/v1",
//!     ))?;
//!     let agent = Agent::builder(Arc::new(llm)).build();
//!     let response = agent.chat("hello", ChatOptions::default()).await?;
//!     println!("{}", response.content);
//!     Ok(())
//! }
//! ```

// Agent loop and loop-adjacent policies
pub mod agent;

// Configuration loading
pub mod config;

// Error types
pub mod error;

// Guardrail rule engine
pub mod guardrail;

// MCP tool provider
pub mod mcp;

// Memory stores, retrieval, summarization, compaction
pub mod memory;

// LLM provider seam and adapters
pub mod providers;

// Retry + circuit breaker
pub mod recovery;

// Skill manifests and lifecycle
pub mod skills;

// Tool trait, registry, permissions, dispatch pipeline
pub mod tools;

// Re-export commonly used items
pub use error::{Error, Result};

pub use agent::{Agent, AgentBuilder, AgentConfig, AgentResponse, ChatOptions, StreamCallbacks};
pub use guardrail::Guardrail;
pub use memory::MemoryManager;
pub use providers::LlmClient;
pub use recovery::{RecoveryConfig, RecoveryPolicy};
pub use tools::{Tool, ToolRegistry, ToolResult};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const NAME: &str = env!("CARGO_PKG_NAME");
