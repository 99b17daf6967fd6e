//! LLM provider seam
//!
//! The execution loop talks to models through the [`LlmClient`] trait.
//! Transport adapters (OpenAI chat completions and compatibles such as
//! OpenRouter or Ollama) live here; other protocols plug in by
//! implementing the trait.

mod openai;

pub use openai::{OpenAiCompatibleClient, OpenAiConfig};

use async_trait::async_trait;

use crate::agent::types::{ChatOutcome, ChatRequest};
use crate::error::Result;

/// Callback receiving incremental completion tokens during streaming
pub type TokenSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// A chat-completion capable LLM backend
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Perform a blocking chat completion
    async fn chat(&self, request: ChatRequest) -> Result<ChatOutcome>;

    /// Perform a streaming chat completion, emitting tokens through
    /// `on_token` and returning the assembled outcome.
    ///
    /// The default implementation falls back to [`LlmClient::chat`] and
    /// emits the full content as a single token.
    async fn chat_stream(
        &self,
        request: ChatRequest,
        on_token: TokenSink<'_>,
    ) -> Result<ChatOutcome> {
        let outcome = self.chat(request).await?;
        if let Some(ref content) = outcome.content {
            if !content.is_empty() {
                on_token(content);
            }
        }
        Ok(outcome)
    }
}
