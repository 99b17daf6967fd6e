//! OpenAI-compatible chat completions client
//!
//! Works against any endpoint speaking the chat-completions protocol
//! (OpenAI, OpenRouter, Ollama, vLLM, ...). Streaming uses SSE with
//! incremental tool-call deltas reassembled by index.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{header, Client};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{LlmClient, TokenSink};
use crate::agent::types::*;
use crate::error::{Error, Result};

/// Configuration for an OpenAI-compatible endpoint
#[derive(Clone)]
pub struct OpenAiConfig {
    /// API key sent as a bearer token
    pub api_key: SecretString,
    /// Base URL, e.g. `https://api.openai.com/v1`
    pub base_url: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl OpenAiConfig {
    /// Build a config with the default timeout
    pub fn new(api_key: SecretString, base_url: impl Into<String>) -> Self {
        OpenAiConfig {
            api_key,
            base_url: base_url.into(),
            timeout_secs: 120,
        }
    }
}

/// OpenAI-compatible API client
#[derive(Clone)]
pub struct OpenAiCompatibleClient {
    client: Client,
    base_url: String,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDefinition]>,
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<AssistantToolCall>>,
}

#[derive(Deserialize)]
struct WireChunk {
    choices: Vec<WireChunkChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct WireChunkChoice {
    delta: WireDelta,
}

#[derive(Deserialize, Default)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCallDelta>>,
}

#[derive(Deserialize)]
struct WireToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<WireFunctionDelta>,
}

#[derive(Deserialize, Default)]
struct WireFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

impl OpenAiCompatibleClient {
    /// Create a new client
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&format!(
                "Bearer {}",
                config.api_key.expose_secret()
            ))
            .map_err(|e| Error::Config(format!("Invalid API key format: {}", e)))?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(OpenAiCompatibleClient {
            client,
            base_url: config.base_url,
        })
    }

    async fn send(&self, request: &WireRequest<'_>) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!("Sending request: model={}", request.model);

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    Error::Transport(e.to_string())
                } else {
                    Error::Http(e)
                }
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let message = response.text().await.unwrap_or_default();
            if status.as_u16() == 429 {
                warn!("Rate limit exceeded: {}", message);
            }
            Err(Error::Provider {
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatibleClient {
    async fn chat(&self, request: ChatRequest) -> Result<ChatOutcome> {
        let wire = WireRequest {
            model: &request.model,
            messages: &request.messages,
            max_tokens: request.options.max_tokens,
            temperature: request.options.temperature,
            top_p: request.options.top_p,
            stop: request.options.stop.as_ref(),
            stream: None,
            tools: if request.tools.is_empty() {
                None
            } else {
                Some(&request.tools)
            },
        };

        let body = self.send(&wire).await?.json::<WireResponse>().await?;
        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::provider("response contained no choices"))?;

        if let Some(usage) = body.usage {
            info!("Completion: {} tokens", usage.total_tokens);
        }

        Ok(ChatOutcome {
            content: choice.message.content,
            tool_calls: choice.message.tool_calls.unwrap_or_default(),
            usage: body.usage,
        })
    }

    async fn chat_stream(
        &self,
        request: ChatRequest,
        on_token: TokenSink<'_>,
    ) -> Result<ChatOutcome> {
        let wire = WireRequest {
            model: &request.model,
            messages: &request.messages,
            max_tokens: request.options.max_tokens,
            temperature: request.options.temperature,
            top_p: request.options.top_p,
            stop: request.options.stop.as_ref(),
            stream: Some(true),
            tools: if request.tools.is_empty() {
                None
            } else {
                Some(&request.tools)
            },
        };

        let response = self.send(&wire).await?;
        let mut stream = response.bytes_stream();

        let mut content = String::new();
        let mut usage: Option<Usage> = None;
        // Tool-call fragments arrive interleaved, keyed by index
        let mut partial_calls: Vec<(String, String, String)> = Vec::new();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| Error::Transport(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer.drain(..=pos);

                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data.is_empty() || data == "[DONE]" {
                    continue;
                }

                let parsed: WireChunk = match serde_json::from_str(data) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("Skipping malformed stream chunk: {}", e);
                        continue;
                    }
                };

                if let Some(u) = parsed.usage {
                    usage = Some(u);
                }

                for choice in parsed.choices {
                    if let Some(token) = choice.delta.content {
                        if !token.is_empty() {
                            on_token(&token);
                            content.push_str(&token);
                        }
                    }
                    for tc in choice.delta.tool_calls.unwrap_or_default() {
                        while partial_calls.len() <= tc.index {
                            partial_calls.push((String::new(), String::new(), String::new()));
                        }
                        let slot = &mut partial_calls[tc.index];
                        if let Some(id) = tc.id {
                            slot.0 = id;
                        }
                        if let Some(f) = tc.function {
                            if let Some(name) = f.name {
                                slot.1 = name;
                            }
                            if let Some(args) = f.arguments {
                                slot.2.push_str(&args);
                            }
                        }
                    }
                }
            }
        }

        let tool_calls = partial_calls
            .into_iter()
            .filter(|(_, name, _)| !name.is_empty())
            .map(|(id, name, args)| AssistantToolCall::function(id, name, args))
            .collect();

        Ok(ChatOutcome {
            content: if content.is_empty() {
                None
            } else {
                Some(content)
            },
            tool_calls,
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(base_url: &str) -> OpenAiCompatibleClient {
        OpenAiCompatibleClient::new(OpenAiConfig::new(
            SecretString::from("test-key"),
            base_url,
        ))
        .unwrap()
    }

    fn test_request() -> ChatRequest {
        ChatRequest {
            model: "test-model".into(),
            messages: vec![Message::user("hello")],
            options: GenerationOptions::default(),
            tools: vec![],
        }
    }

    #[tokio::test]
    async fn parses_content_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "Hi."}}],
                "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
            })))
            .mount(&server)
            .await;

        let outcome = test_client(&server.uri()).chat(test_request()).await.unwrap();
        assert_eq!(outcome.content.as_deref(), Some("Hi."));
        assert!(!outcome.has_tool_calls());
        assert_eq!(outcome.usage.unwrap().total_tokens, 7);
    }

    #[tokio::test]
    async fn parses_tool_call_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "echo", "arguments": "{\"text\":\"hi\"}"}
                    }]
                }}]
            })))
            .mount(&server)
            .await;

        let outcome = test_client(&server.uri()).chat(test_request()).await.unwrap();
        assert_eq!(outcome.tool_calls.len(), 1);
        assert_eq!(outcome.tool_calls[0].function.name, "echo");
    }

    #[tokio::test]
    async fn maps_429_to_retryable_provider_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let err = test_client(&server.uri())
            .chat(test_request())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, Error::Provider { status: 429, .. }));
    }

    #[tokio::test]
    async fn maps_400_to_fatal_provider_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad schema"))
            .mount(&server)
            .await;

        let err = test_client(&server.uri())
            .chat(test_request())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn reassembles_streamed_tokens_and_tool_calls() {
        let server = MockServer::start().await;
        let sse = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"c1\",\"function\":{\"name\":\"echo\",\"arguments\":\"{\\\"t\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"\\\":1}\"}}]}}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_string(sse))
            .mount(&server)
            .await;

        let tokens = std::sync::Mutex::new(Vec::new());
        let outcome = test_client(&server.uri())
            .chat_stream(test_request(), &|t: &str| {
                tokens.lock().unwrap().push(t.to_string());
            })
            .await
            .unwrap();

        assert_eq!(outcome.content.as_deref(), Some("Hello"));
        assert_eq!(tokens.lock().unwrap().join(""), "Hello");
        assert_eq!(outcome.tool_calls.len(), 1);
        assert_eq!(outcome.tool_calls[0].function.arguments, "{\"t\":1}");
    }
}
