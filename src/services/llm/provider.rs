//! Abstract LLM provider contract.
//!
//! The orchestrator depends only on this trait; all wire translation (tool
//! shape, message shape, tool_result shape) lives in the concrete backends.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

/// A tool declared to the LLM: name, description and a JSON schema of its
/// arguments.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// A tool call requested by the LLM.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Token accounting for a single chat round-trip.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Standardized response from any LLM provider.
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub stop_reason: Option<String>,
    pub usage: TokenUsage,
}

impl LlmResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Whether the LLM has finished its turn (provider signaled stop and no
    /// tool calls remain to answer).
    pub fn is_complete(&self) -> bool {
        matches!(
            self.stop_reason.as_deref(),
            Some("end_turn") | Some("stop") | Some("length")
        ) && !self.has_tool_calls()
    }
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("No LLM provider configured")]
    NoProviderConfigured,

    #[error("Unknown LLM provider: {0}")]
    UnknownProvider(String),

    #[error("LLM API error: {0}")]
    ApiError(String),

    #[error("LLM response parsing error: {0}")]
    ParseError(String),

    #[error("LLM timeout after {0}s")]
    Timeout(u64),

    #[error("LLM rate limited, retry after {0}s")]
    RateLimited(u64),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::RateLimited(_))
    }

    /// Rate-limit detection also covers providers that only surface a raw
    /// HTTP 429 in the error text.
    pub fn is_rate_limit(&self) -> bool {
        match self {
            Self::RateLimited(_) => true,
            other => {
                let text = other.to_string().to_lowercase();
                text.contains("rate") || text.contains("429")
            }
        }
    }
}

/// Uniform chat + tool-call contract over LLM back-ends.
#[async_trait]
pub trait LlmProvider: Send + Sync + std::fmt::Debug {
    /// Provider name, e.g. "anthropic".
    fn name(&self) -> &str;

    /// Model identifier in use.
    fn model(&self) -> &str;

    /// Send a chat request. `messages` are provider-shaped message documents
    /// previously produced by `format_assistant_message` / `format_tool_result`
    /// (plus plain `{"role": "user", "content": "..."}` entries).
    async fn chat(
        &self,
        messages: &[Value],
        tools: Option<&[ToolDefinition]>,
        system_prompt: Option<&str>,
        max_tokens: u32,
        temperature: f64,
    ) -> Result<LlmResponse, LlmError>;

    /// Format a tool result as the message answering `tool_call_id`.
    fn format_tool_result(&self, tool_call_id: &str, tool_name: &str, result: &Value) -> Value;

    /// Format the assistant's response for the conversation transcript.
    fn format_assistant_message(&self, response: &LlmResponse) -> Value;

    /// Cheap availability probe.
    async fn health_check(&self) -> bool {
        let probe = [json!({"role": "user", "content": "Say 'ok'"})];
        match self.chat(&probe, None, None, 10, 0.0).await {
            Ok(response) => response.content.is_some(),
            Err(_) => false,
        }
    }
}
