//! Anthropic Claude provider over the Messages API.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

use super::provider::{LlmError, LlmProvider, LlmResponse, TokenUsage, ToolCall, ToolDefinition};

const API_BASE: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

#[derive(Debug)]
pub struct AnthropicProvider {
    api_key: String,
    model: String,
    timeout_seconds: u64,
    http: Client,
}

impl AnthropicProvider {
    pub fn new(api_key: &str, model: &str, timeout_seconds: u64) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            timeout_seconds,
            http,
        }
    }

    fn convert_tools(tools: &[ToolDefinition]) -> Value {
        // The Messages API takes {name, description, input_schema} natively.
        json!(tools)
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(
        &self,
        messages: &[Value],
        tools: Option<&[ToolDefinition]>,
        system_prompt: Option<&str>,
        max_tokens: u32,
        temperature: f64,
    ) -> Result<LlmResponse, LlmError> {
        let mut body = json!({
            "model": self.model,
            "max_tokens": max_tokens,
            "temperature": temperature,
            "messages": messages,
        });
        if let Some(system) = system_prompt {
            body["system"] = json!(system);
        }
        if let Some(tools) = tools {
            body["tools"] = Self::convert_tools(tools);
        }

        let response = self
            .http
            .post(format!("{}/messages", API_BASE))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(self.timeout_seconds)
                } else {
                    LlmError::ApiError(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60);
            return Err(LlmError::RateLimited(retry_after));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::ApiError(format!("API error {}: {}", status, body)));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;

        let mut content = None;
        let mut tool_calls = Vec::new();

        for block in data["content"].as_array().into_iter().flatten() {
            match block["type"].as_str() {
                Some("text") => {
                    content = block["text"].as_str().map(String::from);
                }
                Some("tool_use") => {
                    tool_calls.push(ToolCall {
                        id: block["id"].as_str().unwrap_or_default().to_string(),
                        name: block["name"].as_str().unwrap_or_default().to_string(),
                        arguments: block.get("input").cloned().unwrap_or(json!({})),
                    });
                }
                _ => {}
            }
        }

        Ok(LlmResponse {
            content,
            tool_calls,
            stop_reason: data["stop_reason"].as_str().map(String::from),
            usage: TokenUsage {
                input_tokens: data["usage"]["input_tokens"].as_u64().unwrap_or(0),
                output_tokens: data["usage"]["output_tokens"].as_u64().unwrap_or(0),
            },
        })
    }

    fn format_tool_result(&self, tool_call_id: &str, _tool_name: &str, result: &Value) -> Value {
        json!({
            "role": "user",
            "content": [{
                "type": "tool_result",
                "tool_use_id": tool_call_id,
                "content": result.to_string(),
            }],
        })
    }

    fn format_assistant_message(&self, response: &LlmResponse) -> Value {
        let mut content = Vec::new();
        if let Some(text) = &response.content {
            content.push(json!({"type": "text", "text": text}));
        }
        for tool_call in &response.tool_calls {
            content.push(json!({
                "type": "tool_use",
                "id": tool_call.id,
                "name": tool_call.name,
                "input": tool_call.arguments,
            }));
        }
        json!({"role": "assistant", "content": content})
    }
}
