//! Ollama provider for local models.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use uuid::Uuid;

use super::provider::{LlmError, LlmProvider, LlmResponse, TokenUsage, ToolCall, ToolDefinition};

#[derive(Debug)]
pub struct OllamaProvider {
    base_url: String,
    model: String,
    timeout_seconds: u64,
    http: Client,
}

impl OllamaProvider {
    pub fn new(base_url: &str, model: &str, timeout_seconds: u64) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            timeout_seconds,
            http,
        }
    }

    /// Flatten content-block style messages into plain text; Ollama's chat API
    /// takes flat strings.
    fn convert_message(msg: &Value) -> Value {
        let role = msg["role"].as_str().unwrap_or("user");
        let content = &msg["content"];

        let text = if let Some(blocks) = content.as_array() {
            let mut parts = Vec::new();
            for block in blocks {
                match block["type"].as_str() {
                    Some("text") => {
                        if let Some(t) = block["text"].as_str() {
                            parts.push(t.to_string());
                        }
                    }
                    Some("tool_result") => {
                        let tool_content = block["content"].as_str().unwrap_or_default();
                        parts.push(format!("Tool result: {}", tool_content));
                    }
                    // tool_use blocks are carried natively via tool_calls
                    _ => {}
                }
            }
            parts.join("\n")
        } else {
            content.as_str().unwrap_or_default().to_string()
        };

        json!({"role": role, "content": text})
    }

    fn convert_tools(tools: &[ToolDefinition]) -> Value {
        let converted: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.input_schema,
                    },
                })
            })
            .collect();
        json!(converted)
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
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
        let mut ollama_messages = Vec::new();
        if let Some(system) = system_prompt {
            ollama_messages.push(json!({"role": "system", "content": system}));
        }
        for msg in messages {
            // Ollama tool messages pass through unchanged
            if msg["role"] == "tool" || msg.get("tool_calls").is_some() {
                ollama_messages.push(msg.clone());
            } else {
                ollama_messages.push(Self::convert_message(msg));
            }
        }

        let mut payload = json!({
            "model": self.model,
            "messages": ollama_messages,
            "stream": false,
            "options": {
                "temperature": temperature,
                "num_predict": max_tokens,
            },
        });
        if let Some(tools) = tools {
            payload["tools"] = Self::convert_tools(tools);
        }

        let response = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .json(&payload)
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
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::ApiError(format!("API error {}: {}", status, body)));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;

        let message = &data["message"];
        let content = message["content"].as_str().filter(|s| !s.is_empty()).map(String::from);

        let mut tool_calls = Vec::new();
        for tc in message["tool_calls"].as_array().into_iter().flatten() {
            tool_calls.push(ToolCall {
                id: tc["id"]
                    .as_str()
                    .map(String::from)
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
                name: tc["function"]["name"].as_str().unwrap_or_default().to_string(),
                arguments: tc["function"].get("arguments").cloned().unwrap_or(json!({})),
            });
        }

        let stop_reason = if !tool_calls.is_empty() {
            "tool_use"
        } else if data["done_reason"] == "length" {
            "length"
        } else {
            "stop"
        };

        Ok(LlmResponse {
            content,
            tool_calls,
            stop_reason: Some(stop_reason.to_string()),
            usage: TokenUsage {
                input_tokens: data["prompt_eval_count"].as_u64().unwrap_or(0),
                output_tokens: data["eval_count"].as_u64().unwrap_or(0),
            },
        })
    }

    fn format_tool_result(&self, _tool_call_id: &str, _tool_name: &str, result: &Value) -> Value {
        json!({"role": "tool", "content": result.to_string()})
    }

    fn format_assistant_message(&self, response: &LlmResponse) -> Value {
        let mut message = json!({"role": "assistant"});
        if let Some(content) = &response.content {
            message["content"] = json!(content);
        }
        if response.has_tool_calls() {
            let tool_calls: Vec<Value> = response
                .tool_calls
                .iter()
                .map(|tc| {
                    json!({
                        "id": tc.id,
                        "function": {"name": tc.name, "arguments": tc.arguments},
                    })
                })
                .collect();
            message["tool_calls"] = json!(tool_calls);
        }
        message
    }

    async fn health_check(&self) -> bool {
        let result = self
            .http
            .get(format!("{}/api/tags", self.base_url))
            .timeout(Duration::from_secs(10))
            .send()
            .await;

        let data: Value = match result {
            Ok(response) if response.status().is_success() => {
                match response.json().await {
                    Ok(data) => data,
                    Err(_) => return false,
                }
            }
            _ => return false,
        };

        let model_base = self.model.split(':').next().unwrap_or(&self.model);
        let available = data["models"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|m| m["name"].as_str())
            .any(|name| name.starts_with(model_base));

        if !available {
            tracing::warn!("Model {} not found on Ollama server", self.model);
        }
        available
    }
}
