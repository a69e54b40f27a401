// Common test utilities: in-memory database, payload fixtures, and a
// scripted LLM provider.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::RcaConfig;
use crate::models::AlertmanagerWebhookPayload;
use crate::services::llm::{LlmError, LlmProvider, LlmResponse, TokenUsage, ToolCall, ToolDefinition};

/// Create an in-memory SQLite database for testing
pub async fn create_test_db() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .expect("valid sqlite url")
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(3))
        .connect_with(options)
        .await
        .expect("Failed to create test database");

    sqlx::migrate!()
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

/// RCA config with semantic correlation off (most tests run without an LLM).
pub fn test_rca_config() -> RcaConfig {
    RcaConfig {
        semantic_correlation_enabled: false,
        ..RcaConfig::default()
    }
}

/// A raw Alertmanager alert record for webhook payloads.
pub fn am_alert(
    fingerprint: &str,
    alertname: &str,
    status: &str,
    severity: &str,
    labels: &[(&str, &str)],
    starts_at: DateTime<Utc>,
) -> Value {
    let mut label_map = json!({
        "alertname": alertname,
        "severity": severity,
    });
    for (key, value) in labels {
        label_map[key] = json!(value);
    }

    json!({
        "status": status,
        "labels": label_map,
        "annotations": {"summary": format!("{} fired", alertname)},
        "startsAt": starts_at.to_rfc3339(),
        "fingerprint": fingerprint,
    })
}

/// Wrap alert records into a version-4 webhook payload.
pub fn webhook_payload(alerts: Vec<Value>) -> AlertmanagerWebhookPayload {
    serde_json::from_value(json!({
        "receiver": "argus",
        "status": "firing",
        "alerts": alerts,
        "groupLabels": {},
        "commonLabels": {},
        "commonAnnotations": {},
        "version": "4",
    }))
    .expect("valid webhook payload")
}

/// Scripted LLM provider: pops one canned response per chat call and records
/// every transcript it was shown.
#[derive(Debug)]
pub struct MockProvider {
    responses: Mutex<VecDeque<LlmResponse>>,
    pub transcripts: Mutex<Vec<Vec<Value>>>,
}

impl MockProvider {
    pub fn new(responses: Vec<LlmResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            transcripts: Mutex::new(Vec::new()),
        }
    }

    pub fn text_response(text: &str) -> LlmResponse {
        LlmResponse {
            content: Some(text.to_string()),
            tool_calls: Vec::new(),
            stop_reason: Some("end_turn".to_string()),
            usage: TokenUsage { input_tokens: 10, output_tokens: 10 },
        }
    }

    pub fn tool_response(calls: Vec<(&str, &str, Value)>) -> LlmResponse {
        LlmResponse {
            content: None,
            tool_calls: calls
                .into_iter()
                .map(|(id, name, arguments)| ToolCall {
                    id: id.to_string(),
                    name: name.to_string(),
                    arguments,
                })
                .collect(),
            stop_reason: Some("tool_use".to_string()),
            usage: TokenUsage { input_tokens: 10, output_tokens: 10 },
        }
    }

}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn chat(
        &self,
        messages: &[Value],
        _tools: Option<&[ToolDefinition]>,
        _system_prompt: Option<&str>,
        _max_tokens: u32,
        _temperature: f64,
    ) -> Result<LlmResponse, LlmError> {
        self.transcripts.lock().unwrap().push(messages.to_vec());
        let next = self.responses.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| Self::text_response("No further analysis available.")))
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
