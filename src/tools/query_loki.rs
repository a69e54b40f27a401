//! Loki query tool for the RCA agent.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;

use crate::services::cache;
use crate::services::llm::ToolDefinition;
use crate::services::loki_client::LokiClient;

const DEFAULT_LIMIT: u32 = 500;
const MAX_LIMIT: u32 = 2000;
const MAX_MESSAGE_CHARS: usize = 2000;

/// Tool descriptor declared to the LLM.
pub fn tool_definition() -> ToolDefinition {
    ToolDefinition {
        name: "query_loki".to_string(),
        description: "Query logs from Loki using LogQL. Use this tool to retrieve relevant log \
                      entries for alert analysis. Returns log lines with timestamps and labels."
            .to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "logql_query": {
                    "type": "string",
                    "description": "LogQL query string. Examples:\n- '{job=\"api\"}' - all logs from api job\n- '{service=\"payment\"} |= \"error\"' - logs containing 'error'\n- '{namespace=\"prod\"} |~ \"(ERROR|WARN)\"' - regex match\n- '{app=\"web\"} | json | level=\"error\"' - JSON parsing",
                },
                "start_time": {
                    "type": "string",
                    "description": "ISO 8601 start time for log range (e.g., '2025-01-15T10:00:00Z')",
                },
                "end_time": {
                    "type": "string",
                    "description": "ISO 8601 end time for log range (e.g., '2025-01-15T10:30:00Z')",
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of log entries to return (default: 500, max: 2000)",
                    "default": 500,
                },
            },
            "required": ["logql_query", "start_time", "end_time"],
        }),
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Execute a Loki query and return results shaped for the LLM.
///
/// Always returns a JSON object; failures carry `{"success": false, "error"}`
/// so the model can recover in its next iteration.
pub async fn execute_query_loki(client: &LokiClient, args: &Value) -> Value {
    let logql_query = match args["logql_query"].as_str() {
        Some(q) => q.to_string(),
        None => {
            return json!({"success": false, "error": "missing required argument: logql_query"})
        }
    };
    let start_time = args["start_time"].as_str().unwrap_or_default().to_string();
    let end_time = args["end_time"].as_str().unwrap_or_default().to_string();

    let (start, end) = match (parse_timestamp(&start_time), parse_timestamp(&end_time)) {
        (Some(s), Some(e)) => (s, e),
        _ => {
            return json!({
                "success": false,
                "error": format!("invalid time range: {} .. {}", start_time, end_time),
                "query": logql_query,
            })
        }
    };

    let limit = args["limit"].as_u64().map(|l| l as u32).unwrap_or(DEFAULT_LIMIT);
    let limit = limit.clamp(1, MAX_LIMIT);
    let cache_extra = format!("limit={}", limit);

    let cached = cache::global()
        .lock()
        .ok()
        .and_then(|mut c| c.get_loki(&logql_query, &start_time, &end_time, &cache_extra));

    let result = match cached {
        Some(hit) => hit,
        None => match client.query_range(&logql_query, start, end, limit, "backward").await {
            Ok(result) => {
                if let Ok(mut c) = cache::global().lock() {
                    c.set_loki(&logql_query, &start_time, &end_time, &cache_extra, result.clone(), None);
                }
                result
            }
            Err(e) => {
                tracing::warn!("Loki query failed: {}", e);
                // Echo the attempted range so the model can self-correct
                return json!({
                    "success": false,
                    "error": e.to_string(),
                    "query": logql_query,
                    "time_range": {"start": start_time, "end": end_time},
                });
            }
        },
    };

    let formatted = format_loki_results(&result);
    let total_entries = formatted["total_entries"].as_u64().unwrap_or(0);

    json!({
        "success": true,
        "query": logql_query,
        "time_range": {"start": start_time, "end": end_time},
        "result_count": total_entries,
        "streams_count": formatted["streams_count"],
        "logs": formatted["logs"],
        "truncated": total_entries >= limit as u64,
    })
}

/// Flatten Loki streams into `{timestamp, message, labels}` entries, most
/// recent first, with long messages truncated.
pub fn format_loki_results(result: &Value) -> Value {
    let mut logs: Vec<Value> = Vec::new();
    let mut streams_count = 0;
    let mut total_entries = 0;

    if let Some(streams) = result["data"]["result"].as_array() {
        streams_count = streams.len();
        for stream in streams {
            let labels = stream.get("stream").cloned().unwrap_or(json!({}));
            for value in stream["values"].as_array().into_iter().flatten() {
                total_entries += 1;
                let timestamp_ns: i64 = match &value[0] {
                    Value::String(s) => s.parse().unwrap_or(0),
                    other => other.as_i64().unwrap_or(0),
                };
                let timestamp = DateTime::<Utc>::from_timestamp(
                    timestamp_ns / 1_000_000_000,
                    (timestamp_ns % 1_000_000_000) as u32,
                )
                .unwrap_or_else(Utc::now);

                let raw_message = value[1].as_str().unwrap_or_default();
                let message = if raw_message.chars().count() > MAX_MESSAGE_CHARS {
                    let mut truncated: String =
                        raw_message.chars().take(MAX_MESSAGE_CHARS).collect();
                    truncated.push_str("... [truncated]");
                    truncated
                } else {
                    raw_message.to_string()
                };

                logs.push(json!({
                    "timestamp": timestamp.to_rfc3339(),
                    "message": message,
                    "labels": labels,
                }));
            }
        }
    }

    logs.sort_by(|a, b| {
        b["timestamp"]
            .as_str()
            .unwrap_or("")
            .cmp(a["timestamp"].as_str().unwrap_or(""))
    });

    json!({
        "logs": logs,
        "streams_count": streams_count,
        "total_entries": total_entries,
    })
}

/// Log-query templates keyed by alert-name substrings.
const ALERT_QUERY_PATTERNS: [(&str, &str); 6] = [
    ("disk", "|~ \"(?i)(disk|space|storage|quota|full)\""),
    ("memory", "|~ \"(?i)(oom|out of memory|memory|heap)\""),
    ("cpu", "|~ \"(?i)(cpu|throttl|load)\""),
    ("network", "|~ \"(?i)(connection|timeout|refused|unreachable|network)\""),
    ("database", "|~ \"(?i)(database|db|sql|query|transaction|deadlock)\""),
    ("health", "|~ \"(?i)(health|ready|liveness|probe)\""),
];

/// Context-aware LogQL query builder.
pub struct LogQlQueryBuilder {
    labels: HashMap<String, String>,
}

impl LogQlQueryBuilder {
    /// Labels useful for log filtering.
    const FILTER_LABELS: [&'static str; 8] =
        ["service", "device", "namespace", "pod", "container", "job", "app", "instance"];

    /// Labels excluded from the fallback selector.
    const EXCLUDE_LABELS: [&'static str; 5] =
        ["alertname", "severity", "prometheus", "monitor", "__name__"];

    pub fn new(labels: &HashMap<String, String>) -> Self {
        Self { labels: labels.clone() }
    }

    /// Base label selector derived from the alert's labels.
    pub fn build_base_selector(&self) -> String {
        let mut query_labels: Vec<(&str, &str)> = Self::FILTER_LABELS
            .iter()
            .filter_map(|key| self.labels.get(*key).map(|v| (*key, v.as_str())))
            .collect();

        if query_labels.is_empty() {
            query_labels = self
                .labels
                .iter()
                .filter(|(k, _)| !Self::EXCLUDE_LABELS.contains(&k.as_str()))
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            query_labels.sort();
        }

        if query_labels.is_empty() {
            return "{}".to_string();
        }

        let selectors: Vec<String> = query_labels
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, v))
            .collect();
        format!("{{{}}}", selectors.join(", "))
    }

    pub fn build_error_query(&self) -> String {
        format!(
            "{} |~ \"(?i)(error|exception|fail|fatal|panic|critical)\"",
            self.build_base_selector()
        )
    }

    /// Query focused on the failure class the alert name suggests.
    pub fn build_alertname_specific_query(&self, alertname: &str) -> String {
        let base = self.build_base_selector();
        let alertname_lower = alertname.to_lowercase();

        for (pattern_key, pattern) in ALERT_QUERY_PATTERNS {
            if alertname_lower.contains(pattern_key) {
                return format!("{} {}", base, pattern);
            }
        }

        self.build_error_query()
    }

    /// Query suggestions with descriptions for the prompt.
    pub fn suggest_queries(&self, alertname: &str) -> Vec<(String, String)> {
        let base = self.build_base_selector();
        let mut suggestions = vec![(
            self.build_error_query(),
            "Error logs from the affected service".to_string(),
        )];

        let alertname_lower = alertname.to_lowercase();
        for (pattern_key, pattern) in ALERT_QUERY_PATTERNS {
            if alertname_lower.contains(pattern_key) {
                suggestions.push((
                    format!("{} {}", base, pattern),
                    format!("Logs related to {} issues", pattern_key),
                ));
            }
        }

        suggestions.push((base, "All logs from the affected service for context".to_string()));
        suggestions
    }

    /// Rendered query hints for the initial prompt.
    pub fn get_query_hints(&self, alertname: &str) -> String {
        let mut hints = vec!["Suggested LogQL queries for this alert:".to_string()];
        for (i, (query, description)) in self.suggest_queries(alertname).iter().enumerate() {
            hints.push(format!("  {}. {}:", i + 1, description));
            hints.push(format!("     {}", query));
        }
        hints.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn base_selector_uses_filter_labels() {
        let builder = LogQlQueryBuilder::new(&labels(&[
            ("service", "payment-api"),
            ("severity", "critical"),
            ("alertname", "HighErrorRate"),
        ]));
        assert_eq!(builder.build_base_selector(), "{service=\"payment-api\"}");
    }

    #[test]
    fn fallback_selector_excludes_meta_labels() {
        let builder = LogQlQueryBuilder::new(&labels(&[
            ("severity", "critical"),
            ("alertname", "X"),
            ("shard", "3"),
        ]));
        assert_eq!(builder.build_base_selector(), "{shard=\"3\"}");
    }

    #[test]
    fn empty_labels_give_empty_selector() {
        let builder = LogQlQueryBuilder::new(&HashMap::new());
        assert_eq!(builder.build_base_selector(), "{}");
    }

    #[test]
    fn alertname_patterns_selected() {
        let builder = LogQlQueryBuilder::new(&labels(&[("service", "db")]));
        let query = builder.build_alertname_specific_query("DiskSpaceLow");
        assert!(query.contains("disk|space|storage"));

        // Unmatched names fall back to the error query
        let query = builder.build_alertname_specific_query("SomethingOdd");
        assert!(query.contains("error|exception"));
    }

    #[test]
    fn hints_enumerate_suggestions() {
        let builder = LogQlQueryBuilder::new(&labels(&[("service", "api")]));
        let hints = builder.get_query_hints("MemoryPressure");
        assert!(hints.contains("Suggested LogQL queries"));
        assert!(hints.contains("memory"));
        assert!(hints.contains("{service=\"api\"}"));
    }

    #[test]
    fn formats_and_sorts_results() {
        let raw = json!({
            "data": {
                "result": [{
                    "stream": {"job": "api"},
                    "values": [
                        ["1700000001000000000", "older"],
                        ["1700000002000000000", "newer"],
                    ],
                }],
            },
        });
        let formatted = format_loki_results(&raw);
        assert_eq!(formatted["streams_count"], 1);
        assert_eq!(formatted["total_entries"], 2);
        let logs = formatted["logs"].as_array().unwrap();
        assert_eq!(logs[0]["message"], "newer");
        assert_eq!(logs[1]["message"], "older");
        assert_eq!(logs[0]["labels"]["job"], "api");
    }

    #[test]
    fn long_messages_truncated() {
        let long = "x".repeat(3000);
        let raw = json!({
            "data": {"result": [{"stream": {}, "values": [["1700000000000000000", long]]}]},
        });
        let formatted = format_loki_results(&raw);
        let message = formatted["logs"][0]["message"].as_str().unwrap();
        assert!(message.len() < 2100);
        assert!(message.ends_with("... [truncated]"));
    }
}
