//! Cortex query tool for the RCA agent.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;

use crate::services::cache;
use crate::services::cortex_client::CortexClient;
use crate::services::llm::ToolDefinition;

const DEFAULT_STEP: &str = "60s";
const MAX_DATA_POINTS: usize = 100;

/// Tool descriptor declared to the LLM.
pub fn tool_definition() -> ToolDefinition {
    ToolDefinition {
        name: "query_cortex".to_string(),
        description: "Query metrics from Cortex using PromQL. Use this tool to retrieve metric \
                      data for performance analysis. Returns time series data with labels and \
                      values."
            .to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "promql_query": {
                    "type": "string",
                    "description": "PromQL query string. Examples:\n- 'up{job=\"api\"}' - service availability\n- 'rate(http_requests_total[5m])' - request rate\n- 'histogram_quantile(0.95, rate(http_request_duration_seconds_bucket[5m]))' - p95 latency\n- '100 * (1 - avg(rate(node_cpu_seconds_total{mode=\"idle\"}[5m])))' - CPU usage",
                },
                "start_time": {
                    "type": "string",
                    "description": "ISO 8601 start time for metric range (e.g., '2025-01-15T10:00:00Z')",
                },
                "end_time": {
                    "type": "string",
                    "description": "ISO 8601 end time for metric range (e.g., '2025-01-15T10:30:00Z')",
                },
                "step": {
                    "type": "string",
                    "description": "Query resolution step (default: '60s'). Use larger steps for longer time ranges.",
                    "default": "60s",
                },
            },
            "required": ["promql_query", "start_time", "end_time"],
        }),
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Execute a Cortex query and return results shaped for the LLM.
pub async fn execute_query_cortex(client: &CortexClient, args: &Value) -> Value {
    let promql_query = match args["promql_query"].as_str() {
        Some(q) => q.to_string(),
        None => {
            return json!({"success": false, "error": "missing required argument: promql_query"})
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
                "query": promql_query,
            })
        }
    };

    let step = args["step"].as_str().unwrap_or(DEFAULT_STEP).to_string();
    let cache_extra = format!("step={}", step);

    let cached = cache::global()
        .lock()
        .ok()
        .and_then(|mut c| c.get_cortex(&promql_query, &start_time, &end_time, &cache_extra));

    let result = match cached {
        Some(hit) => hit,
        None => match client.range_query(&promql_query, start, end, &step).await {
            Ok(result) => {
                if let Ok(mut c) = cache::global().lock() {
                    c.set_cortex(&promql_query, &start_time, &end_time, &cache_extra, result.clone(), None);
                }
                result
            }
            Err(e) => {
                tracing::warn!("Cortex query failed: {}", e);
                return json!({
                    "success": false,
                    "error": e.to_string(),
                    "query": promql_query,
                    "time_range": {"start": start_time, "end": end_time},
                });
            }
        },
    };

    let formatted = format_cortex_results(&result);

    json!({
        "success": true,
        "query": promql_query,
        "time_range": {"start": start_time, "end": end_time},
        "step": step,
        "series_count": formatted["series_count"],
        "metrics": formatted["metrics"],
    })
}

/// Convert raw Cortex series into labeled data points with per-series
/// summary statistics, capped at the last 100 points per series.
pub fn format_cortex_results(result: &Value) -> Value {
    let mut metrics: Vec<Value> = Vec::new();
    let mut series_count = 0;

    if let Some(series_list) = result["data"]["result"].as_array() {
        series_count = series_list.len();

        for series in series_list {
            let metric_labels = series.get("metric").cloned().unwrap_or(json!({}));
            let values = series["values"].as_array().cloned().unwrap_or_default();

            let mut data_points: Vec<Value> = Vec::new();
            let mut numeric_values: Vec<f64> = Vec::new();
            for pair in &values {
                let ts = pair[0].as_f64().unwrap_or(0.0);
                let dt = DateTime::<Utc>::from_timestamp(ts as i64, 0).unwrap_or_else(Utc::now);
                let value = match &pair[1] {
                    Value::String(s) if s == "NaN" => None,
                    Value::String(s) => s.parse::<f64>().ok(),
                    other => other.as_f64(),
                };
                if let Some(v) = value {
                    numeric_values.push(v);
                }
                data_points.push(json!({
                    "timestamp": dt.to_rfc3339(),
                    "value": value,
                }));
            }

            let summary = if numeric_values.is_empty() {
                json!({})
            } else {
                json!({
                    "min": numeric_values.iter().cloned().fold(f64::MAX, f64::min),
                    "max": numeric_values.iter().cloned().fold(f64::MIN, f64::max),
                    "avg": numeric_values.iter().sum::<f64>() / numeric_values.len() as f64,
                    "latest": numeric_values[numeric_values.len() - 1],
                })
            };

            let total_points = data_points.len();
            let tail: Vec<Value> = data_points
                .into_iter()
                .skip(total_points.saturating_sub(MAX_DATA_POINTS))
                .collect();

            metrics.push(json!({
                "labels": metric_labels,
                "data_points": tail,
                "total_points": total_points,
                "summary": summary,
            }));
        }
    }

    json!({"metrics": metrics, "series_count": series_count})
}

/// Metric-query templates keyed by alert-name substrings. `SELECTOR` is
/// replaced with the label selector derived from the alert.
const ALERT_METRIC_PATTERNS: [(&str, &[(&str, &str)]); 7] = [
    (
        "disk",
        &[
            (
                "100 - (node_filesystem_avail_bytes{SELECTOR} / node_filesystem_size_bytes{SELECTOR} * 100)",
                "Disk usage percentage",
            ),
            ("node_filesystem_avail_bytes{SELECTOR}", "Available disk space"),
        ],
    ),
    (
        "memory",
        &[
            (
                "100 * (1 - node_memory_MemAvailable_bytes{SELECTOR} / node_memory_MemTotal_bytes{SELECTOR})",
                "Memory usage percentage",
            ),
            ("container_memory_working_set_bytes{SELECTOR}", "Container memory usage"),
        ],
    ),
    (
        "cpu",
        &[
            (
                "100 * (1 - avg(rate(node_cpu_seconds_total{mode=\"idle\",SELECTOR}[5m])))",
                "Node CPU usage",
            ),
            (
                "sum(rate(container_cpu_usage_seconds_total{SELECTOR}[5m])) by (container)",
                "Container CPU usage",
            ),
        ],
    ),
    (
        "network",
        &[
            ("rate(node_network_receive_bytes_total{SELECTOR}[5m])", "Network receive rate"),
            ("rate(node_network_transmit_bytes_total{SELECTOR}[5m])", "Network transmit rate"),
        ],
    ),
    (
        "error",
        &[
            ("sum(rate(http_requests_total{status=~\"5..\",SELECTOR}[5m]))", "5xx error rate"),
            ("sum(rate(http_requests_total{status=~\"4..\",SELECTOR}[5m]))", "4xx error rate"),
        ],
    ),
    (
        "latency",
        &[
            (
                "histogram_quantile(0.95, rate(http_request_duration_seconds_bucket{SELECTOR}[5m]))",
                "P95 latency",
            ),
            (
                "histogram_quantile(0.99, rate(http_request_duration_seconds_bucket{SELECTOR}[5m]))",
                "P99 latency",
            ),
        ],
    ),
    (
        "availability",
        &[
            ("up{SELECTOR}", "Service availability"),
            ("sum(up{SELECTOR}) / count(up{SELECTOR})", "Availability ratio"),
        ],
    ),
];

/// Context-aware PromQL query builder.
pub struct PromQlQueryBuilder {
    labels: HashMap<String, String>,
}

impl PromQlQueryBuilder {
    /// Labels useful for metric filtering.
    const FILTER_LABELS: [&'static str; 8] =
        ["service", "namespace", "pod", "container", "job", "app", "instance", "node"];

    /// Labels excluded from the fallback selector.
    const EXCLUDE_LABELS: [&'static str; 3] = ["alertname", "severity", "__name__"];

    pub fn new(labels: &HashMap<String, String>) -> Self {
        Self { labels: labels.clone() }
    }

    /// Bare label selector (no braces) derived from the alert's labels.
    pub fn build_label_selector(&self) -> String {
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

        query_labels
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, v))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Substitute the selector into a query template.
    pub fn apply_selector(&self, query_template: &str) -> String {
        let selector = self.build_label_selector();
        query_template.replace("SELECTOR", &selector)
    }

    /// Queries matched to the failure class the alert name suggests, plus a
    /// general availability check.
    pub fn build_alertname_specific_queries(&self, alertname: &str) -> Vec<(String, String)> {
        let alertname_lower = alertname.to_lowercase();
        let mut queries = Vec::new();

        for (pattern_key, patterns) in ALERT_METRIC_PATTERNS {
            if alertname_lower.contains(pattern_key) {
                for (template, description) in patterns.iter() {
                    queries.push((self.apply_selector(template), description.to_string()));
                }
            }
        }

        queries.push((self.apply_selector("up{SELECTOR}"), "Service availability".to_string()));
        queries
    }

    pub fn suggest_queries(&self, alertname: &str) -> Vec<(String, String)> {
        let mut suggestions = self.build_alertname_specific_queries(alertname);

        if let Some(service) = self.labels.get("service") {
            suggestions.push((
                format!(
                    "sum(rate(http_requests_total{{service=\"{}\",status=~\"5..\"}}[5m])) / sum(rate(http_requests_total{{service=\"{}\"}}[5m]))",
                    service, service
                ),
                format!("Error rate for {}", service),
            ));
        }

        suggestions
    }

    /// Rendered query hints for the initial prompt.
    pub fn get_query_hints(&self, alertname: &str) -> String {
        let mut hints = vec!["Suggested PromQL queries for this alert:".to_string()];
        for (i, (query, description)) in self.suggest_queries(alertname).iter().enumerate() {
            hints.push(format!("  {}. {}:", i + 1, description));
            hints.push(format!("     {}", query));
        }
        hints.join("\n")
    }
}
