//! Loki client for querying logs via LogQL.

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

use crate::config::ObservabilityConfig;
use crate::services::BackendError;

/// Log entries matching any of these substrings are kept preferentially by
/// priority sampling.
const ERROR_PATTERNS: [&str; 6] = ["error", "exception", "fail", "fatal", "panic", "critical"];

/// Sampling strategy applied when a query returns more entries than the cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleStrategy {
    /// Keep error-looking entries first, then fill with the rest.
    Priority,
    /// Evenly stride-sample a per-stream quota.
    Even,
    /// First N entries across streams in order.
    Head,
    /// Last N entries across streams in order.
    Tail,
}

impl SampleStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Priority => "priority",
            Self::Even => "even",
            Self::Head => "head",
            Self::Tail => "tail",
        }
    }
}

/// Async client for the Loki HTTP API.
pub struct LokiClient {
    base_url: String,
    http: Client,
}

impl LokiClient {
    pub fn new(base_url: &str, timeout_seconds: u64) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    pub fn from_config(config: &ObservabilityConfig) -> Self {
        Self::new(&config.loki_url, config.loki_timeout_seconds)
    }

    /// Execute a LogQL range query.
    ///
    /// Timestamps are converted to nanosecond epochs, Loki's native format.
    pub async fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: u32,
        direction: &str,
    ) -> Result<Value, BackendError> {
        let start_ns = start.timestamp_nanos_opt().unwrap_or(0);
        let end_ns = end.timestamp_nanos_opt().unwrap_or(0);

        tracing::debug!("Executing Loki query: {} ({} to {})", query, start, end);

        let response = self
            .http
            .get(format!("{}/loki/api/v1/query_range", self.base_url))
            .query(&[
                ("query", query.to_string()),
                ("start", start_ns.to_string()),
                ("end", end_ns.to_string()),
                ("limit", limit.to_string()),
                ("direction", direction.to_string()),
            ])
            .send()
            .await?;

        let result = Self::check_json(response).await?;

        if let Some(streams) = result["data"]["result"].as_array() {
            let total: usize = streams
                .iter()
                .map(|s| s["values"].as_array().map(Vec::len).unwrap_or(0))
                .sum();
            tracing::debug!("Query returned {} streams, {} entries", streams.len(), total);
        }

        Ok(result)
    }

    /// Execute a LogQL instant query.
    pub async fn query_instant(
        &self,
        query: &str,
        time: Option<DateTime<Utc>>,
    ) -> Result<Value, BackendError> {
        let mut params = vec![("query", query.to_string())];
        if let Some(t) = time {
            params.push(("time", t.timestamp_nanos_opt().unwrap_or(0).to_string()));
        }

        let response = self
            .http
            .get(format!("{}/loki/api/v1/query", self.base_url))
            .query(&params)
            .send()
            .await?;
        Self::check_json(response).await
    }

    /// Get all label names.
    pub async fn labels(&self) -> Result<Vec<String>, BackendError> {
        let response = self
            .http
            .get(format!("{}/loki/api/v1/labels", self.base_url))
            .send()
            .await?;
        let result = Self::check_json(response).await?;
        Ok(Self::string_list(&result["data"]))
    }

    /// Get values for a specific label.
    pub async fn label_values(&self, label: &str) -> Result<Vec<String>, BackendError> {
        let response = self
            .http
            .get(format!("{}/loki/api/v1/label/{}/values", self.base_url, label))
            .send()
            .await?;
        let result = Self::check_json(response).await?;
        Ok(Self::string_list(&result["data"]))
    }

    /// Check whether Loki is ready to accept queries.
    pub async fn ready(&self) -> bool {
        match self
            .http
            .get(format!("{}/ready", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn check_json(response: reqwest::Response) -> Result<Value, BackendError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }

    fn string_list(value: &Value) -> Vec<String> {
        value
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Build a LogQL label selector from a map, e.g. `{service="api"}`.
    pub fn build_label_filter(labels: &HashMap<String, String>) -> String {
        if labels.is_empty() {
            return "{}".to_string();
        }
        let mut filters: Vec<String> =
            labels.iter().map(|(k, v)| format!("{}=\"{}\"", k, v)).collect();
        filters.sort();
        format!("{{{}}}", filters.join(", "))
    }

    /// Build a LogQL query matching error-looking log lines.
    pub fn build_error_query(labels: &HashMap<String, String>) -> String {
        format!(
            "{} |~ \"(?i)(error|exception|fail|fatal)\"",
            Self::build_label_filter(labels)
        )
    }

    /// Sample log results when the entry count exceeds `max_entries`.
    ///
    /// Returns the input unchanged when no sampling is needed; otherwise the
    /// result carries a `_sampling` block describing what was dropped.
    pub fn sample_results(results: &Value, max_entries: usize, strategy: SampleStrategy) -> Value {
        let streams = match results["data"]["result"].as_array() {
            Some(s) => s.clone(),
            None => return results.clone(),
        };

        let total_entries: usize = streams
            .iter()
            .map(|s| s["values"].as_array().map(Vec::len).unwrap_or(0))
            .sum();

        if total_entries <= max_entries {
            return results.clone();
        }

        let sampled_streams = match strategy {
            SampleStrategy::Priority => Self::sample_priority(&streams, max_entries),
            SampleStrategy::Even => Self::sample_even(&streams, max_entries),
            SampleStrategy::Head => Self::sample_sequential(&streams, max_entries, false),
            SampleStrategy::Tail => Self::sample_sequential(&streams, max_entries, true),
        };

        let sampled_total: usize = sampled_streams
            .iter()
            .map(|s| s["values"].as_array().map(Vec::len).unwrap_or(0))
            .sum();

        json!({
            "status": results["status"],
            "data": {
                "resultType": results["data"]["resultType"],
                "result": sampled_streams,
                "stats": results["data"].get("stats").cloned().unwrap_or(json!({})),
            },
            "_sampling": {
                "original_entries": total_entries,
                "sampled_entries": sampled_total,
                "strategy": strategy.as_str(),
            },
        })
    }

    fn sample_priority(streams: &[Value], max_entries: usize) -> Vec<Value> {
        struct Entry {
            timestamp: String,
            message: String,
            labels: Value,
        }

        let mut error_entries = Vec::new();
        let mut other_entries = Vec::new();

        for stream in streams {
            let labels = stream.get("stream").cloned().unwrap_or(json!({}));
            for value in stream["values"].as_array().into_iter().flatten() {
                let timestamp = value[0].as_str().unwrap_or_default().to_string();
                let message = value[1].as_str().unwrap_or_default().to_string();
                let entry = Entry {
                    timestamp,
                    message,
                    labels: labels.clone(),
                };
                let lower = entry.message.to_lowercase();
                if ERROR_PATTERNS.iter().any(|p| lower.contains(p)) {
                    error_entries.push(entry);
                } else {
                    other_entries.push(entry);
                }
            }
        }

        let mut kept: Vec<Entry> = error_entries.into_iter().take(max_entries).collect();
        let remaining = max_entries.saturating_sub(kept.len());
        kept.extend(other_entries.into_iter().take(remaining));
        kept.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        // Regroup by label set, preserving the stream structure
        let mut groups: Vec<(String, Value, Vec<Value>)> = Vec::new();
        for entry in kept {
            let key = entry.labels.to_string();
            let value = json!([entry.timestamp, entry.message]);
            match groups.iter_mut().find(|(k, _, _)| *k == key) {
                Some((_, _, values)) => values.push(value),
                None => groups.push((key, entry.labels, vec![value])),
            }
        }

        groups
            .into_iter()
            .map(|(_, labels, values)| json!({"stream": labels, "values": values}))
            .collect()
    }

    fn sample_even(streams: &[Value], max_entries: usize) -> Vec<Value> {
        let per_stream = if streams.is_empty() {
            max_entries
        } else {
            std::cmp::max(1, max_entries / streams.len())
        };

        streams
            .iter()
            .map(|stream| {
                let values = stream["values"].as_array().cloned().unwrap_or_default();
                if values.len() <= per_stream {
                    stream.clone()
                } else {
                    let step = values.len() as f64 / per_stream as f64;
                    let sampled: Vec<Value> = (0..per_stream)
                        .map(|i| values[(i as f64 * step) as usize].clone())
                        .collect();
                    json!({
                        "stream": stream.get("stream").cloned().unwrap_or(json!({})),
                        "values": sampled,
                    })
                }
            })
            .collect()
    }

    fn sample_sequential(streams: &[Value], max_entries: usize, from_tail: bool) -> Vec<Value> {
        let mut kept = 0usize;
        let mut result = Vec::new();
        for stream in streams {
            if kept >= max_entries {
                break;
            }
            let values = stream["values"].as_array().cloned().unwrap_or_default();
            let take = std::cmp::min(values.len(), max_entries - kept);
            let slice: Vec<Value> = if from_tail {
                values[values.len() - take..].to_vec()
            } else {
                values[..take].to_vec()
            };
            kept += take;
            result.push(json!({
                "stream": stream.get("stream").cloned().unwrap_or(json!({})),
                "values": slice,
            }));
        }
        result
    }
}
