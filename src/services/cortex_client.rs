//! Cortex client for querying metrics via PromQL.

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

use crate::config::ObservabilityConfig;
use crate::services::BackendError;

/// Ranking method used when downsampling high-cardinality results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Avg,
    Max,
    Min,
    Sum,
    Latest,
}

impl Aggregation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Avg => "avg",
            Self::Max => "max",
            Self::Min => "min",
            Self::Sum => "sum",
            Self::Latest => "latest",
        }
    }
}

/// A point flagged by z-score anomaly detection.
#[derive(Debug, Clone, PartialEq)]
pub struct Anomaly {
    pub timestamp: f64,
    pub value: f64,
    pub z_score: f64,
    pub metric: Value,
}

/// Async client for the Cortex (Prometheus-compatible) HTTP API.
pub struct CortexClient {
    base_url: String,
    http: Client,
}

impl CortexClient {
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
        Self::new(&config.cortex_url, config.cortex_timeout_seconds)
    }

    /// Execute a PromQL range query. Timestamps use second epochs.
    pub async fn range_query(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: &str,
    ) -> Result<Value, BackendError> {
        tracing::debug!("Executing Cortex query: {} ({} to {}, step {})", query, start, end, step);

        let response = self
            .http
            .get(format!("{}/api/prom/query_range", self.base_url))
            .query(&[
                ("query", query.to_string()),
                ("start", start.timestamp().to_string()),
                ("end", end.timestamp().to_string()),
                ("step", step.to_string()),
            ])
            .send()
            .await?;

        let result = Self::check_json(response).await?;

        if let Some(series) = result["data"]["result"].as_array() {
            tracing::debug!("Query returned {} series", series.len());
        }

        Ok(result)
    }

    /// Execute a PromQL instant query.
    pub async fn instant_query(
        &self,
        query: &str,
        time: Option<DateTime<Utc>>,
    ) -> Result<Value, BackendError> {
        let mut params = vec![("query", query.to_string())];
        if let Some(t) = time {
            params.push(("time", t.timestamp().to_string()));
        }

        let response = self
            .http
            .get(format!("{}/api/prom/query", self.base_url))
            .query(&params)
            .send()
            .await?;
        Self::check_json(response).await
    }

    /// Find series by label matchers.
    pub async fn series(&self, matchers: &[String]) -> Result<Value, BackendError> {
        let params: Vec<(&str, &str)> =
            matchers.iter().map(|m| ("match[]", m.as_str())).collect();
        let response = self
            .http
            .get(format!("{}/api/prom/series", self.base_url))
            .query(&params)
            .send()
            .await?;
        let result = Self::check_json(response).await?;
        Ok(result["data"].clone())
    }

    /// Get all label names.
    pub async fn labels(&self) -> Result<Vec<String>, BackendError> {
        let response = self
            .http
            .get(format!("{}/api/prom/labels", self.base_url))
            .send()
            .await?;
        let result = Self::check_json(response).await?;
        Ok(Self::string_list(&result["data"]))
    }

    /// Get values for a specific label.
    pub async fn label_values(&self, label: &str) -> Result<Vec<String>, BackendError> {
        let response = self
            .http
            .get(format!("{}/api/prom/label/{}/values", self.base_url, label))
            .send()
            .await?;
        let result = Self::check_json(response).await?;
        Ok(Self::string_list(&result["data"]))
    }

    /// Check whether Cortex is ready to accept queries.
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

    /// Build a PromQL label selector from a map.
    pub fn build_label_selector(labels: &HashMap<String, String>) -> String {
        if labels.is_empty() {
            return "{}".to_string();
        }
        let mut filters: Vec<String> =
            labels.iter().map(|(k, v)| format!("{}=\"{}\"", k, v)).collect();
        filters.sort();
        format!("{{{}}}", filters.join(", "))
    }

    /// CPU utilization percentage query, optionally filtered by instance.
    pub fn build_cpu_query(instance: Option<&str>) -> String {
        let selector = match instance {
            Some(i) => format!("mode=\"idle\", instance=\"{}\"", i),
            None => "mode=\"idle\"".to_string(),
        };
        format!(
            "100 * (1 - avg by (instance) (rate(node_cpu_seconds_total{{{}}}[5m])))",
            selector
        )
    }

    /// Memory utilization percentage query, optionally filtered by instance.
    pub fn build_memory_query(instance: Option<&str>) -> String {
        let selector = match instance {
            Some(i) => format!("{{instance=\"{}\"}}", i),
            None => String::new(),
        };
        format!(
            "100 * (1 - (node_memory_MemAvailable_bytes{} / node_memory_MemTotal_bytes{}))",
            selector, selector
        )
    }

    /// HTTP 5xx error-rate query, optionally filtered by service.
    pub fn build_error_rate_query(service: Option<&str>) -> String {
        match service {
            Some(s) => format!(
                "sum(rate(http_requests_total{{status=~\"5..\", service=\"{}\"}}[5m])) / sum(rate(http_requests_total{{service=\"{}\"}}[5m]))",
                s, s
            ),
            None => "sum(rate(http_requests_total{status=~\"5..\"}[5m])) / sum(rate(http_requests_total[5m]))".to_string(),
        }
    }

    /// Parse the value half of a `[timestamp, value]` sample; "NaN" is dropped.
    fn point_value(v: &Value) -> Option<f64> {
        match &v[1] {
            Value::String(s) if s == "NaN" => None,
            Value::String(s) => s.parse().ok(),
            other => other.as_f64(),
        }
    }

    fn numeric_values(series: &Value) -> Vec<f64> {
        series["values"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(Self::point_value)
            .collect()
    }

    /// Downsample to the top `max_series` ranked by the aggregation method and
    /// attach `_summary` statistics to every kept series.
    pub fn aggregate_results(results: &Value, aggregation: Aggregation, max_series: usize) -> Value {
        let series_list = match results["data"]["result"].as_array() {
            Some(s) => s.clone(),
            None => return results.clone(),
        };

        if series_list.len() <= max_series {
            return Self::add_summaries(results.clone());
        }

        let mut scored: Vec<(f64, Value)> = series_list
            .iter()
            .map(|s| {
                let values = Self::numeric_values(s);
                let score = if values.is_empty() {
                    0.0
                } else {
                    match aggregation {
                        Aggregation::Max | Aggregation::Sum => {
                            values.iter().cloned().fold(f64::MIN, f64::max)
                        }
                        Aggregation::Min => -values.iter().cloned().fold(f64::MAX, f64::min),
                        Aggregation::Avg | Aggregation::Latest => {
                            values.iter().sum::<f64>() / values.len() as f64
                        }
                    }
                };
                (score, s.clone())
            })
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        let kept: Vec<Value> = scored.into_iter().take(max_series).map(|(_, s)| s).collect();

        let sampled = json!({
            "status": results["status"],
            "data": {
                "resultType": results["data"]["resultType"],
                "result": kept,
            },
            "_aggregation": {
                "original_series": series_list.len(),
                "kept_series": std::cmp::min(max_series, series_list.len()),
                "method": aggregation.as_str(),
            },
        });

        Self::add_summaries(sampled)
    }

    /// Attach `_summary` {min,max,avg,latest,count} to each series in place.
    pub fn add_summaries(mut results: Value) -> Value {
        if let Some(series_list) = results["data"]["result"].as_array_mut() {
            for series in series_list {
                let values = Self::numeric_values(series);
                let summary = if values.is_empty() {
                    json!({"min": null, "max": null, "avg": null, "latest": null, "count": 0})
                } else {
                    json!({
                        "min": values.iter().cloned().fold(f64::MAX, f64::min),
                        "max": values.iter().cloned().fold(f64::MIN, f64::max),
                        "avg": values.iter().sum::<f64>() / values.len() as f64,
                        "latest": values[values.len() - 1],
                        "count": values.len(),
                    })
                };
                series["_summary"] = summary;
            }
        }
        results
    }

    /// Rate of change per second over a series' (timestamp, value) pairs.
    pub fn compute_rate_of_change(values: &Value) -> Option<f64> {
        let pairs: Vec<(f64, f64)> = values
            .as_array()?
            .iter()
            .filter_map(|v| Some((v[0].as_f64()?, Self::point_value(v)?)))
            .collect();

        if pairs.len() < 2 {
            return None;
        }

        let (first_ts, first_val) = pairs[0];
        let (last_ts, last_val) = pairs[pairs.len() - 1];
        let time_diff = last_ts - first_ts;
        if time_diff <= 0.0 {
            return None;
        }
        Some((last_val - first_val) / time_diff)
    }

    /// Flag points whose z-score exceeds the threshold (default 2.0).
    pub fn detect_anomalies(results: &Value, threshold_std: f64) -> Vec<Anomaly> {
        let mut anomalies = Vec::new();

        let series_list = match results["data"]["result"].as_array() {
            Some(s) => s,
            None => return anomalies,
        };

        for series in series_list {
            let pairs: Vec<(f64, f64)> = series["values"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|v| Some((v[0].as_f64()?, Self::point_value(v)?)))
                .collect();

            if pairs.len() < 3 {
                continue;
            }

            let values: Vec<f64> = pairs.iter().map(|(_, v)| *v).collect();
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            let variance =
                values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
            let std = variance.sqrt();

            if std == 0.0 {
                continue;
            }

            for (ts, val) in pairs {
                let z_score = (val - mean).abs() / std;
                if z_score > threshold_std {
                    anomalies.push(Anomaly {
                        timestamp: ts,
                        value: val,
                        z_score,
                        metric: series.get("metric").cloned().unwrap_or(json!({})),
                    });
                }
            }
        }

        anomalies
    }
}
