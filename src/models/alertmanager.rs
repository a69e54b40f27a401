//! Alertmanager webhook payload schemas (webhook format version 4).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::ToSchema;

/// Status carried by an Alertmanager alert record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AlertmanagerStatus {
    Firing,
    Resolved,
}

impl AlertmanagerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Firing => "firing",
            Self::Resolved => "resolved",
        }
    }
}

/// A single alert record inside a webhook batch.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AlertmanagerAlert {
    pub status: AlertmanagerStatus,
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(rename = "startsAt")]
    pub starts_at: DateTime<Utc>,
    #[serde(rename = "endsAt", default)]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(rename = "generatorURL", default)]
    pub generator_url: Option<String>,
    pub fingerprint: String,
}

impl AlertmanagerAlert {
    pub fn alertname(&self) -> &str {
        self.labels
            .get("alertname")
            .map(String::as_str)
            .unwrap_or("Unknown")
    }

    /// Alertmanager encodes "not yet ended" as the zero time (year 1).
    pub fn effective_ends_at(&self) -> Option<DateTime<Utc>> {
        use chrono::Datelike;
        self.ends_at.filter(|t| t.year() > 1)
    }
}

/// Alertmanager webhook payload. Unknown top-level fields are ignored.
///
/// Alert records are kept as raw JSON here so one malformed alert can be
/// skipped (with a warning) without rejecting the whole batch.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct AlertmanagerWebhookPayload {
    #[serde(default)]
    pub receiver: String,
    pub status: String,
    #[schema(value_type = Vec<AlertmanagerAlert>)]
    pub alerts: Vec<serde_json::Value>,
    #[serde(rename = "groupLabels", default)]
    pub group_labels: HashMap<String, String>,
    #[serde(rename = "commonLabels", default)]
    pub common_labels: HashMap<String, String>,
    #[serde(rename = "commonAnnotations", default)]
    pub common_annotations: HashMap<String, String>,
    #[serde(rename = "externalURL", default)]
    pub external_url: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(rename = "groupKey", default)]
    pub group_key: Option<String>,
    #[serde(rename = "truncatedAlerts", default)]
    pub truncated_alerts: Option<i64>,
}

/// Synchronous acknowledgement for an accepted webhook batch.
#[derive(Debug, Serialize, ToSchema)]
pub struct WebhookAcceptedResponse {
    pub status: String,
    pub message: String,
    pub alerts_received: usize,
    pub processing_ids: Vec<String>,
}
