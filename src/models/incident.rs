//! Incident model and API representations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::HashMap;
use utoipa::ToSchema;

use crate::models::alert::{AlertResponse, AlertSeverity};

/// Incident lifecycle status.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum IncidentStatus {
    Open,
    Analyzing,
    Resolved,
    Closed,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Analyzing => "analyzing",
            Self::Resolved => "resolved",
            Self::Closed => "closed",
        }
    }
}

/// Incident severity, derived as the maximum severity among member alerts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum IncidentSeverity {
    Critical,
    Warning,
    Info,
}

impl IncidentSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Warning => "warning",
            Self::Info => "info",
        }
    }

    pub fn rank(&self) -> u8 {
        match self {
            Self::Critical => 2,
            Self::Warning => 1,
            Self::Info => 0,
        }
    }
}

impl From<AlertSeverity> for IncidentSeverity {
    fn from(s: AlertSeverity) -> Self {
        match s {
            AlertSeverity::Critical => Self::Critical,
            AlertSeverity::Warning => Self::Warning,
            AlertSeverity::Info => Self::Info,
        }
    }
}

/// Incident row: a correlated group of related alerts.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Incident {
    pub id: String,
    pub title: String,
    pub status: IncidentStatus,
    pub severity: IncidentSeverity,
    pub primary_alert_id: Option<String>,
    pub correlation_reason: Option<String>,
    pub affected_services: Json<Vec<String>>,
    pub affected_labels: Json<HashMap<String, String>>,
    pub started_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub rca_completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Incident {
    pub fn affected_label(&self, key: &str) -> Option<&str> {
        self.affected_labels.get(key).map(String::as_str)
    }
}

/// Incident listing row, including the member-alert count.
#[derive(Debug, Clone, FromRow)]
pub struct IncidentWithCount {
    #[sqlx(flatten)]
    pub incident: Incident,
    pub alert_count: i64,
}

/// Incident summary returned by the list API.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct IncidentSummary {
    pub id: String,
    pub title: String,
    pub status: IncidentStatus,
    pub severity: IncidentSeverity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_alert_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_reason: Option<String>,
    pub affected_services: Vec<String>,
    pub affected_labels: HashMap<String, String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rca_completed_at: Option<DateTime<Utc>>,
    pub alert_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<IncidentWithCount> for IncidentSummary {
    fn from(row: IncidentWithCount) -> Self {
        let i = row.incident;
        Self {
            id: i.id,
            title: i.title,
            status: i.status,
            severity: i.severity,
            primary_alert_id: i.primary_alert_id,
            correlation_reason: i.correlation_reason,
            affected_services: i.affected_services.0,
            affected_labels: i.affected_labels.0,
            started_at: i.started_at,
            resolved_at: i.resolved_at,
            rca_completed_at: i.rca_completed_at,
            alert_count: row.alert_count,
            created_at: i.created_at,
            updated_at: i.updated_at,
        }
    }
}

/// Incident detail with full member alerts.
#[derive(Debug, Serialize, ToSchema)]
pub struct IncidentResponse {
    pub id: String,
    pub title: String,
    pub status: IncidentStatus,
    pub severity: IncidentSeverity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_alert_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_reason: Option<String>,
    pub affected_services: Vec<String>,
    pub affected_labels: HashMap<String, String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rca_completed_at: Option<DateTime<Utc>>,
    pub alerts: Vec<AlertResponse>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IncidentResponse {
    pub fn from_parts(incident: Incident, alerts: Vec<AlertResponse>) -> Self {
        Self {
            id: incident.id,
            title: incident.title,
            status: incident.status,
            severity: incident.severity,
            primary_alert_id: incident.primary_alert_id,
            correlation_reason: incident.correlation_reason,
            affected_services: incident.affected_services.0,
            affected_labels: incident.affected_labels.0,
            started_at: incident.started_at,
            resolved_at: incident.resolved_at,
            rca_completed_at: incident.rca_completed_at,
            alerts,
            created_at: incident.created_at,
            updated_at: incident.updated_at,
        }
    }
}

/// Paginated incident listing.
#[derive(Debug, Serialize, ToSchema)]
pub struct IncidentListResponse {
    pub incidents: Vec<IncidentSummary>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Request body for manual alert-to-incident correlation.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ManualCorrelationRequest {
    pub alert_ids: Vec<uuid::Uuid>,
}

/// Response for manual correlation.
#[derive(Debug, Serialize, ToSchema)]
pub struct ManualCorrelationResponse {
    pub incident_id: String,
    pub correlated_alerts: usize,
    pub correlation_reason: Option<String>,
}

/// Response for the stuck-incident admin reset.
#[derive(Debug, Serialize, ToSchema)]
pub struct ResetStuckResponse {
    pub reset_count: u64,
}
