//! RCA report model and API representations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use utoipa::ToSchema;

/// RCA report lifecycle status.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum RcaReportStatus {
    Pending,
    Complete,
    Failed,
}

impl RcaReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

/// RCA report row. One report per incident; deleting the incident cascades.
///
/// `timeline`, `evidence` and `remediation_steps` carry the validated JSON
/// documents produced by the report tool; their shape is enforced at the tool
/// boundary, not by the storage layer.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct RcaReport {
    pub id: String,
    pub incident_id: String,
    pub root_cause: String,
    pub confidence_score: i64,
    pub summary: String,
    pub timeline: Json<serde_json::Value>,
    pub evidence: Json<serde_json::Value>,
    pub remediation_steps: Json<serde_json::Value>,
    pub analysis_metadata: Option<Json<serde_json::Value>>,
    pub status: RcaReportStatus,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// RCA report representation returned by the read API.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RcaReportResponse {
    pub id: String,
    pub incident_id: String,
    pub root_cause: String,
    pub confidence_score: i64,
    pub summary: String,
    #[schema(value_type = Object)]
    pub timeline: serde_json::Value,
    #[schema(value_type = Object)]
    pub evidence: serde_json::Value,
    #[schema(value_type = Object)]
    pub remediation_steps: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub analysis_metadata: Option<serde_json::Value>,
    pub status: RcaReportStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<RcaReport> for RcaReportResponse {
    fn from(r: RcaReport) -> Self {
        Self {
            id: r.id,
            incident_id: r.incident_id,
            root_cause: r.root_cause,
            confidence_score: r.confidence_score,
            summary: r.summary,
            timeline: r.timeline.0,
            evidence: r.evidence.0,
            remediation_steps: r.remediation_steps.0,
            analysis_metadata: r.analysis_metadata.map(|m| m.0),
            status: r.status,
            error_message: r.error_message,
            started_at: r.started_at,
            completed_at: r.completed_at,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

/// Paginated report listing.
#[derive(Debug, Serialize, ToSchema)]
pub struct RcaReportListResponse {
    pub reports: Vec<RcaReportResponse>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}
