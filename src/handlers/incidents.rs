//! Incident read API, manual correlation, and admin recovery.

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use utoipa::IntoParams;
use uuid::Uuid;

use crate::handlers::alerts::{parse_alert_severity, validate_pagination};
use crate::models::{
    AlertResponse, IncidentListResponse, IncidentResponse, IncidentStatus, IncidentSummary,
    ManualCorrelationRequest, ManualCorrelationResponse, ResetStuckResponse,
};
use crate::services::incident_service::IncidentFilters;
use crate::utils::{ApiError, ApiResult};
use crate::AppState;

#[derive(Debug, Deserialize, IntoParams)]
pub struct IncidentListQuery {
    pub status: Option<String>,
    pub severity: Option<String>,
    pub service: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

fn parse_incident_status(value: Option<&str>) -> ApiResult<Option<IncidentStatus>> {
    match value {
        None => Ok(None),
        Some("open") => Ok(Some(IncidentStatus::Open)),
        Some("analyzing") => Ok(Some(IncidentStatus::Analyzing)),
        Some("resolved") => Ok(Some(IncidentStatus::Resolved)),
        Some("closed") => Ok(Some(IncidentStatus::Closed)),
        Some(other) => Err(ApiError::validation(format!("invalid incident status: {}", other))),
    }
}

/// List incidents with optional filtering; each row carries `alert_count`.
/// GET /api/v1/incidents
#[utoipa::path(
    get,
    path = "/api/v1/incidents",
    tag = "incidents",
    params(IncidentListQuery),
    responses(
        (status = 200, description = "Paginated incidents", body = IncidentListResponse),
        (status = 422, description = "Invalid filter"),
    ),
)]
pub async fn list_incidents(
    State(state): State<Arc<AppState>>,
    Query(query): Query<IncidentListQuery>,
) -> ApiResult<impl IntoResponse> {
    let (limit, offset) = validate_pagination(query.limit, query.offset)?;
    let filters = IncidentFilters {
        status: parse_incident_status(query.status.as_deref())?,
        severity: parse_alert_severity(query.severity.as_deref())?.map(Into::into),
        service: query.service,
        since: query.since,
        until: query.until,
    };

    let (incidents, total) = state.incident_service.list_incidents(&filters, limit, offset).await?;

    Ok(Json(IncidentListResponse {
        incidents: incidents.into_iter().map(IncidentSummary::from).collect(),
        total,
        limit,
        offset,
    }))
}

/// Fetch an incident with its full member alerts.
/// GET /api/v1/incidents/{id}
#[utoipa::path(
    get,
    path = "/api/v1/incidents/{id}",
    tag = "incidents",
    params(("id" = Uuid, Path, description = "Incident id")),
    responses(
        (status = 200, description = "Incident detail", body = IncidentResponse),
        (status = 404, description = "Not found"),
    ),
)]
pub async fn get_incident(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let incident_id = id.to_string();
    let incident = state
        .incident_service
        .get(&incident_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("incident {} not found", id)))?;

    let alerts = state.alert_service.list_by_incident(&incident_id).await?;
    let alerts = alerts.into_iter().map(AlertResponse::from).collect();

    Ok(Json(IncidentResponse::from_parts(incident, alerts)))
}

/// Member alerts of an incident, ordered by start time ascending.
/// GET /api/v1/incidents/{id}/alerts
#[utoipa::path(
    get,
    path = "/api/v1/incidents/{id}/alerts",
    tag = "incidents",
    params(("id" = Uuid, Path, description = "Incident id")),
    responses(
        (status = 200, description = "Member alerts", body = Vec<AlertResponse>),
        (status = 404, description = "Not found"),
    ),
)]
pub async fn get_incident_alerts(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let incident_id = id.to_string();
    state
        .incident_service
        .get(&incident_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("incident {} not found", id)))?;

    let alerts = state.alert_service.list_by_incident(&incident_id).await?;
    let alerts: Vec<AlertResponse> = alerts.into_iter().map(AlertResponse::from).collect();
    Ok(Json(alerts))
}

/// Manually attach alerts to an incident. Unknown alert ids are skipped.
/// POST /api/v1/incidents/{id}/correlate
#[utoipa::path(
    post,
    path = "/api/v1/incidents/{id}/correlate",
    tag = "incidents",
    params(("id" = Uuid, Path, description = "Incident id")),
    request_body = ManualCorrelationRequest,
    responses(
        (status = 200, description = "Alerts correlated", body = ManualCorrelationResponse),
        (status = 404, description = "Not found"),
    ),
)]
pub async fn correlate_alerts(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<ManualCorrelationRequest>,
) -> ApiResult<impl IntoResponse> {
    if request.alert_ids.is_empty() {
        return Err(ApiError::validation("alert_ids must not be empty"));
    }

    let incident_id = id.to_string();
    let alert_ids: Vec<String> = request.alert_ids.iter().map(Uuid::to_string).collect();

    let incident = state
        .incident_service
        .manual_correlate(&incident_id, &alert_ids)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("incident {} not found", id)))?;

    Ok(Json(ManualCorrelationResponse {
        incident_id,
        correlated_alerts: alert_ids.len(),
        correlation_reason: incident.correlation_reason,
    }))
}

/// Bulk-reset incidents stuck in `analyzing` back to `open` (recovery from
/// orchestrator crashes).
/// POST /api/v1/admin/incidents/reset-stuck
#[utoipa::path(
    post,
    path = "/api/v1/admin/incidents/reset-stuck",
    tag = "admin",
    responses(
        (status = 200, description = "Stuck incidents reset", body = ResetStuckResponse),
    ),
)]
pub async fn reset_stuck_incidents(
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    let reset_count = state.incident_service.reset_stuck_incidents().await?;
    Ok(Json(ResetStuckResponse { reset_count }))
}
