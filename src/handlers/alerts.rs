//! Alert read API.

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use utoipa::IntoParams;
use uuid::Uuid;

use crate::models::{AlertListResponse, AlertResponse, AlertSeverity, AlertStatus};
use crate::services::alert_service::AlertFilters;
use crate::utils::{ApiError, ApiResult};
use crate::AppState;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 100;

#[derive(Debug, Deserialize, IntoParams)]
pub struct AlertListQuery {
    pub status: Option<String>,
    pub severity: Option<String>,
    pub service: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub(crate) fn parse_alert_status(value: Option<&str>) -> ApiResult<Option<AlertStatus>> {
    match value {
        None => Ok(None),
        Some("firing") => Ok(Some(AlertStatus::Firing)),
        Some("resolved") => Ok(Some(AlertStatus::Resolved)),
        Some(other) => Err(ApiError::validation(format!("invalid alert status: {}", other))),
    }
}

pub(crate) fn parse_alert_severity(value: Option<&str>) -> ApiResult<Option<AlertSeverity>> {
    match value {
        None => Ok(None),
        Some("critical") => Ok(Some(AlertSeverity::Critical)),
        Some("warning") => Ok(Some(AlertSeverity::Warning)),
        Some("info") => Ok(Some(AlertSeverity::Info)),
        Some(other) => Err(ApiError::validation(format!("invalid severity: {}", other))),
    }
}

pub(crate) fn validate_pagination(limit: Option<i64>, offset: Option<i64>) -> ApiResult<(i64, i64)> {
    let limit = limit.unwrap_or(DEFAULT_LIMIT);
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(ApiError::validation(format!("limit must be in [1, {}]", MAX_LIMIT)));
    }
    let offset = offset.unwrap_or(0);
    if offset < 0 {
        return Err(ApiError::validation("offset must be >= 0"));
    }
    Ok((limit, offset))
}

/// List alerts with optional filtering and pagination.
/// GET /api/v1/alerts
#[utoipa::path(
    get,
    path = "/api/v1/alerts",
    tag = "alerts",
    params(AlertListQuery),
    responses(
        (status = 200, description = "Paginated alerts", body = AlertListResponse),
        (status = 422, description = "Invalid filter"),
    ),
)]
pub async fn list_alerts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AlertListQuery>,
) -> ApiResult<impl IntoResponse> {
    let (limit, offset) = validate_pagination(query.limit, query.offset)?;
    let filters = AlertFilters {
        status: parse_alert_status(query.status.as_deref())?,
        severity: parse_alert_severity(query.severity.as_deref())?,
        service: query.service,
        since: query.since,
        until: query.until,
    };

    let (alerts, total) = state.alert_service.list_alerts(&filters, limit, offset).await?;

    Ok(Json(AlertListResponse {
        alerts: alerts.into_iter().map(AlertResponse::from).collect(),
        total,
        limit,
        offset,
    }))
}

/// Fetch a single alert.
/// GET /api/v1/alerts/{id}
#[utoipa::path(
    get,
    path = "/api/v1/alerts/{id}",
    tag = "alerts",
    params(("id" = Uuid, Path, description = "Alert id")),
    responses(
        (status = 200, description = "Alert", body = AlertResponse),
        (status = 404, description = "Not found"),
    ),
)]
pub async fn get_alert(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let alert = state
        .alert_service
        .get(&id.to_string())
        .await?
        .ok_or_else(|| ApiError::not_found(format!("alert {} not found", id)))?;
    Ok(Json(AlertResponse::from(alert)))
}
