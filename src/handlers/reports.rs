//! RCA report read API and export.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use utoipa::IntoParams;
use uuid::Uuid;

use crate::models::{RcaReportListResponse, RcaReportResponse, RcaReportStatus};
use crate::services::report_service::ReportFilters;
use crate::services::ReportService;
use crate::utils::{ApiError, ApiResult};
use crate::AppState;

use crate::handlers::alerts::validate_pagination;

#[derive(Debug, Deserialize, IntoParams)]
pub struct ReportListQuery {
    pub status: Option<String>,
    pub min_confidence: Option<i64>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

fn parse_report_status(value: Option<&str>) -> ApiResult<Option<RcaReportStatus>> {
    match value {
        None => Ok(None),
        Some("pending") => Ok(Some(RcaReportStatus::Pending)),
        Some("complete") => Ok(Some(RcaReportStatus::Complete)),
        Some("failed") => Ok(Some(RcaReportStatus::Failed)),
        Some(other) => Err(ApiError::validation(format!("invalid report status: {}", other))),
    }
}

/// List RCA reports with optional filtering.
/// GET /api/v1/reports
#[utoipa::path(
    get,
    path = "/api/v1/reports",
    tag = "reports",
    params(ReportListQuery),
    responses(
        (status = 200, description = "Paginated reports", body = RcaReportListResponse),
        (status = 422, description = "Invalid filter"),
    ),
)]
pub async fn list_reports(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReportListQuery>,
) -> ApiResult<impl IntoResponse> {
    let (limit, offset) = validate_pagination(query.limit, query.offset)?;
    let filters = ReportFilters {
        status: parse_report_status(query.status.as_deref())?,
        min_confidence: query.min_confidence,
        since: query.since,
        until: query.until,
    };

    let (reports, total) = state.report_service.list_reports(&filters, limit, offset).await?;

    Ok(Json(RcaReportListResponse {
        reports: reports.into_iter().map(RcaReportResponse::from).collect(),
        total,
        limit,
        offset,
    }))
}

/// Fetch a single report.
/// GET /api/v1/reports/{id}
#[utoipa::path(
    get,
    path = "/api/v1/reports/{id}",
    tag = "reports",
    params(("id" = Uuid, Path, description = "Report id")),
    responses(
        (status = 200, description = "Report", body = RcaReportResponse),
        (status = 404, description = "Not found"),
    ),
)]
pub async fn get_report(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let report = state
        .report_service
        .get(&id.to_string())
        .await?
        .ok_or_else(|| ApiError::not_found(format!("report {} not found", id)))?;
    Ok(Json(RcaReportResponse::from(report)))
}

/// Fetch the report belonging to an incident.
/// GET /api/v1/incidents/{id}/report
#[utoipa::path(
    get,
    path = "/api/v1/incidents/{id}/report",
    tag = "reports",
    params(("id" = Uuid, Path, description = "Incident id")),
    responses(
        (status = 200, description = "Report", body = RcaReportResponse),
        (status = 404, description = "Not found"),
    ),
)]
pub async fn get_incident_report(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let report = state
        .report_service
        .get_by_incident(&id.to_string())
        .await?
        .ok_or_else(|| ApiError::not_found(format!("no report for incident {}", id)))?;
    Ok(Json(RcaReportResponse::from(report)))
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ExportQuery {
    /// Export format: "json" (default) or "markdown"
    pub format: Option<String>,
}

/// Export a report as JSON or rendered Markdown.
/// GET /api/v1/reports/{id}/export
#[utoipa::path(
    get,
    path = "/api/v1/reports/{id}/export",
    tag = "reports",
    params(("id" = Uuid, Path, description = "Report id"), ExportQuery),
    responses(
        (status = 200, description = "Exported report"),
        (status = 404, description = "Not found"),
        (status = 422, description = "Unknown format"),
    ),
)]
pub async fn export_report(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<ExportQuery>,
) -> ApiResult<Response> {
    let report = state
        .report_service
        .get(&id.to_string())
        .await?
        .ok_or_else(|| ApiError::not_found(format!("report {} not found", id)))?;

    match query.format.as_deref().unwrap_or("json") {
        "json" => Ok(Json(RcaReportResponse::from(report)).into_response()),
        "markdown" => {
            let markdown = ReportService::format_as_markdown(&report);
            Ok((
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
                markdown,
            )
                .into_response())
        }
        other => Err(ApiError::validation(format!(
            "unknown export format '{}', expected json or markdown",
            other
        ))),
    }
}
