//! Alertmanager webhook endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use std::sync::Arc;

use crate::models::{AlertmanagerWebhookPayload, WebhookAcceptedResponse};
use crate::services::rca_agent::run_incident_rca;
use crate::utils::{ApiError, ApiResult};
use crate::AppState;

/// Accept an Alertmanager webhook batch.
///
/// The response returns as soon as ingestion has committed; RCA runs as a
/// detached task per touched incident.
/// POST /webhooks/alertmanager
#[utoipa::path(
    post,
    path = "/webhooks/alertmanager",
    tag = "webhooks",
    request_body = AlertmanagerWebhookPayload,
    responses(
        (status = 202, description = "Batch accepted", body = WebhookAcceptedResponse),
        (status = 422, description = "Invalid payload"),
    ),
)]
pub async fn alertmanager_webhook(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<AlertmanagerWebhookPayload>,
) -> ApiResult<impl IntoResponse> {
    if payload.alerts.is_empty() {
        return Err(ApiError::validation("webhook payload contains no alerts"));
    }

    let outcome = state.webhook_service.process_webhook(&payload).await;

    if outcome.alerts_accepted == 0 {
        return Err(ApiError::validation(
            "no alert in the batch passed schema validation",
        ));
    }

    for incident_id in &outcome.incident_ids {
        tokio::spawn(run_incident_rca(Arc::clone(&state), incident_id.clone()));
    }

    tracing::info!(
        "Webhook accepted: {} alerts, {} incidents queued for RCA",
        outcome.alerts_accepted,
        outcome.incident_ids.len()
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(WebhookAcceptedResponse {
            status: "accepted".to_string(),
            message: format!(
                "Processing {} alerts across {} incidents",
                outcome.alerts_accepted,
                outcome.incident_ids.len()
            ),
            alerts_received: outcome.alerts_accepted,
            processing_ids: outcome.incident_ids,
        }),
    ))
}
