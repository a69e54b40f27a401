//! Alertmanager webhook ingestion pipeline.
//!
//! Parses webhook batches, deduplicates by fingerprint, applies status
//! transitions (including the re-firing policy), hands new alerts to the
//! correlation engine, and auto-resolves incidents whose alerts have all
//! resolved. One bad alert never aborts the batch.

use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::RcaConfig;
use crate::models::{
    Alert, AlertSeverity, AlertStatus, AlertmanagerAlert, AlertmanagerWebhookPayload, Incident,
    IncidentStatus,
};
use crate::services::alert_service::{AlertService, NewAlert};
use crate::services::correlation_service::CorrelationService;
use crate::services::incident_service::IncidentService;
use crate::services::llm::LlmProvider;

/// Result of processing one webhook batch.
#[derive(Debug, Default)]
pub struct WebhookOutcome {
    /// Ids of created or updated alerts.
    pub alert_ids: Vec<String>,
    /// Incidents touched by this batch, in first-touch order.
    pub incident_ids: Vec<String>,
    /// Alerts that parsed and processed without error (duplicates included).
    pub alerts_accepted: usize,
}

pub struct WebhookService {
    alert_service: AlertService,
    incident_service: IncidentService,
    correlation_service: CorrelationService,
}

impl WebhookService {
    pub fn new(pool: SqlitePool, rca: &RcaConfig, llm: Option<Arc<dyn LlmProvider>>) -> Self {
        Self {
            alert_service: AlertService::new(pool.clone()),
            incident_service: IncidentService::new(pool.clone()),
            correlation_service: CorrelationService::new(pool, rca, llm),
        }
    }

    /// Process a webhook payload.
    ///
    /// Alerts are processed in order with per-alert isolation: a malformed or
    /// failing alert is logged and skipped, never aborting the batch.
    pub async fn process_webhook(&self, payload: &AlertmanagerWebhookPayload) -> WebhookOutcome {
        let mut outcome = WebhookOutcome::default();

        for raw_alert in &payload.alerts {
            let am_alert: AlertmanagerAlert = match serde_json::from_value(raw_alert.clone()) {
                Ok(alert) => alert,
                Err(e) => {
                    tracing::warn!("Skipping malformed alert in webhook batch: {}", e);
                    continue;
                }
            };

            match self.process_single_alert(&am_alert).await {
                Ok((mut ids, incident)) => {
                    outcome.alerts_accepted += 1;
                    outcome.alert_ids.append(&mut ids);
                    if let Some(incident_id) = incident {
                        if !outcome.incident_ids.contains(&incident_id) {
                            outcome.incident_ids.push(incident_id);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to process alert {}: {}", am_alert.fingerprint, e);
                }
            }
        }

        outcome
    }

    fn is_unique_violation(error: &sqlx::Error) -> bool {
        matches!(error, sqlx::Error::Database(db) if db.message().contains("UNIQUE"))
    }

    async fn process_single_alert(
        &self,
        am_alert: &AlertmanagerAlert,
    ) -> Result<(Vec<String>, Option<String>), sqlx::Error> {
        let existing = match self.alert_service.get_by_fingerprint(&am_alert.fingerprint).await? {
            None => {
                // New alert: insert and correlate. A concurrent writer racing
                // the same fingerprint loses to the uniqueness constraint and
                // falls back to the update path.
                match self.create_alert(am_alert).await {
                    Ok(alert) => {
                        let (incident, _is_new) = self.ensure_incident(&alert).await?;
                        return Ok((vec![alert.id], Some(incident.id)));
                    }
                    Err(e) if Self::is_unique_violation(&e) => {
                        tracing::debug!(
                            "Fingerprint {} raced a concurrent insert, treating as update",
                            am_alert.fingerprint
                        );
                        self.alert_service
                            .get_by_fingerprint(&am_alert.fingerprint)
                            .await?
                            .ok_or(sqlx::Error::RowNotFound)?
                    }
                    Err(e) => return Err(e),
                }
            }
            Some(existing) => existing,
        };

        let incoming_firing = am_alert.status == crate::models::AlertmanagerStatus::Firing;

        // Re-firing after its incident already resolved: a fresh occurrence
        if existing.status == AlertStatus::Resolved && incoming_firing {
            if let Some(incident_id) = &existing.incident_id {
                let incident = self.incident_service.get(incident_id).await?;
                if incident.map(|i| i.status == IncidentStatus::Resolved).unwrap_or(false) {
                    tracing::info!(
                        "Alert {} re-firing after incident resolved - creating new incident",
                        am_alert.fingerprint
                    );
                    let alert = self.create_alert_with_new_fingerprint(am_alert).await?;
                    let (incident, _) = self.ensure_incident(&alert).await?;
                    return Ok((vec![alert.id], Some(incident.id)));
                }
            }
        }

        // Status transition (firing -> resolved, or resolved -> firing while
        // the incident is still active)
        if existing.status.as_str() != am_alert.status.as_str() {
            self.update_alert_status(&existing, am_alert).await?;
            return Ok((vec![existing.id.clone()], existing.incident_id.clone()));
        }

        tracing::debug!("Duplicate alert ignored: {}", am_alert.fingerprint);
        Ok((Vec::new(), None))
    }

    async fn create_alert(&self, am_alert: &AlertmanagerAlert) -> Result<Alert, sqlx::Error> {
        let severity = am_alert
            .labels
            .get("severity")
            .map(|s| AlertSeverity::parse_or_default(s))
            .unwrap_or(AlertSeverity::Warning);

        let status = match am_alert.status {
            crate::models::AlertmanagerStatus::Firing => AlertStatus::Firing,
            crate::models::AlertmanagerStatus::Resolved => AlertStatus::Resolved,
        };

        let alert = self
            .alert_service
            .create(NewAlert {
                fingerprint: am_alert.fingerprint.clone(),
                alertname: am_alert.alertname().to_string(),
                severity,
                status,
                labels: am_alert.labels.clone(),
                annotations: am_alert.annotations.clone(),
                starts_at: am_alert.starts_at,
                ends_at: am_alert.effective_ends_at(),
                generator_url: am_alert.generator_url.clone(),
            })
            .await?;

        tracing::info!("Created alert: {} ({})", alert.alertname, alert.severity.as_str());
        Ok(alert)
    }

    /// A re-occurring alert gets a fresh row under a suffixed fingerprint so
    /// the uniqueness constraint holds.
    async fn create_alert_with_new_fingerprint(
        &self,
        am_alert: &AlertmanagerAlert,
    ) -> Result<Alert, sqlx::Error> {
        let suffix = Uuid::new_v4().simple().to_string();
        let mut renamed = am_alert.clone();
        renamed.fingerprint = format!("{}_{}", am_alert.fingerprint, &suffix[..8]);
        self.create_alert(&renamed).await
    }

    async fn update_alert_status(
        &self,
        alert: &Alert,
        am_alert: &AlertmanagerAlert,
    ) -> Result<(), sqlx::Error> {
        let new_status = match am_alert.status {
            crate::models::AlertmanagerStatus::Firing => AlertStatus::Firing,
            crate::models::AlertmanagerStatus::Resolved => AlertStatus::Resolved,
        };

        let ends_at = if new_status == AlertStatus::Resolved {
            Some(am_alert.effective_ends_at().unwrap_or_else(Utc::now))
        } else {
            None
        };

        self.alert_service.update_status(&alert.id, new_status, ends_at).await?;
        tracing::info!(
            "Updated alert {}: {} -> {}",
            alert.alertname,
            alert.status.as_str(),
            new_status.as_str()
        );

        if new_status == AlertStatus::Resolved {
            if let Some(incident_id) = &alert.incident_id {
                self.check_incident_resolution(incident_id).await?;
            }
        }
        Ok(())
    }

    /// Auto-resolve: when every alert in the incident is resolved, the
    /// incident resolves too. Idempotent.
    async fn check_incident_resolution(&self, incident_id: &str) -> Result<(), sqlx::Error> {
        let incident = match self.incident_service.get(incident_id).await? {
            Some(i) => i,
            None => {
                tracing::warn!("Incident {} not found for resolution check", incident_id);
                return Ok(());
            }
        };

        let firing = self.alert_service.count_firing_by_incident(incident_id).await?;
        if firing == 0 {
            if incident.status != IncidentStatus::Resolved {
                self.incident_service.transition_to_resolved(incident_id).await?;
                tracing::info!("Incident {} auto-resolved: all alerts are now resolved", incident_id);
            }
        } else {
            tracing::debug!("Incident {} still has {} firing alerts", incident_id, firing);
        }
        Ok(())
    }

    async fn ensure_incident(&self, alert: &Alert) -> Result<(Incident, bool), sqlx::Error> {
        let (incident, is_new) = self.correlation_service.correlate_alert(alert).await?;

        if is_new {
            tracing::info!("Created new incident: {} for alert {}", incident.title, alert.alertname);
        } else {
            tracing::info!(
                "Correlated alert {} with existing incident {} (reason: {})",
                alert.alertname,
                incident.id,
                incident.correlation_reason.as_deref().unwrap_or("-")
            );
        }

        Ok((incident, is_new))
    }
}
