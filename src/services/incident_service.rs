//! Incident CRUD service and status state machine.

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::collections::HashMap;
use uuid::Uuid;

use crate::models::{Incident, IncidentSeverity, IncidentStatus, IncidentWithCount};

/// Valid status transitions. Anything not listed is a no-op.
pub fn valid_transitions(from: IncidentStatus) -> &'static [IncidentStatus] {
    match from {
        IncidentStatus::Open => &[
            IncidentStatus::Analyzing,
            IncidentStatus::Resolved,
            IncidentStatus::Closed,
        ],
        IncidentStatus::Analyzing => &[
            IncidentStatus::Open,
            IncidentStatus::Resolved,
            IncidentStatus::Closed,
        ],
        IncidentStatus::Resolved => &[IncidentStatus::Open, IncidentStatus::Closed],
        // Allow reopening
        IncidentStatus::Closed => &[IncidentStatus::Open],
    }
}

/// Fields for inserting a new incident row.
#[derive(Debug, Clone)]
pub struct NewIncident {
    pub title: String,
    pub severity: IncidentSeverity,
    pub started_at: DateTime<Utc>,
    pub primary_alert_id: Option<String>,
    pub correlation_reason: Option<String>,
    pub affected_services: Vec<String>,
    pub affected_labels: HashMap<String, String>,
}

/// Filters for the incident listing API.
#[derive(Debug, Clone, Default)]
pub struct IncidentFilters {
    pub status: Option<IncidentStatus>,
    pub severity: Option<IncidentSeverity>,
    pub service: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

pub struct IncidentService {
    pool: SqlitePool,
}

impl IncidentService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, new_incident: NewIncident) -> Result<Incident, sqlx::Error> {
        let id = Uuid::new_v4().to_string();
        let services = serde_json::to_string(&new_incident.affected_services)
            .unwrap_or_else(|_| "[]".to_string());
        let labels = serde_json::to_string(&new_incident.affected_labels)
            .unwrap_or_else(|_| "{}".to_string());

        sqlx::query(
            r#"INSERT INTO incidents
               (id, title, status, severity, primary_alert_id, correlation_reason,
                affected_services, affected_labels, started_at)
               VALUES (?, ?, 'open', ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&id)
        .bind(&new_incident.title)
        .bind(new_incident.severity)
        .bind(&new_incident.primary_alert_id)
        .bind(&new_incident.correlation_reason)
        .bind(&services)
        .bind(&labels)
        .bind(new_incident.started_at)
        .execute(&self.pool)
        .await?;

        self.get(&id).await?.ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn get(&self, incident_id: &str) -> Result<Option<Incident>, sqlx::Error> {
        sqlx::query_as::<_, Incident>("SELECT * FROM incidents WHERE id = ?")
            .bind(incident_id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Open or analyzing incidents whose `started_at` falls inside the window.
    pub async fn find_candidates_in_window(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<Incident>, sqlx::Error> {
        sqlx::query_as::<_, Incident>(
            r#"SELECT * FROM incidents
               WHERE started_at >= ? AND started_at <= ?
                 AND status IN ('open', 'analyzing')"#,
        )
        .bind(window_start)
        .bind(window_end)
        .fetch_all(&self.pool)
        .await
    }

    /// List incidents with optional filtering; rows carry their alert count.
    pub async fn list_incidents(
        &self,
        filters: &IncidentFilters,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<IncidentWithCount>, i64), sqlx::Error> {
        let mut count_query =
            QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM incidents WHERE 1=1");
        Self::push_filters(&mut count_query, filters);
        let total: i64 = count_query.build_query_scalar().fetch_one(&self.pool).await?;

        let mut query = QueryBuilder::<Sqlite>::new(
            r#"SELECT incidents.*, COALESCE(counts.alert_count, 0) AS alert_count
               FROM incidents
               LEFT JOIN (SELECT incident_id, COUNT(*) AS alert_count
                          FROM alerts GROUP BY incident_id) counts
                 ON counts.incident_id = incidents.id
               WHERE 1=1"#,
        );
        Self::push_filters(&mut query, filters);
        query.push(" ORDER BY started_at DESC LIMIT ");
        query.push_bind(limit);
        query.push(" OFFSET ");
        query.push_bind(offset);

        let incidents = query
            .build_query_as::<IncidentWithCount>()
            .fetch_all(&self.pool)
            .await?;
        Ok((incidents, total))
    }

    fn push_filters<'a>(query: &mut QueryBuilder<'a, Sqlite>, filters: &'a IncidentFilters) {
        if let Some(status) = filters.status {
            query.push(" AND incidents.status = ");
            query.push_bind(status);
        }
        if let Some(severity) = filters.severity {
            query.push(" AND incidents.severity = ");
            query.push_bind(severity);
        }
        if let Some(service) = &filters.service {
            query.push(
                " AND EXISTS (SELECT 1 FROM json_each(incidents.affected_services) \
                 WHERE json_each.value = ",
            );
            query.push_bind(service);
            query.push(")");
        }
        if let Some(since) = filters.since {
            query.push(" AND incidents.started_at >= ");
            query.push_bind(since);
        }
        if let Some(until) = filters.until {
            query.push(" AND incidents.started_at <= ");
            query.push_bind(until);
        }
    }

    /// Update an incident's status, validating the transition.
    ///
    /// Returns None when the incident does not exist or the transition is not
    /// in the table (logged as a warning, no mutation).
    pub async fn update_status(
        &self,
        incident_id: &str,
        status: IncidentStatus,
    ) -> Result<Option<Incident>, sqlx::Error> {
        let incident = match self.get(incident_id).await? {
            Some(i) => i,
            None => return Ok(None),
        };

        if status != incident.status && !valid_transitions(incident.status).contains(&status) {
            tracing::warn!(
                "Invalid status transition for incident {}: {} -> {}",
                incident_id,
                incident.status.as_str(),
                status.as_str()
            );
            return Ok(None);
        }

        // Entering resolved stamps resolved_at exactly once
        if status == IncidentStatus::Resolved && incident.resolved_at.is_none() {
            sqlx::query(
                "UPDATE incidents SET status = ?, resolved_at = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
            )
            .bind(status)
            .bind(Utc::now())
            .bind(incident_id)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                "UPDATE incidents SET status = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
            )
            .bind(status)
            .bind(incident_id)
            .execute(&self.pool)
            .await?;
        }

        tracing::info!(
            "Incident {} status: {} -> {}",
            incident_id,
            incident.status.as_str(),
            status.as_str()
        );
        self.get(incident_id).await
    }

    pub async fn transition_to_analyzing(
        &self,
        incident_id: &str,
    ) -> Result<Option<Incident>, sqlx::Error> {
        self.update_status(incident_id, IncidentStatus::Analyzing).await
    }

    pub async fn transition_to_resolved(
        &self,
        incident_id: &str,
    ) -> Result<Option<Incident>, sqlx::Error> {
        self.update_status(incident_id, IncidentStatus::Resolved).await
    }

    pub async fn set_primary_alert(
        &self,
        incident_id: &str,
        alert_id: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE incidents SET primary_alert_id = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(alert_id)
        .bind(incident_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_rca_completed(&self, incident_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE incidents SET rca_completed_at = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(incident_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Replace correlation aggregates after membership changes.
    pub async fn update_aggregates(
        &self,
        incident_id: &str,
        severity: IncidentSeverity,
        affected_services: &[String],
        affected_labels: &HashMap<String, String>,
        correlation_reason: &str,
    ) -> Result<(), sqlx::Error> {
        let services = serde_json::to_string(affected_services).unwrap_or_else(|_| "[]".to_string());
        let labels = serde_json::to_string(affected_labels).unwrap_or_else(|_| "{}".to_string());

        sqlx::query(
            r#"UPDATE incidents
               SET severity = ?, affected_services = ?, affected_labels = ?,
                   correlation_reason = ?, updated_at = CURRENT_TIMESTAMP
               WHERE id = ?"#,
        )
        .bind(severity)
        .bind(&services)
        .bind(&labels)
        .bind(correlation_reason)
        .bind(incident_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Manually correlate alerts with an incident; unknown alert ids are
    /// silently skipped.
    pub async fn manual_correlate(
        &self,
        incident_id: &str,
        alert_ids: &[String],
    ) -> Result<Option<Incident>, sqlx::Error> {
        let incident = match self.get(incident_id).await? {
            Some(i) => i,
            None => return Ok(None),
        };

        for alert_id in alert_ids {
            let result = sqlx::query(
                "UPDATE alerts SET incident_id = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
            )
            .bind(incident_id)
            .bind(alert_id)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                tracing::warn!("Manual correlation: alert {} not found, skipped", alert_id);
            } else {
                tracing::info!("Manually correlated alert {} to incident {}", alert_id, incident_id);
            }
        }

        self.recompute_affected_services(incident_id).await?;

        let reason = match &incident.correlation_reason {
            Some(existing) if !existing.is_empty() => format!("{} + Manual correlation", existing),
            _ => "Manual correlation".to_string(),
        };
        sqlx::query(
            "UPDATE incidents SET correlation_reason = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(&reason)
        .bind(incident_id)
        .execute(&self.pool)
        .await?;

        self.get(incident_id).await
    }

    /// Recompute `affected_services` from the service-like labels of all
    /// member alerts.
    pub async fn recompute_affected_services(&self, incident_id: &str) -> Result<(), sqlx::Error> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"SELECT DISTINCT value FROM alerts, json_each(alerts.labels)
               WHERE alerts.incident_id = ?
                 AND json_each.key IN ('service', 'app', 'job', 'device')"#,
        )
        .bind(incident_id)
        .fetch_all(&self.pool)
        .await?;

        let mut services: Vec<String> = rows.into_iter().map(|(s,)| s).collect();
        services.sort();
        services.dedup();
        let services_json = serde_json::to_string(&services).unwrap_or_else(|_| "[]".to_string());

        sqlx::query(
            "UPDATE incidents SET affected_services = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(&services_json)
        .bind(incident_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Administrative recovery: move every `analyzing` incident back to
    /// `open`. Returns the number of incidents reset.
    pub async fn reset_stuck_incidents(&self) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE incidents SET status = 'open', updated_at = CURRENT_TIMESTAMP WHERE status = 'analyzing'",
        )
        .execute(&self.pool)
        .await?;
        let count = result.rows_affected();
        if count > 0 {
            tracing::info!("Reset {} stuck incidents from analyzing to open", count);
        }
        Ok(count)
    }
}
