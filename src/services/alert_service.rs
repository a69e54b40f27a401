//! Alert CRUD service.

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::collections::HashMap;
use uuid::Uuid;

use crate::models::{Alert, AlertSeverity, AlertStatus};

/// Fields for inserting a new alert row.
#[derive(Debug, Clone)]
pub struct NewAlert {
    pub fingerprint: String,
    pub alertname: String,
    pub severity: AlertSeverity,
    pub status: AlertStatus,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub generator_url: Option<String>,
}

/// Filters for the alert listing API.
#[derive(Debug, Clone, Default)]
pub struct AlertFilters {
    pub status: Option<AlertStatus>,
    pub severity: Option<AlertSeverity>,
    pub service: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

pub struct AlertService {
    pool: SqlitePool,
}

impl AlertService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, new_alert: NewAlert) -> Result<Alert, sqlx::Error> {
        let id = Uuid::new_v4().to_string();
        let labels = serde_json::to_string(&new_alert.labels).unwrap_or_else(|_| "{}".to_string());
        let annotations =
            serde_json::to_string(&new_alert.annotations).unwrap_or_else(|_| "{}".to_string());

        sqlx::query(
            r#"INSERT INTO alerts
               (id, fingerprint, alertname, severity, status, labels, annotations,
                starts_at, ends_at, generator_url, received_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&id)
        .bind(&new_alert.fingerprint)
        .bind(&new_alert.alertname)
        .bind(new_alert.severity)
        .bind(new_alert.status)
        .bind(&labels)
        .bind(&annotations)
        .bind(new_alert.starts_at)
        .bind(new_alert.ends_at)
        .bind(&new_alert.generator_url)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        self.get(&id).await?.ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn get(&self, alert_id: &str) -> Result<Option<Alert>, sqlx::Error> {
        sqlx::query_as::<_, Alert>("SELECT * FROM alerts WHERE id = ?")
            .bind(alert_id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn get_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Alert>, sqlx::Error> {
        sqlx::query_as::<_, Alert>("SELECT * FROM alerts WHERE fingerprint = ?")
            .bind(fingerprint)
            .fetch_optional(&self.pool)
            .await
    }

    /// List alerts with optional filtering. Returns (alerts, total).
    pub async fn list_alerts(
        &self,
        filters: &AlertFilters,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Alert>, i64), sqlx::Error> {
        let mut count_query = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM alerts WHERE 1=1");
        Self::push_filters(&mut count_query, filters);
        let total: i64 = count_query.build_query_scalar().fetch_one(&self.pool).await?;

        let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM alerts WHERE 1=1");
        Self::push_filters(&mut query, filters);
        query.push(" ORDER BY starts_at DESC LIMIT ");
        query.push_bind(limit);
        query.push(" OFFSET ");
        query.push_bind(offset);

        let alerts = query.build_query_as::<Alert>().fetch_all(&self.pool).await?;
        Ok((alerts, total))
    }

    fn push_filters<'a>(query: &mut QueryBuilder<'a, Sqlite>, filters: &'a AlertFilters) {
        if let Some(status) = filters.status {
            query.push(" AND status = ");
            query.push_bind(status);
        }
        if let Some(severity) = filters.severity {
            query.push(" AND severity = ");
            query.push_bind(severity);
        }
        if let Some(service) = &filters.service {
            query.push(" AND json_extract(labels, '$.service') = ");
            query.push_bind(service);
        }
        if let Some(since) = filters.since {
            query.push(" AND starts_at >= ");
            query.push_bind(since);
        }
        if let Some(until) = filters.until {
            query.push(" AND starts_at <= ");
            query.push_bind(until);
        }
    }

    /// All alerts linked to an incident, ordered by start time ascending.
    pub async fn list_by_incident(&self, incident_id: &str) -> Result<Vec<Alert>, sqlx::Error> {
        sqlx::query_as::<_, Alert>(
            "SELECT * FROM alerts WHERE incident_id = ? ORDER BY starts_at ASC",
        )
        .bind(incident_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Update an alert's status. A resolved alert records `ends_at`; flipping
    /// back to firing clears it so `ends_at` is set iff the alert is resolved.
    pub async fn update_status(
        &self,
        alert_id: &str,
        status: AlertStatus,
        ends_at: Option<DateTime<Utc>>,
    ) -> Result<Option<Alert>, sqlx::Error> {
        let ends_at = match status {
            AlertStatus::Resolved => Some(ends_at.unwrap_or_else(Utc::now)),
            AlertStatus::Firing => None,
        };

        sqlx::query(
            "UPDATE alerts SET status = ?, ends_at = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(status)
        .bind(ends_at)
        .bind(alert_id)
        .execute(&self.pool)
        .await?;

        self.get(alert_id).await
    }

    pub async fn link_to_incident(
        &self,
        alert_id: &str,
        incident_id: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE alerts SET incident_id = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(incident_id)
        .bind(alert_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Count of firing alerts currently linked to an incident.
    pub async fn count_firing_by_incident(&self, incident_id: &str) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM alerts WHERE incident_id = ? AND status = 'firing'")
            .bind(incident_id)
            .fetch_one(&self.pool)
            .await
    }
}
