//! RCA report CRUD service and markdown rendering.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::models::{RcaReport, RcaReportStatus};

/// Filters for the report listing API.
#[derive(Debug, Clone, Default)]
pub struct ReportFilters {
    pub status: Option<RcaReportStatus>,
    pub min_confidence: Option<i64>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

pub struct ReportService {
    pool: SqlitePool,
}

impl ReportService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a pending report for an incident.
    pub async fn create_pending(&self, incident_id: &str) -> Result<RcaReport, sqlx::Error> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"INSERT INTO rca_reports
               (id, incident_id, root_cause, confidence_score, summary, status, started_at)
               VALUES (?, ?, 'Analysis pending', 0, 'Analysis in progress', 'pending', ?)"#,
        )
        .bind(&id)
        .bind(incident_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        self.get(&id).await?.ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn get(&self, report_id: &str) -> Result<Option<RcaReport>, sqlx::Error> {
        sqlx::query_as::<_, RcaReport>("SELECT * FROM rca_reports WHERE id = ?")
            .bind(report_id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn get_by_incident(&self, incident_id: &str) -> Result<Option<RcaReport>, sqlx::Error> {
        sqlx::query_as::<_, RcaReport>("SELECT * FROM rca_reports WHERE incident_id = ?")
            .bind(incident_id)
            .fetch_optional(&self.pool)
            .await
    }

    /// List reports with optional filtering. Returns (reports, total).
    pub async fn list_reports(
        &self,
        filters: &ReportFilters,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<RcaReport>, i64), sqlx::Error> {
        let mut count_query =
            QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM rca_reports WHERE 1=1");
        Self::push_filters(&mut count_query, filters);
        let total: i64 = count_query.build_query_scalar().fetch_one(&self.pool).await?;

        let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM rca_reports WHERE 1=1");
        Self::push_filters(&mut query, filters);
        query.push(" ORDER BY created_at DESC LIMIT ");
        query.push_bind(limit);
        query.push(" OFFSET ");
        query.push_bind(offset);

        let reports = query.build_query_as::<RcaReport>().fetch_all(&self.pool).await?;
        Ok((reports, total))
    }

    fn push_filters<'a>(query: &mut QueryBuilder<'a, Sqlite>, filters: &'a ReportFilters) {
        if let Some(status) = filters.status {
            query.push(" AND status = ");
            query.push_bind(status);
        }
        if let Some(min_confidence) = filters.min_confidence {
            query.push(" AND confidence_score >= ");
            query.push_bind(min_confidence);
        }
        if let Some(since) = filters.since {
            query.push(" AND completed_at >= ");
            query.push_bind(since);
        }
        if let Some(until) = filters.until {
            query.push(" AND completed_at <= ");
            query.push_bind(until);
        }
    }

    /// Persist a completed analysis on a report.
    pub async fn update_from_analysis(
        &self,
        report_id: &str,
        report_data: &Value,
        analysis_metadata: Option<&Value>,
    ) -> Result<Option<RcaReport>, sqlx::Error> {
        let root_cause = report_data["root_cause"].as_str().unwrap_or("Unknown");
        let confidence = report_data["confidence_score"].as_i64().unwrap_or(0);
        let summary = report_data["summary"].as_str().unwrap_or("");
        let timeline = report_data.get("timeline").cloned().unwrap_or(json!([]));
        let evidence = report_data
            .get("evidence")
            .cloned()
            .unwrap_or(json!({"logs": [], "metrics": []}));
        let remediation = report_data
            .get("remediation_steps")
            .cloned()
            .unwrap_or(json!([]));

        sqlx::query(
            r#"UPDATE rca_reports
               SET root_cause = ?, confidence_score = ?, summary = ?,
                   timeline = ?, evidence = ?, remediation_steps = ?,
                   analysis_metadata = ?, status = 'complete', completed_at = ?,
                   updated_at = CURRENT_TIMESTAMP
               WHERE id = ?"#,
        )
        .bind(root_cause)
        .bind(confidence)
        .bind(summary)
        .bind(timeline.to_string())
        .bind(evidence.to_string())
        .bind(remediation.to_string())
        .bind(analysis_metadata.map(|m| m.to_string()))
        .bind(Utc::now())
        .bind(report_id)
        .execute(&self.pool)
        .await?;

        self.get(report_id).await
    }

    /// Mark a report failed with an error message.
    pub async fn mark_failed(
        &self,
        report_id: &str,
        error_message: &str,
        analysis_metadata: Option<&Value>,
    ) -> Result<Option<RcaReport>, sqlx::Error> {
        sqlx::query(
            r#"UPDATE rca_reports
               SET status = 'failed', error_message = ?, analysis_metadata = ?,
                   completed_at = ?, updated_at = CURRENT_TIMESTAMP
               WHERE id = ?"#,
        )
        .bind(error_message)
        .bind(analysis_metadata.map(|m| m.to_string()))
        .bind(Utc::now())
        .bind(report_id)
        .execute(&self.pool)
        .await?;

        self.get(report_id).await
    }

    /// Render a report as Markdown. Deterministic for identical input:
    /// Header / Summary / Root Cause / Timeline / Log Evidence / Metric
    /// Evidence / Remediation Steps.
    pub fn format_as_markdown(report: &RcaReport) -> String {
        let mut lines: Vec<String> = vec![
            "# RCA Report".to_string(),
            String::new(),
            format!("**Report ID**: {}", report.id),
            format!("**Status**: {}", report.status.as_str()),
            format!("**Confidence**: {}%", report.confidence_score),
            format!("**Created**: {}", report.created_at.to_rfc3339()),
            String::new(),
            "## Summary".to_string(),
            String::new(),
            report.summary.clone(),
            String::new(),
            "## Root Cause".to_string(),
            String::new(),
            report.root_cause.clone(),
            String::new(),
        ];

        if let Some(events) = report.timeline.as_array().filter(|t| !t.is_empty()) {
            lines.push("## Timeline".to_string());
            lines.push(String::new());
            for event in events {
                let ts = event["timestamp"].as_str().unwrap_or("Unknown");
                let desc = event["event"].as_str().unwrap_or("Unknown event");
                let source = event["source"].as_str().unwrap_or("unknown");
                lines.push(format!("- **{}** [{}]: {}", ts, source, desc));
            }
            lines.push(String::new());
        }

        let logs = report.evidence["logs"].as_array().cloned().unwrap_or_default();
        if !logs.is_empty() {
            lines.push("## Log Evidence".to_string());
            lines.push(String::new());
            for log in logs.iter().take(10) {
                let ts = log["timestamp"].as_str().unwrap_or("Unknown");
                let msg: String = log["message"].as_str().unwrap_or("").chars().take(200).collect();
                lines.push(format!("- `{}`: {}", ts, msg));
            }
            lines.push(String::new());
        }

        let metrics = report.evidence["metrics"].as_array().cloned().unwrap_or_default();
        if !metrics.is_empty() {
            lines.push("## Metric Evidence".to_string());
            lines.push(String::new());
            for metric in metrics.iter().take(10) {
                let name = metric["name"].as_str().unwrap_or("Unknown");
                let value = metric
                    .get("value")
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "N/A".to_string());
                let ts = metric["timestamp"].as_str().unwrap_or("Unknown");
                lines.push(format!("- **{}**: {} at {}", name, value, ts));
            }
            lines.push(String::new());
        }

        if let Some(steps) = report.remediation_steps.as_array().filter(|s| !s.is_empty()) {
            lines.push("## Remediation Steps".to_string());
            lines.push(String::new());
            for (i, step) in steps.iter().enumerate() {
                let priority = step["priority"].as_str().unwrap_or("unknown").to_uppercase();
                let action = step["action"].as_str().unwrap_or("No action specified");
                let risk = step["risk"].as_str().unwrap_or("unknown");
                lines.push(format!("{}. **[{}]** {} (Risk: {})", i + 1, priority, action, risk));

                if let Some(command) = step["command"].as_str() {
                    lines.push("   ```".to_string());
                    lines.push(format!("   {}", command));
                    lines.push("   ```".to_string());
                }
                if let Some(description) = step["description"].as_str() {
                    lines.push(format!("   {}", description));
                }
                lines.push(String::new());
            }
        }

        lines.join("\n")
    }
}
