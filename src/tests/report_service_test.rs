// Report lifecycle and markdown rendering tests.

use chrono::Utc;
use serde_json::json;
use sqlx::SqlitePool;
use std::collections::HashMap;

use crate::models::{IncidentSeverity, RcaReportStatus};
use crate::services::incident_service::{IncidentService, NewIncident};
use crate::services::report_service::{ReportFilters, ReportService};
use crate::tests::common::create_test_db;

async fn insert_incident(pool: &SqlitePool) -> String {
    IncidentService::new(pool.clone())
        .create(NewIncident {
            title: "Payment outage".to_string(),
            severity: IncidentSeverity::Critical,
            started_at: Utc::now(),
            primary_alert_id: None,
            correlation_reason: None,
            affected_services: vec!["payments".to_string()],
            affected_labels: HashMap::new(),
        })
        .await
        .unwrap()
        .id
}

fn sample_report_data() -> serde_json::Value {
    json!({
        "root_cause": "Connection pool exhaustion in payments-db",
        "confidence_score": 90,
        "summary": "The payment service exhausted its database connection pool.",
        "timeline": [
            {"timestamp": "2025-06-01T10:00:00Z", "event": "Alert fired: PaymentErrors", "source": "alert"},
            {"timestamp": "2025-06-01T10:01:00Z", "event": "pool exhausted", "source": "log"},
        ],
        "evidence": {
            "logs": [
                {"timestamp": "2025-06-01T10:01:00Z", "message": "FATAL: remaining connection slots reserved", "labels": {"service": "payments-db"}},
            ],
            "metrics": [
                {"name": "pg_connections", "value": 100.0, "timestamp": "2025-06-01T10:01:00Z", "labels": {}},
            ],
        },
        "remediation_steps": [
            {
                "priority": "immediate",
                "action": "Restart the payments service",
                "command": "kubectl rollout restart deployment/payments",
                "risk": "medium",
            },
            {"priority": "long_term", "action": "Raise pool limits", "risk": "low"},
        ],
    })
}

#[tokio::test]
async fn pending_report_completes_with_analysis() {
    let pool = create_test_db().await;
    let incident_id = insert_incident(&pool).await;
    let service = ReportService::new(pool);

    let report = service.create_pending(&incident_id).await.unwrap();
    assert_eq!(report.status, RcaReportStatus::Pending);
    assert!(report.completed_at.is_none());

    let metadata = json!({"provider": "anthropic", "model": "m", "tokens_used": 100, "duration_seconds": 1.5, "tool_calls": 3});
    let completed = service
        .update_from_analysis(&report.id, &sample_report_data(), Some(&metadata))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(completed.status, RcaReportStatus::Complete);
    assert!(completed.completed_at.is_some());
    assert_eq!(completed.confidence_score, 90);
    assert_eq!(completed.root_cause, "Connection pool exhaustion in payments-db");
    assert_eq!(
        completed.analysis_metadata.as_ref().unwrap().0["tool_calls"],
        3
    );

    // One report per incident
    let by_incident = service.get_by_incident(&incident_id).await.unwrap().unwrap();
    assert_eq!(by_incident.id, completed.id);
}

#[tokio::test]
async fn failed_report_carries_error_message() {
    let pool = create_test_db().await;
    let incident_id = insert_incident(&pool).await;
    let service = ReportService::new(pool);

    let report = service.create_pending(&incident_id).await.unwrap();
    let failed = service
        .mark_failed(&report.id, "LLM error (anthropic): timeout", None)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(failed.status, RcaReportStatus::Failed);
    assert_eq!(failed.error_message.as_deref(), Some("LLM error (anthropic): timeout"));
    assert!(failed.completed_at.is_some());
}

#[tokio::test]
async fn list_reports_filters_by_status_and_confidence() {
    let pool = create_test_db().await;
    let service = ReportService::new(pool.clone());

    let complete_incident = insert_incident(&pool).await;
    let complete = service.create_pending(&complete_incident).await.unwrap();
    service
        .update_from_analysis(&complete.id, &sample_report_data(), None)
        .await
        .unwrap();

    let failed_incident = insert_incident(&pool).await;
    let failed = service.create_pending(&failed_incident).await.unwrap();
    service.mark_failed(&failed.id, "boom", None).await.unwrap();

    let filters = ReportFilters {
        status: Some(RcaReportStatus::Complete),
        ..Default::default()
    };
    let (reports, total) = service.list_reports(&filters, 50, 0).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(reports[0].incident_id, complete_incident);

    let filters = ReportFilters { min_confidence: Some(95), ..Default::default() };
    let (_, total) = service.list_reports(&filters, 50, 0).await.unwrap();
    assert_eq!(total, 0);
}

#[tokio::test]
async fn markdown_rendering_is_deterministic_and_ordered() {
    let pool = create_test_db().await;
    let incident_id = insert_incident(&pool).await;
    let service = ReportService::new(pool);

    let report = service.create_pending(&incident_id).await.unwrap();
    let report = service
        .update_from_analysis(&report.id, &sample_report_data(), None)
        .await
        .unwrap()
        .unwrap();

    let first = ReportService::format_as_markdown(&report);
    let second = ReportService::format_as_markdown(&report);
    assert_eq!(first, second);

    // Fixed section order
    let positions: Vec<usize> = [
        "# RCA Report",
        "## Summary",
        "## Root Cause",
        "## Timeline",
        "## Log Evidence",
        "## Metric Evidence",
        "## Remediation Steps",
    ]
    .iter()
    .map(|section| first.find(section).unwrap_or_else(|| panic!("missing {}", section)))
    .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));

    assert!(first.contains("**Confidence**: 90%"));
    assert!(first.contains("kubectl rollout restart deployment/payments"));
    assert!(first.contains("**[IMMEDIATE]** Restart the payments service (Risk: medium)"));
}

#[tokio::test]
async fn markdown_omits_empty_sections() {
    let pool = create_test_db().await;
    let incident_id = insert_incident(&pool).await;
    let service = ReportService::new(pool);

    let report = service.create_pending(&incident_id).await.unwrap();
    let markdown = ReportService::format_as_markdown(&report);

    assert!(markdown.contains("## Summary"));
    assert!(!markdown.contains("## Timeline"));
    assert!(!markdown.contains("## Log Evidence"));
    assert!(!markdown.contains("## Remediation Steps"));
}

#[tokio::test]
async fn deleting_incident_cascades_to_report() {
    let pool = create_test_db().await;
    let incident_id = insert_incident(&pool).await;
    let service = ReportService::new(pool.clone());

    let report = service.create_pending(&incident_id).await.unwrap();

    sqlx::query("DELETE FROM incidents WHERE id = ?")
        .bind(&incident_id)
        .execute(&pool)
        .await
        .unwrap();

    assert!(service.get(&report.id).await.unwrap().is_none());
}
