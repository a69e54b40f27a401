// Ingestion pipeline tests: dedup, status transitions, re-firing policy,
// auto-resolve, and per-alert isolation.

use chrono::{Duration, Utc};
use serde_json::json;

use crate::models::{AlertStatus, IncidentStatus};
use crate::services::{AlertService, IncidentService, WebhookService};
use crate::tests::common::{am_alert, create_test_db, test_rca_config, webhook_payload};

#[tokio::test]
async fn single_firing_alert_creates_alert_and_incident() {
    let pool = create_test_db().await;
    let webhook = WebhookService::new(pool.clone(), &test_rca_config(), None);
    let alerts = AlertService::new(pool.clone());
    let incidents = IncidentService::new(pool);

    let payload = webhook_payload(vec![am_alert(
        "a1b2c3d4e5f67890",
        "HighErrorRate",
        "firing",
        "critical",
        &[("service", "api-gateway")],
        Utc::now(),
    )]);

    let outcome = webhook.process_webhook(&payload).await;
    assert_eq!(outcome.alerts_accepted, 1);
    assert_eq!(outcome.alert_ids.len(), 1);
    assert_eq!(outcome.incident_ids.len(), 1);

    let alert = alerts
        .get_by_fingerprint("a1b2c3d4e5f67890")
        .await
        .unwrap()
        .expect("alert stored");
    assert_eq!(alert.status, AlertStatus::Firing);
    assert!(alert.ends_at.is_none());

    let incident = incidents.get(&outcome.incident_ids[0]).await.unwrap().unwrap();
    assert_eq!(incident.status, IncidentStatus::Open);
    assert_eq!(incident.severity.as_str(), "critical");
    assert_eq!(incident.primary_alert_id.as_deref(), Some(alert.id.as_str()));
    assert_eq!(incident.affected_services.0, vec!["api-gateway".to_string()]);
}

#[tokio::test]
async fn duplicate_firing_alert_is_ignored() {
    let pool = create_test_db().await;
    let webhook = WebhookService::new(pool.clone(), &test_rca_config(), None);
    let alerts = AlertService::new(pool);

    let record = am_alert("fp-dup", "CpuHigh", "firing", "warning", &[], Utc::now());
    let first = webhook.process_webhook(&webhook_payload(vec![record.clone()])).await;
    let second = webhook.process_webhook(&webhook_payload(vec![record])).await;

    // The duplicate is accepted but touches nothing
    assert_eq!(second.alerts_accepted, 1);
    assert!(second.alert_ids.is_empty());
    assert!(second.incident_ids.is_empty());

    let (all, total) = alerts
        .list_alerts(&Default::default(), 100, 0)
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(all[0].id, first.alert_ids[0]);
}

#[tokio::test]
async fn resolve_transition_sets_ends_at_and_auto_resolves_incident() {
    let pool = create_test_db().await;
    let webhook = WebhookService::new(pool.clone(), &test_rca_config(), None);
    let alerts = AlertService::new(pool.clone());
    let incidents = IncidentService::new(pool);

    let starts_at = Utc::now();
    let firing = webhook
        .process_webhook(&webhook_payload(vec![am_alert(
            "fp-res",
            "DiskFull",
            "firing",
            "critical",
            &[("service", "db")],
            starts_at,
        )]))
        .await;

    let resolved = webhook
        .process_webhook(&webhook_payload(vec![am_alert(
            "fp-res",
            "DiskFull",
            "resolved",
            "critical",
            &[("service", "db")],
            starts_at,
        )]))
        .await;
    assert_eq!(resolved.alert_ids, firing.alert_ids);

    let alert = alerts.get_by_fingerprint("fp-res").await.unwrap().unwrap();
    assert_eq!(alert.status, AlertStatus::Resolved);
    assert!(alert.ends_at.is_some());

    let incident = incidents.get(&firing.incident_ids[0]).await.unwrap().unwrap();
    assert_eq!(incident.status, IncidentStatus::Resolved);
    assert!(incident.resolved_at.is_some());
}

#[tokio::test]
async fn refire_after_incident_resolution_creates_new_alert_and_incident() {
    let pool = create_test_db().await;
    let webhook = WebhookService::new(pool.clone(), &test_rca_config(), None);
    let alerts = AlertService::new(pool.clone());
    let incidents = IncidentService::new(pool);

    let starts_at = Utc::now();
    let first = webhook
        .process_webhook(&webhook_payload(vec![am_alert(
            "fp-refire",
            "LinkDown",
            "firing",
            "critical",
            &[("device", "sw-01")],
            starts_at,
        )]))
        .await;

    webhook
        .process_webhook(&webhook_payload(vec![am_alert(
            "fp-refire",
            "LinkDown",
            "resolved",
            "critical",
            &[("device", "sw-01")],
            starts_at,
        )]))
        .await;

    // The incident auto-resolved; the same fingerprint firing again is a
    // fresh occurrence
    let refire = webhook
        .process_webhook(&webhook_payload(vec![am_alert(
            "fp-refire",
            "LinkDown",
            "firing",
            "critical",
            &[("device", "sw-01")],
            starts_at + Duration::minutes(30),
        )]))
        .await;

    assert_eq!(refire.alert_ids.len(), 1);
    assert_ne!(refire.alert_ids[0], first.alert_ids[0]);
    assert_ne!(refire.incident_ids[0], first.incident_ids[0]);

    let new_alert = alerts.get(&refire.alert_ids[0]).await.unwrap().unwrap();
    assert!(new_alert.fingerprint.starts_with("fp-refire_"));
    assert_eq!(new_alert.status, AlertStatus::Firing);

    let new_incident = incidents.get(&refire.incident_ids[0]).await.unwrap().unwrap();
    assert_eq!(new_incident.status, IncidentStatus::Open);

    // The original alert row keeps its fingerprint and resolved state
    let old_alert = alerts.get_by_fingerprint("fp-refire").await.unwrap().unwrap();
    assert_eq!(old_alert.status, AlertStatus::Resolved);
}

#[tokio::test]
async fn refire_while_incident_open_flips_status_back() {
    let pool = create_test_db().await;
    let webhook = WebhookService::new(pool.clone(), &test_rca_config(), None);
    let alerts = AlertService::new(pool.clone());
    let incidents = IncidentService::new(pool);

    let starts_at = Utc::now();
    let batch = |status: &str| {
        webhook_payload(vec![
            am_alert("fp-a", "ServiceDown", status, "critical", &[("service", "api")], starts_at),
            am_alert("fp-b", "HighLatency", "firing", "warning", &[("service", "api")], starts_at),
        ])
    };

    let first = webhook.process_webhook(&batch("firing")).await;

    // Resolve only fp-a: the incident still has a firing alert, so it stays open
    webhook
        .process_webhook(&webhook_payload(vec![am_alert(
            "fp-a",
            "ServiceDown",
            "resolved",
            "critical",
            &[("service", "api")],
            starts_at,
        )]))
        .await;
    let incident = incidents.get(&first.incident_ids[0]).await.unwrap().unwrap();
    assert_eq!(incident.status, IncidentStatus::Open);

    // fp-a fires again; the incident is still open so the row flips back
    webhook.process_webhook(&batch("firing")).await;
    let alert = alerts.get_by_fingerprint("fp-a").await.unwrap().unwrap();
    assert_eq!(alert.status, AlertStatus::Firing);
    assert!(alert.ends_at.is_none());

    let (all, _) = alerts.list_alerts(&Default::default(), 100, 0).await.unwrap();
    assert_eq!(all.len(), 2, "no new row for an in-incident re-fire");
}

#[tokio::test]
async fn malformed_alert_is_skipped_but_batch_continues() {
    let pool = create_test_db().await;
    let webhook = WebhookService::new(pool.clone(), &test_rca_config(), None);

    let good = am_alert("fp-good", "GoodAlert", "firing", "info", &[], Utc::now());
    let bad = json!({"status": "firing", "labels": {}});

    let outcome = webhook.process_webhook(&webhook_payload(vec![bad, good])).await;
    assert_eq!(outcome.alerts_accepted, 1);
    assert_eq!(outcome.alert_ids.len(), 1);
    assert_eq!(outcome.incident_ids.len(), 1);
}

#[tokio::test]
async fn fully_malformed_batch_accepts_nothing() {
    let pool = create_test_db().await;
    let webhook = WebhookService::new(pool, &test_rca_config(), None);

    let outcome = webhook
        .process_webhook(&webhook_payload(vec![json!({"nonsense": true}), json!(42)]))
        .await;
    assert_eq!(outcome.alerts_accepted, 0);
    assert!(outcome.alert_ids.is_empty());
}

#[tokio::test]
async fn reingesting_a_batch_is_idempotent() {
    let pool = create_test_db().await;
    let webhook = WebhookService::new(pool.clone(), &test_rca_config(), None);
    let alerts = AlertService::new(pool.clone());
    let incidents = IncidentService::new(pool);

    let starts_at = Utc::now();
    let payload = webhook_payload(vec![
        am_alert("fp-1", "A", "firing", "warning", &[("service", "svc")], starts_at),
        am_alert("fp-2", "B", "firing", "warning", &[("service", "svc")], starts_at),
    ]);

    let first = webhook.process_webhook(&payload).await;
    let second = webhook.process_webhook(&payload).await;

    assert!(second.alert_ids.is_empty());
    let (_, alert_total) = alerts.list_alerts(&Default::default(), 100, 0).await.unwrap();
    assert_eq!(alert_total, 2);
    let (_, incident_total) = incidents
        .list_incidents(&Default::default(), 100, 0)
        .await
        .unwrap();
    assert_eq!(incident_total, first.incident_ids.len() as i64);
}
