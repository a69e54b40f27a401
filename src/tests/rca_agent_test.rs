// Orchestrator tests: the agent loop with a scripted provider, timestamp
// pinning, argument normalization, and fallback report synthesis.

use chrono::{Duration, Utc};
use serde_json::json;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{ObservabilityConfig, RcaConfig};
use crate::models::{Alert, AlertSeverity, AlertStatus};
use crate::services::alert_service::{AlertService, NewAlert};
use crate::services::{CortexClient, LokiClient, RcaAgent};
use crate::tests::common::{create_test_db, MockProvider};

fn test_clients() -> (Arc<LokiClient>, Arc<CortexClient>) {
    // Point at unroutable local ports; tool failures must not break the loop
    let config = ObservabilityConfig {
        loki_url: "http://127.0.0.1:59531".to_string(),
        cortex_url: "http://127.0.0.1:59532".to_string(),
        loki_timeout_seconds: 1,
        cortex_timeout_seconds: 1,
    };
    (
        Arc::new(LokiClient::from_config(&config)),
        Arc::new(CortexClient::from_config(&config)),
    )
}

fn agent_with(provider: Arc<MockProvider>, rca: &RcaConfig) -> RcaAgent {
    let (loki, cortex) = test_clients();
    RcaAgent::new(provider, loki, cortex, rca)
}

async fn insert_alert(pool: &SqlitePool, labels: &[(&str, &str)]) -> Alert {
    let labels: HashMap<String, String> = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    AlertService::new(pool.clone())
        .create(NewAlert {
            fingerprint: uuid::Uuid::new_v4().to_string(),
            alertname: "NetworkInterfaceDown".to_string(),
            severity: AlertSeverity::Critical,
            status: AlertStatus::Firing,
            labels,
            annotations: [(
                "description".to_string(),
                "Interface eth0 lost carrier".to_string(),
            )]
            .into_iter()
            .collect(),
            starts_at: Utc::now() - Duration::minutes(5),
            ends_at: None,
            generator_url: None,
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn success_path_queries_then_reports() {
    let pool = create_test_db().await;
    let alert = insert_alert(&pool, &[("service", "edge-router"), ("device", "rt-01")]).await;

    let provider = Arc::new(MockProvider::new(vec![
        // Hallucinated timestamps: pinning must overwrite them
        MockProvider::tool_response(vec![(
            "call-1",
            "query_loki",
            json!({
                "logql_query": "{service=\"edge-router\"} |= \"error\"",
                "start_time": "2023-03-01T00:00:00Z",
                "end_time": "2023-03-01T01:00:00Z",
            }),
        )]),
        MockProvider::tool_response(vec![(
            "call-2",
            "generate_report",
            json!({
                "root_cause": "Interface eth0 carrier loss on rt-01",
                "confidence_score": 85,
                "summary": "The edge router lost its uplink.",
                "remediation_steps": [
                    {"priority": "immediate", "action": "Bring up interface eth0"},
                ],
            }),
        )]),
    ]));

    let mut agent = agent_with(provider.clone(), &RcaConfig::default());
    let outcome = agent.analyze_alert(&alert).await;

    assert!(outcome.success);
    assert!(outcome.warning.is_none());
    let report = outcome.report.expect("report captured");
    assert_eq!(report["confidence_score"], 85);
    assert_eq!(report["root_cause"], "Interface eth0 carrier loss on rt-01");
    assert!(outcome.metadata.tool_calls >= 2);
    assert_eq!(outcome.metadata.provider, "mock");

    // The pinned window, not the hallucinated one, reached the tool: the
    // tool_result echoes the range the executor actually used
    let pinned_start = (alert.starts_at - Duration::minutes(15))
        .format("%Y-%m-%dT%H:%M:%SZ")
        .to_string();
    let transcripts = provider.transcripts.lock().unwrap();
    let tool_result_text: String = transcripts
        .iter()
        .flatten()
        .filter(|m| m["role"] == "user")
        .filter_map(|m| m["content"].as_array())
        .flatten()
        .filter(|block| block["type"] == "tool_result")
        .filter_map(|block| block["content"].as_str())
        .collect::<Vec<_>>()
        .join("\n");
    assert!(tool_result_text.contains(&pinned_start));
    assert!(!tool_result_text.contains("2023-03-01T00:00:00Z"));
}

#[tokio::test]
async fn text_only_model_yields_fallback_report() {
    let pool = create_test_db().await;
    let alert = insert_alert(&pool, &[("service", "edge-router")]).await;

    let provider = Arc::new(MockProvider::new(vec![MockProvider::text_response(
        "Based on the alert details, the root cause is a carrier loss on the uplink interface. \
         I recommend restarting the interface and checking the cable.",
    )]));

    let mut agent = agent_with(provider, &RcaConfig::default());
    let outcome = agent.analyze_alert(&alert).await;

    assert!(outcome.success);
    assert!(outcome.warning.is_some());
    let report = outcome.report.unwrap();
    assert_eq!(report["confidence_score"], 30);
    assert_eq!(report["_fallback"], true);
    assert!(report["root_cause"].as_str().unwrap().contains("root cause"));
    assert!(!report["remediation_steps"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn exhausted_iterations_yield_minimal_report() {
    let pool = create_test_db().await;
    let alert = insert_alert(&pool, &[("service", "edge-router")]).await;

    // Only unknown tool calls, never a report and never prose
    let unknown_call = || {
        MockProvider::tool_response(vec![("x", "query_crystal_ball", json!({}))])
    };
    let provider = Arc::new(MockProvider::new(vec![unknown_call(), unknown_call()]));

    let rca = RcaConfig { max_iterations: 2, ..RcaConfig::default() };
    let mut agent = agent_with(provider, &rca);
    let outcome = agent.analyze_alert(&alert).await;

    assert!(outcome.success);
    assert!(outcome.warning.is_some());
    let report = outcome.report.unwrap();
    assert_eq!(report["confidence_score"], 40);
    assert!(report["summary"].as_str().unwrap().starts_with("[Minimal Report]"));
    // Alert fields were recovered from the prompt
    assert!(report["root_cause"].as_str().unwrap().contains("NetworkInterfaceDown"));
    assert!(report["root_cause"].as_str().unwrap().contains("edge-router"));
    assert_eq!(report["remediation_steps"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn stop_without_report_after_tools_triggers_continuation() {
    let pool = create_test_db().await;
    let alert = insert_alert(&pool, &[("service", "edge-router")]).await;

    let provider = Arc::new(MockProvider::new(vec![
        MockProvider::tool_response(vec![(
            "call-1",
            "query_loki",
            json!({"logql_query": "{service=\"edge-router\"}"}),
        )]),
        // Model stops with prose instead of a report
        MockProvider::text_response("I believe the interface is down but I am not sure."),
        MockProvider::tool_response(vec![(
            "call-2",
            "generate_report",
            json!({
                "root_cause": "Interface down",
                "confidence_score": 60,
                "summary": "Uplink interface down.",
                "remediation_steps": [{"priority": "immediate", "action": "Check interface"}],
            }),
        )]),
    ]));

    let mut agent = agent_with(provider.clone(), &RcaConfig::default());
    let outcome = agent.analyze_alert(&alert).await;

    assert!(outcome.success);
    assert_eq!(outcome.report.unwrap()["confidence_score"], 60);

    // The third call saw the forceful continuation message
    let transcripts = provider.transcripts.lock().unwrap();
    let last = transcripts.last().unwrap();
    let continuation = last
        .iter()
        .filter_map(|m| m["content"].as_str())
        .any(|content| content.contains("You MUST call the `generate_report` tool NOW"));
    assert!(continuation);
}

#[tokio::test]
async fn empty_completion_is_an_error() {
    let pool = create_test_db().await;
    let alert = insert_alert(&pool, &[]).await;

    let provider = Arc::new(MockProvider::new(vec![MockProvider::text_response("ok")]));
    let mut agent = agent_with(provider, &RcaConfig::default());
    let outcome = agent.analyze_alert(&alert).await;

    assert!(!outcome.success);
    assert!(outcome
        .error
        .as_deref()
        .unwrap()
        .contains("without generating a report"));
}

#[test]
fn normalization_maps_aliases_and_defaults() {
    let provider = Arc::new(MockProvider::new(vec![]));
    let agent = agent_with(provider, &RcaConfig::default());

    let args = agent.normalize_tool_input(
        "generate_report",
        json!({
            "cause": "disk full",
            "confidence": "87.5",
        }),
    );
    assert_eq!(args["root_cause"], "disk full");
    assert_eq!(args["confidence_score"], 87);
    // summary defaults to root_cause
    assert_eq!(args["summary"], "disk full");

    let args = agent.normalize_tool_input("generate_report", json!({"summary": "brief"}));
    assert_eq!(args["root_cause"], "brief");
    assert_eq!(args["confidence_score"], 50);

    let args = agent.normalize_tool_input("generate_report", json!({"root_cause": "x", "score": 900}));
    assert_eq!(args["confidence_score"], 100, "clamped to the valid range");
}

#[test]
fn normalization_pins_query_timestamps() {
    let provider = Arc::new(MockProvider::new(vec![]));
    let mut agent = agent_with(provider, &RcaConfig::default());

    // Prompt assembly pins the window as a side effect
    let now = Utc::now();
    let alert = Alert {
        id: "a".to_string(),
        fingerprint: "f".to_string(),
        alertname: "CpuHigh".to_string(),
        severity: AlertSeverity::Warning,
        status: AlertStatus::Firing,
        labels: sqlx::types::Json(HashMap::new()),
        annotations: sqlx::types::Json(HashMap::new()),
        starts_at: now - Duration::minutes(10),
        ends_at: None,
        generator_url: None,
        incident_id: None,
        received_at: now,
        created_at: now,
        updated_at: now,
    };
    let _prompt = agent.format_alert_for_analysis(&alert);

    let args = agent.normalize_tool_input(
        "query_loki",
        json!({"query": "{job=\"api\"}", "start": "2022-01-01T00:00:00Z", "end": "2022-01-01T01:00:00Z"}),
    );
    assert_eq!(args["logql_query"], "{job=\"api\"}");
    let expected_start = (alert.starts_at - Duration::minutes(15))
        .format("%Y-%m-%dT%H:%M:%SZ")
        .to_string();
    assert_eq!(args["start_time"], expected_start.as_str());
    assert_ne!(args["end_time"], "2022-01-01T01:00:00Z");

    let args = agent.normalize_tool_input(
        "query_cortex",
        json!({"promql": "up", "start_time": "1999-01-01T00:00:00Z"}),
    );
    assert_eq!(args["promql_query"], "up");
    assert_eq!(args["start_time"], expected_start.as_str());
}

async fn state_with_provider(
    pool: SqlitePool,
    provider: Arc<MockProvider>,
) -> Arc<crate::AppState> {
    Arc::new(crate::AppState::new(pool, crate::Config::default(), Some(provider)))
}

async fn incident_with_alert(pool: &SqlitePool) -> (String, Alert) {
    let alert = insert_alert(pool, &[("service", "edge-router")]).await;
    let incident = crate::services::IncidentService::new(pool.clone())
        .create(crate::services::NewIncident {
            title: alert.alertname.clone(),
            severity: crate::models::IncidentSeverity::Critical,
            started_at: alert.starts_at,
            primary_alert_id: Some(alert.id.clone()),
            correlation_reason: None,
            affected_services: vec!["edge-router".to_string()],
            affected_labels: HashMap::new(),
        })
        .await
        .unwrap();
    AlertService::new(pool.clone())
        .link_to_incident(&alert.id, &incident.id)
        .await
        .unwrap();
    (incident.id, alert)
}

#[tokio::test]
async fn detached_task_persists_report_and_reopens_incident() {
    let pool = create_test_db().await;
    let (incident_id, _alert) = incident_with_alert(&pool).await;

    let provider = Arc::new(MockProvider::new(vec![MockProvider::tool_response(vec![(
        "call-1",
        "generate_report",
        json!({
            "root_cause": "Carrier loss",
            "confidence_score": 75,
            "summary": "Uplink flapped.",
            "remediation_steps": [{"priority": "immediate", "action": "Check eth0"}],
        }),
    )])]));
    let state = state_with_provider(pool.clone(), provider).await;

    crate::services::run_incident_rca(Arc::clone(&state), incident_id.clone()).await;

    let report = state
        .report_service
        .get_by_incident(&incident_id)
        .await
        .unwrap()
        .expect("report persisted");
    assert_eq!(report.status, crate::models::RcaReportStatus::Complete);
    assert_eq!(report.confidence_score, 75);
    assert!(report.completed_at.is_some());
    assert_eq!(report.analysis_metadata.as_ref().unwrap().0["provider"], "mock");

    let incident = state.incident_service.get(&incident_id).await.unwrap().unwrap();
    assert_eq!(incident.status, crate::models::IncidentStatus::Open);
    assert!(incident.rca_completed_at.is_some());
}

#[tokio::test]
async fn detached_task_marks_report_failed_on_empty_analysis() {
    let pool = create_test_db().await;
    let (incident_id, _alert) = incident_with_alert(&pool).await;

    // Completes with neither tool calls nor usable prose
    let empty = crate::services::LlmResponse {
        content: None,
        tool_calls: Vec::new(),
        stop_reason: Some("end_turn".to_string()),
        usage: Default::default(),
    };
    let provider = Arc::new(MockProvider::new(vec![empty]));
    let state = state_with_provider(pool.clone(), provider).await;

    crate::services::run_incident_rca(Arc::clone(&state), incident_id.clone()).await;

    let report = state
        .report_service
        .get_by_incident(&incident_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.status, crate::models::RcaReportStatus::Failed);
    assert!(report
        .error_message
        .as_deref()
        .unwrap()
        .contains("without generating a report"));

    let incident = state.incident_service.get(&incident_id).await.unwrap().unwrap();
    assert_eq!(incident.status, crate::models::IncidentStatus::Open);
    assert!(incident.rca_completed_at.is_none());
}

#[test]
fn dependency_detection_heuristics() {
    let labels: HashMap<String, String> = [
        ("service".to_string(), "payment-api".to_string()),
        ("namespace".to_string(), "prod".to_string()),
        ("job".to_string(), "payment-worker".to_string()),
    ]
    .into_iter()
    .collect();

    let deps = RcaAgent::detect_dependencies(&labels, "ConnectionTimeout");
    assert!(deps.len() <= 5);
    assert!(deps.contains(&"postgres".to_string()));

    let db_deps = RcaAgent::detect_dependencies(&HashMap::new(), "PostgresDown");
    assert_eq!(db_deps, vec!["all-api-services".to_string()]);
}
