//! Alert-to-incident correlation engine.
//!
//! Two-phase correlation: structural scoring over label overlap, time windows
//! and infrastructure affinity, then (optionally) LLM-arbitrated semantic
//! verification of the surviving candidates.

use chrono::Duration;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::RcaConfig;
use crate::models::{Alert, Incident, IncidentSeverity};
use crate::services::alert_service::AlertService;
use crate::services::incident_service::{IncidentService, NewIncident};
use crate::services::llm::LlmProvider;
use crate::services::semantic_correlator::SemanticCorrelator;

/// Primary correlation labels (direct match).
const CORRELATION_LABELS: [&str; 6] = ["service", "namespace", "node", "instance", "job", "app"];

/// Infrastructure labels for cross-namespace correlation.
const INFRASTRUCTURE_LABELS: [&str; 7] = [
    "datacenter",
    "network_segment",
    "cluster",
    "zone",
    "region",
    "rack",
    "network_path",
];

/// Labels that reference other entities.
const CROSS_REFERENCE_LABELS: [&str; 7] = [
    "target_node",
    "destination",
    "source",
    "peer",
    "upstream",
    "downstream",
    "dependency",
];

/// Alert-name patterns that indicate infrastructure issues (likely root causes).
const INFRASTRUCTURE_ALERT_PATTERNS: [&str; 12] = [
    "interface",
    "bgp",
    "ospf",
    "network",
    "route",
    "switch",
    "router",
    "connectivity",
    "partition",
    "unreachable",
    "carrier",
    "link",
];

/// Namespaces that are themselves infrastructure; affinity scoring targets
/// incidents outside these.
const INFRA_NAMESPACES: [&str; 3] = ["network-infra", "infrastructure", "networking"];

/// Substring weights for primary-alert (root cause candidate) election.
const CAUSAL_INDICATORS: [(&str, i64); 19] = [
    // Infrastructure alerts rank highest
    ("interface", 15),
    ("bgp", 14),
    ("carrier", 14),
    ("ospf", 13),
    ("partition", 13),
    ("route", 12),
    ("network", 11),
    // Resource exhaustion
    ("disk", 10),
    ("storage", 10),
    ("memory", 9),
    ("oom", 9),
    ("cpu", 8),
    ("quota", 8),
    // Symptoms rank lowest
    ("connectivity", 5),
    ("error", 4),
    ("health", 3),
    ("timeout", 3),
    ("latency", 3),
    ("unavailable", 2),
];

/// Minimum structural score to keep a candidate at all.
const MIN_CANDIDATE_SCORE: i64 = 2;

/// Semantic confidence required to accept an arbitrated match.
const SEMANTIC_CONFIDENCE_GATE: f64 = 0.6;

pub struct CorrelationService {
    alert_service: AlertService,
    incident_service: IncidentService,
    window_seconds: i64,
    semantic_enabled: bool,
    semantic_correlator: Option<SemanticCorrelator>,
}

impl CorrelationService {
    pub fn new(pool: SqlitePool, rca: &RcaConfig, llm: Option<Arc<dyn LlmProvider>>) -> Self {
        Self {
            alert_service: AlertService::new(pool.clone()),
            incident_service: IncidentService::new(pool),
            window_seconds: rca.correlation_window_seconds,
            semantic_enabled: rca.semantic_correlation_enabled,
            semantic_correlator: llm.map(SemanticCorrelator::new),
        }
    }

    /// Correlate an alert with an existing incident or create a new one.
    /// Returns (incident, is_new).
    pub async fn correlate_alert(&self, alert: &Alert) -> Result<(Incident, bool), sqlx::Error> {
        match self.find_related_incident(alert).await? {
            Some(incident) => {
                let updated = self.add_alert_to_incident(alert, &incident).await?;
                Ok((updated, false))
            }
            None => {
                let incident = self.create_incident_for_alert(alert).await?;
                Ok((incident, true))
            }
        }
    }

    /// Find an existing incident this alert should join, or None.
    pub async fn find_related_incident(
        &self,
        alert: &Alert,
    ) -> Result<Option<Incident>, sqlx::Error> {
        let window = Duration::seconds(self.window_seconds);
        let candidates = self
            .incident_service
            .find_candidates_in_window(alert.starts_at - window, alert.starts_at + window)
            .await?;

        if candidates.is_empty() {
            return Ok(None);
        }

        let mut scored: Vec<(Incident, i64)> = candidates
            .into_iter()
            .filter_map(|incident| {
                let score = Self::calculate_correlation_score(alert, &incident);
                (score >= MIN_CANDIDATE_SCORE).then_some((incident, score))
            })
            .collect();

        if scored.is_empty() {
            return Ok(None);
        }

        scored.sort_by(|a, b| b.1.cmp(&a.1));

        // Every surviving candidate goes through semantic arbitration when
        // enabled and a provider is available
        let correlator = self
            .semantic_correlator
            .as_ref()
            .filter(|_| self.semantic_enabled);

        if let Some(correlator) = correlator {
            tracing::info!(
                "Using LLM semantic correlation for {} ({} candidates)",
                alert.alertname,
                scored.len()
            );

            let mut with_alerts: Vec<(Incident, Vec<Alert>)> = Vec::new();
            for (incident, _score) in &scored {
                let alerts = self.alert_service.list_by_incident(&incident.id).await?;
                with_alerts.push((incident.clone(), alerts));
            }

            let (best_match, reason, confidence) =
                correlator.find_best_incident(alert, &with_alerts).await;

            match best_match {
                Some(incident) if confidence >= SEMANTIC_CONFIDENCE_GATE => {
                    tracing::info!(
                        "Semantic correlation: {} -> {} (confidence: {:.2}, reason: {})",
                        alert.alertname,
                        incident.id,
                        confidence,
                        reason
                    );
                    return Ok(Some(incident.clone()));
                }
                None => {
                    // The correlator rejected every candidate: open a fresh incident
                    tracing::info!(
                        "Semantic analysis rejected correlation for {}: {}",
                        alert.alertname,
                        reason
                    );
                    return Ok(None);
                }
                Some(_) => {
                    tracing::debug!(
                        "Semantic correlation inconclusive for {}, falling back to label-based",
                        alert.alertname
                    );
                }
            }
        }

        let (best_match, best_score) = &scored[0];
        tracing::info!(
            "Correlated alert {} with incident {} (score: {})",
            alert.alertname,
            best_match.id,
            best_score
        );
        Ok(Some(best_match.clone()))
    }

    /// Structural correlation score between an alert and an incident.
    pub fn calculate_correlation_score(alert: &Alert, incident: &Incident) -> i64 {
        let mut score = 0;

        // 1. Direct label matching
        for label in CORRELATION_LABELS {
            if let (Some(a), Some(i)) = (alert.label(label), incident.affected_label(label)) {
                if a == i {
                    score += 2;
                } else if Self::partial_match(a, i) {
                    score += 1;
                }
            }
        }

        // 2. Infrastructure label matching (cross-namespace correlation)
        for label in INFRASTRUCTURE_LABELS {
            if let (Some(a), Some(i)) = (alert.label(label), incident.affected_label(label)) {
                if a == i {
                    score += 4;
                    tracing::debug!("Infrastructure label match: {}={}", label, a);
                }
            }
        }

        // 3. Cross-reference matching
        score += Self::cross_reference_score(alert, incident);

        // 4. Infrastructure alert affinity
        score += Self::infrastructure_affinity(alert, incident);

        // Bonus for same service / same namespace
        if Self::labels_equal(alert, incident, "service") {
            score += 3;
        }
        if Self::labels_equal(alert, incident, "namespace") {
            score += 2;
        }

        score
    }

    fn labels_equal(alert: &Alert, incident: &Incident, key: &str) -> bool {
        match (alert.label(key), incident.affected_label(key)) {
            (Some(a), Some(i)) => a == i,
            _ => false,
        }
    }

    fn cross_reference_score(alert: &Alert, incident: &Incident) -> i64 {
        let mut score = 0;
        let incident_node = incident.affected_label("node");

        // Alert references an entity from the incident
        for ref_label in CROSS_REFERENCE_LABELS {
            if let Some(ref_value) = alert.label(ref_label) {
                if Some(ref_value) == incident_node {
                    score += 5;
                    tracing::debug!("Cross-reference match: {} -> incident node", ref_label);
                }
                if incident.affected_services.iter().any(|s| s == ref_value) {
                    score += 4;
                    tracing::debug!("Cross-reference match: {} -> incident service", ref_label);
                }
            }
        }

        // Incident references an entity from this alert
        for ref_label in CROSS_REFERENCE_LABELS {
            if let Some(ref_value) = incident.affected_label(ref_label) {
                if alert.label("node") == Some(ref_value) {
                    score += 5;
                }
                if alert.label("service") == Some(ref_value) {
                    score += 4;
                }
            }
        }

        score + Self::annotation_reference_score(alert, incident)
    }

    fn annotation_reference_score(alert: &Alert, incident: &Incident) -> i64 {
        let mut score = 0;
        let alert_text = format!(
            "{} {}",
            alert.annotation("description").unwrap_or(""),
            alert.annotation("summary").unwrap_or("")
        )
        .to_lowercase();

        if let Some(node) = incident.affected_label("node") {
            if !node.is_empty() && alert_text.contains(&node.to_lowercase()) {
                score += 3;
                tracing::debug!("Annotation reference: incident node '{}' in alert text", node);
            }
        }

        for service in incident.affected_services.iter() {
            if !service.is_empty() && alert_text.contains(&service.to_lowercase()) {
                score += 2;
                tracing::debug!("Annotation reference: service '{}' in alert text", service);
            }
        }

        score
    }

    fn is_infra_alert_name(name: &str) -> bool {
        let lower = name.to_lowercase();
        INFRASTRUCTURE_ALERT_PATTERNS.iter().any(|p| lower.contains(p))
    }

    fn incident_has_infra_alert(incident: &Incident) -> bool {
        Self::is_infra_alert_name(&incident.title)
    }

    /// Infrastructure alerts (network, interface, BGP) correlate with symptom
    /// alerts even across namespaces when they share physical location.
    fn infrastructure_affinity(alert: &Alert, incident: &Incident) -> i64 {
        let mut score = 0;
        let alert_is_infra = Self::is_infra_alert_name(&alert.alertname);
        let incident_is_infra = Self::incident_has_infra_alert(incident);

        let incident_in_infra_ns = incident
            .affected_label("namespace")
            .map(|ns| INFRA_NAMESPACES.contains(&ns))
            .unwrap_or(false);
        let alert_in_infra_ns = alert
            .label("namespace")
            .map(|ns| INFRA_NAMESPACES.contains(&ns))
            .unwrap_or(false);

        // Infrastructure alert correlating with a non-infra incident
        if alert_is_infra && !incident_in_infra_ns && Self::labels_equal(alert, incident, "datacenter")
        {
            score += 3;
            tracing::debug!("Infrastructure affinity: infra alert + shared datacenter");
        }

        // Non-infra alert correlating with an infrastructure incident
        if incident_is_infra && !alert_in_infra_ns {
            if Self::labels_equal(alert, incident, "datacenter") {
                score += 3;
                tracing::debug!("Infrastructure affinity: infra incident + shared datacenter");
            }
            if let (Some(path), Some(segment)) =
                (alert.label("network_path"), incident.affected_label("network_segment"))
            {
                if path == segment {
                    score += 4;
                }
            }
        }

        score
    }

    /// Partial label match accommodating random pod-name suffixes:
    /// the segments before the last "-" must be equal.
    fn partial_match(value1: &str, value2: &str) -> bool {
        let base1 = value1.rsplit_once('-').map(|(base, _)| base).unwrap_or(value1);
        let base2 = value2.rsplit_once('-').map(|(base, _)| base).unwrap_or(value2);
        base1 == base2
    }

    /// Service names extracted from an alert's service-like labels.
    fn extract_services(alert: &Alert) -> Vec<String> {
        let mut services = Vec::new();
        for key in ["service", "app", "job", "device"] {
            if let Some(value) = alert.label(key) {
                if !services.iter().any(|s| s == value) {
                    services.push(value.to_string());
                }
            }
        }
        services
    }

    /// Projection of an alert's labels onto the correlation-relevant set.
    fn extract_affected_labels(alert: &Alert) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        for key in CORRELATION_LABELS.iter().chain(INFRASTRUCTURE_LABELS.iter()) {
            if let Some(value) = alert.label(key) {
                labels.insert(key.to_string(), value.to_string());
            }
        }
        labels
    }

    async fn create_incident_for_alert(&self, alert: &Alert) -> Result<Incident, sqlx::Error> {
        let incident = self
            .incident_service
            .create(NewIncident {
                title: alert.alertname.clone(),
                severity: alert.severity.into(),
                started_at: alert.starts_at,
                primary_alert_id: Some(alert.id.clone()),
                correlation_reason: None,
                affected_services: Self::extract_services(alert),
                affected_labels: Self::extract_affected_labels(alert),
            })
            .await?;

        self.alert_service.link_to_incident(&alert.id, &incident.id).await?;

        tracing::info!("Created new incident {} for alert {}", incident.id, alert.alertname);
        Ok(incident)
    }

    async fn add_alert_to_incident(
        &self,
        alert: &Alert,
        incident: &Incident,
    ) -> Result<Incident, sqlx::Error> {
        self.alert_service.link_to_incident(&alert.id, &incident.id).await?;

        // Merge services (including device for network equipment)
        let mut services = incident.affected_services.0.clone();
        for service in Self::extract_services(alert) {
            if !services.contains(&service) {
                services.push(service);
            }
        }

        // Merge correlation-relevant labels; existing values win on conflict
        let mut labels = incident.affected_labels.0.clone();
        for (key, value) in Self::extract_affected_labels(alert) {
            labels.entry(key).or_insert(value);
        }

        // Severity upgrades monotonically
        let alert_severity: IncidentSeverity = alert.severity.into();
        let severity = if alert_severity.rank() > incident.severity.rank() {
            alert_severity
        } else {
            incident.severity
        };

        let reason = Self::generate_correlation_reason(alert, incident);

        self.incident_service
            .update_aggregates(&incident.id, severity, &services, &labels, &reason)
            .await?;

        self.update_primary_alert(&incident.id).await?;

        self.incident_service
            .get(&incident.id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    /// Re-elect the primary (root cause candidate) alert for an incident.
    pub async fn update_primary_alert(&self, incident_id: &str) -> Result<(), sqlx::Error> {
        let alerts = self.alert_service.list_by_incident(incident_id).await?;
        let earliest = match alerts.first() {
            Some(alert) => alert.starts_at,
            None => return Ok(()),
        };

        let mut best: Option<(&Alert, i64)> = None;
        for alert in &alerts {
            let time_bonus = if alert.starts_at == earliest { 1 } else { 0 };
            let score = Self::calculate_causal_score(alert) + time_bonus;
            // Strictly-greater keeps ties on the chronologically earlier alert
            if best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((alert, score));
            }
        }

        if let Some((alert, _)) = best {
            self.incident_service.set_primary_alert(incident_id, &alert.id).await?;
        }
        Ok(())
    }

    /// How likely this alert is to be a root cause rather than a symptom.
    pub fn calculate_causal_score(alert: &Alert) -> i64 {
        let alertname = alert.alertname.to_lowercase();
        let mut score = 0;

        for (indicator, points) in CAUSAL_INDICATORS {
            if alertname.contains(indicator) {
                score += points;
            }
        }

        if alert.severity == crate::models::AlertSeverity::Critical {
            score += 5;
        }

        score
    }

    /// Human-readable rationale for attaching this alert to the incident.
    pub fn generate_correlation_reason(alert: &Alert, incident: &Incident) -> String {
        let mut reasons = Vec::new();

        for label in CORRELATION_LABELS {
            if let (Some(a), Some(i)) = (alert.label(label), incident.affected_label(label)) {
                if a == i {
                    reasons.push(format!("same {}: {}", label, a));
                }
            }
        }

        for label in INFRASTRUCTURE_LABELS {
            if let (Some(a), Some(i)) = (alert.label(label), incident.affected_label(label)) {
                if a == i {
                    reasons.push(format!("shared {}: {}", label, a));
                }
            }
        }

        for ref_label in CROSS_REFERENCE_LABELS {
            if let Some(ref_value) = alert.label(ref_label) {
                if incident.affected_label("node") == Some(ref_value) {
                    reasons.push(format!("{} references incident node", ref_label));
                } else if incident.affected_services.iter().any(|s| s == ref_value) {
                    reasons.push(format!("{} references incident service", ref_label));
                }
            }
        }

        let alert_is_infra = Self::is_infra_alert_name(&alert.alertname);
        let incident_is_infra = Self::incident_has_infra_alert(incident);
        if alert_is_infra && !incident_is_infra {
            if Self::labels_equal(alert, incident, "datacenter") {
                reasons.push("infrastructure alert in same datacenter".to_string());
            }
        } else if incident_is_infra && !alert_is_infra {
            reasons.push("symptom of infrastructure incident".to_string());
        }

        if reasons.is_empty() {
            "Correlated by time proximity".to_string()
        } else {
            reasons.truncate(4);
            format!("Correlated by {}", reasons.join(", "))
        }
    }
}
