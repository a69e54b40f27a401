//! Semantic correlation: decide whether alerts describe the same underlying
//! problem by reasoning over natural-language context, not just labels.

use serde_json::Value;

use crate::models::{Alert, Incident};
use crate::services::llm::{LlmError, LlmProvider};
use std::sync::Arc;

/// Incident categories and their keyword lists for local classification.
const INCIDENT_CATEGORIES: [(&str, &[&str]); 8] = [
    (
        "network_connectivity",
        &[
            "interface down", "link down", "carrier lost", "port down",
            "connection refused", "unreachable", "no route", "network partition",
        ],
    ),
    (
        "network_congestion",
        &[
            "congestion", "packet drop", "buffer overflow", "queue full",
            "bandwidth saturation", "throttling", "qos violation", "traffic spike",
        ],
    ),
    (
        "routing_protocol",
        &[
            "bgp", "ospf", "eigrp", "routing", "neighbor down", "adjacency",
            "route withdrawal", "convergence", "peering",
        ],
    ),
    (
        "database_failure",
        &[
            "database", "postgresql", "mysql", "mongodb", "redis",
            "connection pool", "replication", "replica", "primary", "failover",
        ],
    ),
    (
        "memory_exhaustion",
        &[
            "oom", "out of memory", "memory leak", "heap", "gc pressure",
            "memory exhaustion", "killed", "evicted",
        ],
    ),
    (
        "disk_exhaustion",
        &[
            "disk full", "disk space", "storage", "inode", "quota exceeded",
            "filesystem", "volume",
        ],
    ),
    (
        "service_failure",
        &[
            "crash", "error", "exception", "failed", "unavailable",
            "circuit breaker", "timeout", "unhealthy",
        ],
    ),
    (
        "latency_degradation",
        &[
            "latency", "slow", "degraded", "response time", "p99", "p95",
            "high latency", "performance",
        ],
    ),
];

/// Category pairs that never share a root cause.
const INCOMPATIBLE_PAIRS: [(&str, &str); 6] = [
    ("network_connectivity", "memory_exhaustion"),
    ("network_connectivity", "disk_exhaustion"),
    ("network_congestion", "database_failure"),
    ("network_congestion", "memory_exhaustion"),
    ("routing_protocol", "disk_exhaustion"),
    ("memory_exhaustion", "disk_exhaustion"),
];

pub struct SemanticCorrelator {
    llm: Arc<dyn LlmProvider>,
}

impl SemanticCorrelator {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }

    fn extract_alert_context(alert: &Alert) -> String {
        let network_segment = alert
            .label("network_segment")
            .or_else(|| alert.label("network_path"))
            .unwrap_or("unknown");

        let mut context = format!(
            "Alert: {}\nSeverity: {}\nService: {}\nNamespace: {}\nDatacenter: {}\nNetwork Segment: {}\nSummary: {}\nDescription: {}",
            alert.alertname,
            alert.severity.as_str(),
            alert.label("service").unwrap_or("unknown"),
            alert.label("namespace").unwrap_or("unknown"),
            alert.label("datacenter").unwrap_or("unknown"),
            network_segment,
            alert.annotation("summary").unwrap_or("N/A"),
            alert.annotation("description").unwrap_or("N/A"),
        );

        for label in ["node", "interface", "cluster", "upstream", "downstream", "peer"] {
            if let Some(value) = alert.label(label) {
                context.push_str(&format!("\n{}: {}", label, value));
            }
        }

        context
    }

    fn extract_incident_context(incident: &Incident, alerts: &[Alert]) -> String {
        let network_segment = incident
            .affected_label("network_segment")
            .or_else(|| incident.affected_label("network_path"))
            .unwrap_or("unknown");

        let mut context = format!(
            "Incident: {}\nAffected Services: {}\nDatacenter: {}\nNetwork Segment: {}\nCorrelation Reason: {}\n\nAlerts in this incident:",
            incident.title,
            incident.affected_services.join(", "),
            incident.affected_label("datacenter").unwrap_or("unknown"),
            network_segment,
            incident.correlation_reason.as_deref().unwrap_or("N/A"),
        );

        for alert in alerts.iter().take(5) {
            context.push_str(&format!(
                "\n- {}: {}",
                alert.alertname,
                alert.annotation("summary").unwrap_or("N/A")
            ));
        }

        context
    }

    /// Classify an alert into an incident category.
    ///
    /// The score is the fraction of the category's keywords found in the
    /// alert's combined textual context.
    pub fn categorize_alert(alert: &Alert) -> (&'static str, f64) {
        let text = Self::extract_alert_context(alert).to_lowercase();

        let mut best_category = "unknown";
        let mut best_score = 0.0;

        for (category, keywords) in INCIDENT_CATEGORIES {
            let matched = keywords.iter().filter(|kw| text.contains(*kw)).count();
            let normalized = matched as f64 / keywords.len() as f64;
            if normalized > best_score {
                best_score = normalized;
                best_category = category;
            }
        }

        (best_category, best_score)
    }

    fn are_categories_incompatible(cat1: &str, cat2: &str) -> bool {
        INCOMPATIBLE_PAIRS
            .iter()
            .any(|(a, b)| (cat1 == *a && cat2 == *b) || (cat1 == *b && cat2 == *a))
    }

    /// Decide whether an alert belongs to a candidate incident.
    ///
    /// Returns (is_related, reason, confidence). A hard category conflict
    /// short-circuits without an LLM round-trip; on LLM failure the decision
    /// degrades to a category comparison.
    pub async fn are_semantically_related(
        &self,
        alert: &Alert,
        incident: &Incident,
        incident_alerts: &[Alert],
    ) -> (bool, String, f64) {
        let (alert_category, alert_score) = Self::categorize_alert(alert);

        let mut incident_categories: Vec<&str> = incident_alerts
            .iter()
            .map(|a| Self::categorize_alert(a).0)
            .collect();
        incident_categories.sort();
        incident_categories.dedup();

        // Confidently different category against a single-category incident
        if !incident_categories.contains(&alert_category)
            && alert_score > 0.3
            && incident_categories.len() == 1
            && incident_categories[0] != "unknown"
        {
            let other = incident_categories[0];
            if Self::are_categories_incompatible(alert_category, other) {
                return (
                    false,
                    format!("Different incident type: {} vs {}", alert_category, other),
                    0.8,
                );
            }
        }

        let alert_dc = alert.label("datacenter").unwrap_or("unknown").to_string();
        let incident_dc = incident
            .affected_label("datacenter")
            .unwrap_or("unknown")
            .to_string();
        let same_dc = alert_dc == incident_dc;

        let prompt = format!(
            r#"Analyze if these two issues should be grouped into the SAME incident or kept SEPARATE.

NEW ALERT (Datacenter: {alert_dc}):
{alert_context}

EXISTING INCIDENT (Datacenter: {incident_dc}):
{incident_context}

CRITICAL: The alert is in datacenter '{alert_dc}' and the incident is in datacenter '{incident_dc}'.
These are {dc_relation} datacenters.

Rules:
1. DIFFERENT datacenters = SEPARATE incidents (related: false) unless there's a clear upstream/downstream dependency
2. SAME datacenter + SAME network segment + related issue type = SAME incident (related: true)
3. SAME datacenter + SAME device = SAME incident (related: true)

Respond with JSON:
{{
    "related": true/false,
    "confidence": 0.0-1.0,
    "reason": "brief explanation"
}}"#,
            alert_dc = alert_dc,
            incident_dc = incident_dc,
            alert_context = Self::extract_alert_context(alert),
            incident_context = Self::extract_incident_context(incident, incident_alerts),
            dc_relation = if same_dc { "THE SAME" } else { "DIFFERENT" },
        );

        match self.ask_llm(&prompt).await {
            Ok(result) => {
                let related = result["related"].as_bool().unwrap_or(false);
                let reason = result["reason"]
                    .as_str()
                    .unwrap_or("LLM analysis")
                    .to_string();
                let confidence = result["confidence"].as_f64().unwrap_or(0.5);
                (related, reason, confidence)
            }
            Err(e) => {
                tracing::warn!("LLM semantic analysis failed: {}", e);
                if incident_categories.contains(&alert_category) {
                    (true, format!("Same incident category: {}", alert_category), 0.6)
                } else {
                    (false, "Unable to determine relationship".to_string(), 0.3)
                }
            }
        }
    }

    async fn ask_llm(&self, prompt: &str) -> Result<Value, LlmError> {
        let messages = [serde_json::json!({"role": "user", "content": prompt})];
        let response = self.llm.chat(&messages, None, None, 500, 0.1).await?;

        match response.content {
            Some(content) => Ok(Self::parse_llm_response(&content)),
            None => Err(LlmError::ParseError("Empty response from LLM".to_string())),
        }
    }

    /// Parse the LLM's JSON verdict, tolerating markdown code fences and
    /// falling back to keyword sniffing on malformed output.
    pub fn parse_llm_response(content: &str) -> Value {
        let mut content = content.trim();

        if let Some(start) = content.find("```json") {
            let rest = &content[start + 7..];
            content = rest.split("```").next().unwrap_or(rest).trim();
        } else if let Some(start) = content.find("```") {
            let rest = &content[start + 3..];
            content = rest.split("```").next().unwrap_or(rest).trim();
        }

        match serde_json::from_str::<Value>(content) {
            Ok(value) => value,
            Err(_) => {
                let lower = content.to_lowercase();
                let related = lower.contains("\"related\": true")
                    || lower.contains("\"related\":true")
                    || (lower.contains("related") && lower.contains("true"));
                serde_json::json!({
                    "related": related,
                    "confidence": 0.5,
                    "reason": "Parse error",
                })
            }
        }
    }

    /// Find the best matching incident for an alert.
    ///
    /// Returns the highest-confidence related candidate or (None, reason, 0.0).
    pub async fn find_best_incident<'a>(
        &self,
        alert: &Alert,
        candidates: &'a [(Incident, Vec<Alert>)],
    ) -> (Option<&'a Incident>, String, f64) {
        let mut best_match = None;
        let mut best_reason = "No semantic match found".to_string();
        let mut best_confidence = 0.0;

        for (incident, incident_alerts) in candidates {
            let (is_related, reason, confidence) = self
                .are_semantically_related(alert, incident, incident_alerts)
                .await;

            if is_related && confidence > best_confidence {
                best_match = Some(incident);
                best_reason = reason;
                best_confidence = confidence;
            }
        }

        (best_match, best_reason, best_confidence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AlertSeverity, AlertStatus};
    use chrono::Utc;
    use sqlx::types::Json;
    use std::collections::HashMap;

    fn alert_with(alertname: &str, summary: &str, labels: &[(&str, &str)]) -> Alert {
        let labels: HashMap<String, String> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut annotations = HashMap::new();
        annotations.insert("summary".to_string(), summary.to_string());
        let now = Utc::now();
        Alert {
            id: uuid::Uuid::new_v4().to_string(),
            fingerprint: uuid::Uuid::new_v4().to_string(),
            alertname: alertname.to_string(),
            severity: AlertSeverity::Critical,
            status: AlertStatus::Firing,
            labels: Json(labels),
            annotations: Json(annotations),
            starts_at: now,
            ends_at: None,
            generator_url: None,
            incident_id: None,
            received_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn categorizes_network_alert() {
        let alert = alert_with(
            "NetworkInterfaceDown",
            "Interface down on switch port, host unreachable",
            &[("device", "sw-01")],
        );
        let (category, score) = SemanticCorrelator::categorize_alert(&alert);
        assert_eq!(category, "network_connectivity");
        assert!(score > 0.0);
    }

    #[test]
    fn categorizes_memory_alert() {
        let alert = alert_with(
            "PodOOMKilled",
            "Container killed: out of memory, oom killer invoked",
            &[("service", "api")],
        );
        let (category, _) = SemanticCorrelator::categorize_alert(&alert);
        assert_eq!(category, "memory_exhaustion");
    }

    #[test]
    fn incompatible_pairs_are_symmetric() {
        assert!(SemanticCorrelator::are_categories_incompatible(
            "network_connectivity",
            "memory_exhaustion"
        ));
        assert!(SemanticCorrelator::are_categories_incompatible(
            "memory_exhaustion",
            "network_connectivity"
        ));
        assert!(!SemanticCorrelator::are_categories_incompatible(
            "network_connectivity",
            "routing_protocol"
        ));
    }

    #[test]
    fn parses_plain_json_response() {
        let parsed = SemanticCorrelator::parse_llm_response(
            r#"{"related": true, "confidence": 0.9, "reason": "same device"}"#,
        );
        assert_eq!(parsed["related"], true);
        assert_eq!(parsed["confidence"], 0.9);
    }

    #[test]
    fn parses_fenced_json_response() {
        let parsed = SemanticCorrelator::parse_llm_response(
            "Here is my verdict:\n```json\n{\"related\": false, \"confidence\": 0.7, \"reason\": \"different dc\"}\n```",
        );
        assert_eq!(parsed["related"], false);
        assert_eq!(parsed["reason"], "different dc");
    }

    #[test]
    fn malformed_response_falls_back_to_keywords() {
        let parsed =
            SemanticCorrelator::parse_llm_response("I think related = true, roughly speaking");
        assert_eq!(parsed["related"], true);
        assert_eq!(parsed["reason"], "Parse error");

        let parsed = SemanticCorrelator::parse_llm_response("no idea what these are");
        assert_eq!(parsed["related"], false);
    }
}
