//! Report generation tool: validates the agent's findings into the final RCA
//! report structure, inferring shell commands for steps that lack one.

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

use crate::services::llm::ToolDefinition;

/// Tool descriptor declared to the LLM.
pub fn tool_definition() -> ToolDefinition {
    ToolDefinition {
        name: "generate_report".to_string(),
        description: "Generate the final RCA report with root cause, confidence score, evidence, \
                      and remediation steps. Call this tool when you have gathered enough \
                      information to make a determination about the root cause."
            .to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "root_cause": {
                    "type": "string",
                    "description": "Clear description of the identified root cause based on the evidence. Be specific about what failed and why. Must be derived from the actual logs and metrics you queried, not from examples.",
                },
                "confidence_score": {
                    "type": "integer",
                    "minimum": 0,
                    "maximum": 100,
                    "description": "Confidence level in the root cause analysis (0-100%). 100% = definitive evidence, 75% = strong indicators, 50% = likely but incomplete evidence, <50% = uncertain",
                },
                "summary": {
                    "type": "string",
                    "description": "Executive summary (2-3 sentences) for quick understanding. Include: what happened, impact, and resolution status.",
                },
                "timeline": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "timestamp": {"type": "string", "description": "ISO 8601 timestamp"},
                            "event": {"type": "string", "description": "What happened"},
                            "source": {
                                "type": "string",
                                "enum": ["alert", "log", "metric"],
                                "description": "Event source",
                            },
                        },
                        "required": ["timestamp", "event", "source"],
                    },
                    "description": "Chronological sequence of events leading to the incident",
                },
                "evidence": {
                    "type": "object",
                    "properties": {
                        "logs": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "timestamp": {"type": "string"},
                                    "message": {"type": "string"},
                                    "labels": {"type": "object"},
                                },
                                "required": ["timestamp", "message"],
                            },
                            "description": "Key log entries supporting the analysis",
                        },
                        "metrics": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "name": {"type": "string"},
                                    "value": {"type": "number"},
                                    "timestamp": {"type": "string"},
                                    "labels": {"type": "object"},
                                },
                                "required": ["name", "value", "timestamp"],
                            },
                            "description": "Key metrics supporting the analysis",
                        },
                    },
                    "description": "Evidence from logs and metrics",
                },
                "remediation_steps": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "priority": {
                                "type": "string",
                                "enum": ["immediate", "long_term"],
                                "description": "Action urgency: 'immediate' for actions to take now, 'long_term' for preventive measures",
                            },
                            "action": {
                                "type": "string",
                                "description": "Concise action title (e.g., 'Restart the payment-api pod')",
                            },
                            "command": {
                                "type": "string",
                                "description": "Specific command to run (e.g., 'kubectl rollout restart deployment/payment-api -n prod')",
                            },
                            "description": {
                                "type": "string",
                                "description": "Detailed explanation of why this action is needed and expected outcome",
                            },
                            "risk": {
                                "type": "string",
                                "enum": ["low", "medium", "high"],
                                "description": "Risk level: 'low' (safe), 'medium' (brief impact), 'high' (potential data loss/downtime)",
                            },
                            "category": {
                                "type": "string",
                                "enum": ["restart", "scale", "config", "cleanup", "rollback", "investigate", "other"],
                                "description": "Action category for grouping similar actions",
                            },
                            "estimated_impact": {
                                "type": "string",
                                "enum": ["no_downtime", "brief_downtime", "service_restart", "data_loss_risk"],
                                "description": "Expected impact on service availability",
                            },
                            "requires_approval": {
                                "type": "boolean",
                                "description": "Whether this action requires manual approval (true for high-risk actions)",
                            },
                            "automation_ready": {
                                "type": "boolean",
                                "description": "Whether this step can be automated (false if requires human judgment)",
                            },
                        },
                        "required": ["priority", "action"],
                    },
                    "description": "Steps to resolve the issue and prevent recurrence",
                },
            },
            "required": ["root_cause", "confidence_score", "summary", "remediation_steps"],
        }),
    }
}

/// Some providers send structured arguments as JSON strings; decode them
/// before rejecting.
fn parse_json_arg(value: Option<&Value>, arg_name: &str) -> Option<Value> {
    let value = value?;
    match value {
        Value::Null => None,
        Value::String(s) => match serde_json::from_str(s) {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                tracing::warn!("{} is a non-JSON string, ignored", arg_name);
                None
            }
        },
        other => Some(other.clone()),
    }
}

static DEVICE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(eth\d+|veth\d+|ens\d+\w*|enp\d+s\d+\w*|dummy\d+)").expect("valid regex")
});
static SERVICE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([a-zA-Z]\w*(?:-\w+)*(?:\.service)?)").expect("valid regex"));

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Infer a shell command from the action text when the LLM doesn't provide
/// one. Returns None only when no pattern matches.
pub fn infer_command_from_action(action: &str, root_cause: &str) -> Option<String> {
    let action_lower = action.to_lowercase();
    let combined = format!("{} {}", action_lower, root_cause.to_lowercase());

    // Network interface patterns
    if contains_any(&combined, &["interface", "network", "eth", "veth", "ens", "enp"]) {
        let device = DEVICE_RE
            .find(&combined)
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| "eth0".to_string());

        if contains_any(&action_lower, &["bring up", "set up", "restore", "enable", "fix"]) {
            return Some(format!("sudo ip link set {} up", device));
        }
        if contains_any(&action_lower, &["verify", "check", "status", "investigate"]) {
            return Some(format!("ip link show {}", device));
        }
        if contains_any(&action_lower, &["ping", "connectivity", "network"]) {
            return Some("ping -c 3 $(ip route | grep default | awk '{print $3}')".to_string());
        }
        if contains_any(&action_lower, &["dmesg", "kernel", "log"]) {
            return Some(format!("dmesg | tail -50 | grep -i {}", device));
        }
        return Some(format!("ip link show {}", device));
    }

    // Disk space patterns
    if contains_any(&combined, &["disk", "space", "storage", "full"]) {
        if contains_any(&action_lower, &["clean", "clear", "remove", "delete"]) {
            return Some("sudo find /var/log -name '*.gz' -mtime +7 -delete".to_string());
        }
        return Some("df -h".to_string());
    }

    // Memory patterns
    if contains_any(&combined, &["memory", "oom", "ram"]) {
        if contains_any(&action_lower, &["check", "verify", "status"]) {
            return Some("free -m".to_string());
        }
        return Some("free -m && top -bn1 | head -20".to_string());
    }

    // CPU patterns
    if contains_any(&combined, &["cpu", "load", "process"]) {
        return Some("top -bn1 | head -20".to_string());
    }

    // Kubernetes patterns (checked before generic service/container words)
    if contains_any(&combined, &["kubernetes", "kubectl", "k8s", "deployment", "pod"]) {
        if contains_any(&action_lower, &["restart", "rollout"]) {
            return Some("kubectl rollout restart deployment/<deployment-name>".to_string());
        }
        if contains_any(&action_lower, &["scale"]) {
            return Some("kubectl scale deployment/<deployment-name> --replicas=3".to_string());
        }
        return Some("kubectl get pods".to_string());
    }

    // systemd service patterns
    if contains_any(&combined, &["service", "systemd", "daemon"]) {
        const STOPWORDS: [&str; 12] = [
            "restart", "start", "stop", "check", "status", "verify", "the", "a", "an",
            "service", "systemd", "daemon",
        ];
        let service = SERVICE_RE
            .find_iter(&combined)
            .map(|m| m.as_str().trim_end_matches(".service"))
            .find(|candidate| !STOPWORDS.contains(candidate))
            .map(String::from)
            .unwrap_or_else(|| "service-name".to_string());

        if action_lower.contains("restart") {
            return Some(format!("sudo systemctl restart {}", service));
        }
        if action_lower.contains("start") {
            return Some(format!("sudo systemctl start {}", service));
        }
        return Some(format!("systemctl status {}", service));
    }

    // Docker/container patterns
    if contains_any(&combined, &["container", "docker"]) {
        if action_lower.contains("restart") {
            return Some("docker ps -a && docker restart <container_id>".to_string());
        }
        if action_lower.contains("logs") {
            return Some("docker logs --tail 100 <container_id>".to_string());
        }
        return Some("docker ps -a".to_string());
    }

    // Generic investigation
    if contains_any(&action_lower, &["investigate", "review", "check", "verify"]) {
        return Some("journalctl -xe --no-pager | tail -100".to_string());
    }
    if contains_any(&action_lower, &["log", "error"]) {
        return Some("journalctl -xe --no-pager | tail -50".to_string());
    }

    None
}

const VALID_CATEGORIES: [&str; 7] =
    ["restart", "scale", "config", "cleanup", "rollback", "investigate", "other"];

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

fn build_timeline(timeline: Option<Value>) -> Vec<Value> {
    let timeline = match timeline {
        Some(Value::Array(events)) => events,
        Some(Value::Object(event)) => vec![Value::Object(event)],
        _ => return Vec::new(),
    };

    timeline
        .into_iter()
        .filter_map(|event| match event {
            Value::Object(obj) => Some(json!({
                "timestamp": obj.get("timestamp").and_then(|v| v.as_str()).map(String::from).unwrap_or_else(now_iso),
                "event": obj.get("event").and_then(|v| v.as_str()).unwrap_or(""),
                "source": obj.get("source").and_then(|v| v.as_str()).unwrap_or("alert"),
                "details": obj.get("details").cloned().unwrap_or(Value::Null),
            })),
            Value::String(text) => Some(json!({
                "timestamp": now_iso(),
                "event": text,
                "source": "alert",
                "details": Value::Null,
            })),
            _ => None,
        })
        .collect()
}

fn build_evidence(evidence: Option<Value>) -> Value {
    let mut logs: Vec<Value> = Vec::new();
    let mut metrics: Vec<Value> = Vec::new();

    if let Some(Value::Object(evidence)) = evidence {
        if let Some(Value::Array(raw_logs)) = evidence.get("logs") {
            for log in raw_logs {
                match log {
                    Value::Object(obj) => logs.push(json!({
                        "timestamp": obj.get("timestamp").and_then(|v| v.as_str()).map(String::from).unwrap_or_else(now_iso),
                        "message": obj.get("message").and_then(|v| v.as_str()).unwrap_or(""),
                        "source": obj.get("source").and_then(|v| v.as_str()).unwrap_or("loki"),
                        "labels": obj.get("labels").cloned().unwrap_or(json!({})),
                    })),
                    Value::String(message) => logs.push(json!({
                        "timestamp": now_iso(),
                        "message": message,
                        "source": "loki",
                        "labels": {},
                    })),
                    _ => {}
                }
            }
        }
        if let Some(Value::Array(raw_metrics)) = evidence.get("metrics") {
            for metric in raw_metrics {
                if let Value::Object(obj) = metric {
                    let value = obj
                        .get("value")
                        .and_then(|v| match v {
                            Value::String(s) => s.parse::<f64>().ok(),
                            other => other.as_f64(),
                        })
                        .unwrap_or(0.0);
                    metrics.push(json!({
                        "name": obj.get("name").and_then(|v| v.as_str()).unwrap_or("unknown"),
                        "value": value,
                        "timestamp": obj.get("timestamp").and_then(|v| v.as_str()).map(String::from).unwrap_or_else(now_iso),
                        "labels": obj.get("labels").cloned().unwrap_or(json!({})),
                    }));
                }
            }
        }
    }

    json!({"logs": logs, "metrics": metrics})
}

fn build_remediation_steps(
    remediation_steps: Option<Value>,
    root_cause: &str,
) -> Result<Vec<Value>, String> {
    let steps_raw = match remediation_steps {
        Some(Value::Array(steps)) => steps,
        Some(Value::Object(step)) => vec![Value::Object(step)],
        Some(Value::String(text)) => vec![json!({"priority": "immediate", "action": text})],
        _ => Vec::new(),
    };

    let mut steps = Vec::new();
    for step in steps_raw {
        let step = match step {
            Value::Object(obj) => Value::Object(obj),
            Value::String(text) => json!({"priority": "immediate", "action": text}),
            _ => continue,
        };

        let priority = step["priority"].as_str().unwrap_or("immediate");
        if priority != "immediate" && priority != "long_term" {
            return Err(format!(
                "priority must be 'immediate' or 'long_term', got '{}'",
                priority
            ));
        }

        let risk = step["risk"].as_str().unwrap_or("low");
        if !["low", "medium", "high"].contains(&risk) {
            return Err(format!("risk must be 'low', 'medium', or 'high', got '{}'", risk));
        }

        // Unknown category degrades to "other" rather than failing the report
        let category = step["category"].as_str().map(|c| {
            if VALID_CATEGORIES.contains(&c) {
                c.to_string()
            } else {
                "other".to_string()
            }
        });

        let action = step["action"].as_str().unwrap_or("").to_string();
        let command = step["command"]
            .as_str()
            .map(String::from)
            .or_else(|| infer_command_from_action(&action, root_cause));

        steps.push(json!({
            "priority": priority,
            "action": action,
            "command": command,
            "description": step.get("description").and_then(|v| v.as_str()),
            "risk": risk,
            "category": category,
            "estimated_impact": step.get("estimated_impact").and_then(|v| v.as_str()),
            "requires_approval": step["requires_approval"].as_bool().unwrap_or(false),
            "automation_ready": step["automation_ready"].as_bool().unwrap_or(false),
        }));
    }

    Ok(steps)
}

/// Validate and format the RCA report from the tool arguments.
pub fn execute_generate_report(args: &Value) -> Value {
    let root_cause = match args["root_cause"].as_str() {
        Some(rc) => rc.to_string(),
        None => return json!({"success": false, "error": "missing required field: root_cause"}),
    };
    let summary = match args["summary"].as_str() {
        Some(s) => s.to_string(),
        None => return json!({"success": false, "error": "missing required field: summary"}),
    };
    let confidence_raw = args["confidence_score"]
        .as_i64()
        .or_else(|| args["confidence_score"].as_f64().map(|f| f as i64));
    let confidence_score = match confidence_raw {
        Some(score) if (0..=100).contains(&score) => score,
        Some(score) => {
            return json!({
                "success": false,
                "error": format!("confidence_score must be in [0, 100], got {}", score),
            })
        }
        None => {
            return json!({"success": false, "error": "missing required field: confidence_score"})
        }
    };

    let timeline = parse_json_arg(args.get("timeline"), "timeline");
    let evidence = parse_json_arg(args.get("evidence"), "evidence");
    let remediation_steps = parse_json_arg(args.get("remediation_steps"), "remediation_steps");

    let steps = match build_remediation_steps(remediation_steps, &root_cause) {
        Ok(steps) => steps,
        Err(e) => return json!({"success": false, "error": e}),
    };

    json!({
        "success": true,
        "report": {
            "root_cause": root_cause,
            "confidence_score": confidence_score,
            "summary": summary,
            "timeline": build_timeline(timeline),
            "evidence": build_evidence(evidence),
            "remediation_steps": steps,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_valid_report() {
        let result = execute_generate_report(&json!({
            "root_cause": "Disk full on node-3",
            "confidence_score": 85,
            "summary": "The data disk filled up.",
            "remediation_steps": [{"priority": "immediate", "action": "Clean up old logs"}],
        }));
        assert_eq!(result["success"], true);
        let report = &result["report"];
        assert_eq!(report["confidence_score"], 85);
        assert_eq!(report["timeline"], json!([]));
        assert_eq!(report["evidence"], json!({"logs": [], "metrics": []}));
        // "clean" against a disk root cause infers a cleanup command
        assert_eq!(
            report["remediation_steps"][0]["command"],
            "sudo find /var/log -name '*.gz' -mtime +7 -delete"
        );
    }

    #[test]
    fn confidence_out_of_range_rejected() {
        let result = execute_generate_report(&json!({
            "root_cause": "x",
            "confidence_score": 150,
            "summary": "y",
            "remediation_steps": [],
        }));
        assert_eq!(result["success"], false);
        assert!(result["error"].as_str().unwrap().contains("confidence_score"));
    }

    #[test]
    fn invalid_priority_rejected() {
        let result = execute_generate_report(&json!({
            "root_cause": "x",
            "confidence_score": 50,
            "summary": "y",
            "remediation_steps": [{"priority": "someday", "action": "do it"}],
        }));
        assert_eq!(result["success"], false);
        assert!(result["error"].as_str().unwrap().contains("priority"));
    }

    #[test]
    fn unknown_category_becomes_other() {
        let result = execute_generate_report(&json!({
            "root_cause": "x",
            "confidence_score": 50,
            "summary": "y",
            "remediation_steps": [{
                "priority": "immediate",
                "action": "Restart the api service",
                "category": "wizardry",
            }],
        }));
        assert_eq!(result["success"], true);
        assert_eq!(result["report"]["remediation_steps"][0]["category"], "other");
    }

    #[test]
    fn json_string_arguments_are_parsed() {
        let result = execute_generate_report(&json!({
            "root_cause": "x",
            "confidence_score": 60,
            "summary": "y",
            "timeline": "[{\"timestamp\": \"2025-01-01T00:00:00Z\", \"event\": \"alert fired\", \"source\": \"alert\"}]",
            "remediation_steps": "[{\"priority\": \"immediate\", \"action\": \"Check memory usage\"}]",
        }));
        assert_eq!(result["success"], true);
        assert_eq!(result["report"]["timeline"][0]["event"], "alert fired");
        assert_eq!(
            result["report"]["remediation_steps"][0]["command"],
            "free -m"
        );
    }

    #[test]
    fn string_steps_are_wrapped() {
        let result = execute_generate_report(&json!({
            "root_cause": "network partition",
            "confidence_score": 70,
            "summary": "y",
            "remediation_steps": ["Verify interface eth2 status"],
        }));
        assert_eq!(result["success"], true);
        let step = &result["report"]["remediation_steps"][0];
        assert_eq!(step["priority"], "immediate");
        assert_eq!(step["command"], "ip link show eth2");
    }

    #[test]
    fn evidence_accepts_plain_string_logs() {
        let result = execute_generate_report(&json!({
            "root_cause": "x",
            "confidence_score": 50,
            "summary": "y",
            "evidence": {"logs": ["connection refused from upstream"], "metrics": []},
            "remediation_steps": [],
        }));
        let log = &result["report"]["evidence"]["logs"][0];
        assert_eq!(log["message"], "connection refused from upstream");
        assert_eq!(log["source"], "loki");
    }

    #[test]
    fn command_inference_patterns() {
        assert_eq!(
            infer_command_from_action("Bring up interface eth0", "interface down"),
            Some("sudo ip link set eth0 up".to_string())
        );
        assert_eq!(
            infer_command_from_action("Check disk usage", "disk full"),
            Some("df -h".to_string())
        );
        assert_eq!(
            infer_command_from_action("Scale the deployment", "too many requests"),
            Some("kubectl scale deployment/<deployment-name> --replicas=3".to_string())
        );
        assert_eq!(infer_command_from_action("", ""), None);
    }
}
