//! Agentic RCA orchestrator.
//!
//! Drives a bounded tool-calling loop against the configured LLM provider:
//! prompt assembly with pinned query timestamps, argument normalization,
//! tool execution, and multi-level fallback synthesis when the model fails
//! to produce a report.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use utoipa::ToSchema;

use crate::config::RcaConfig;
use crate::models::{Alert, Incident};
use crate::services::alert_service::AlertService;
use crate::services::cortex_client::CortexClient;
use crate::services::incident_service::IncidentService;
use crate::services::llm::{LlmProvider, ToolDefinition};
use crate::services::loki_client::LokiClient;
use crate::services::report_service::ReportService;
use crate::tools::{generate_report, query_cortex, query_loki};
use crate::AppState;

/// Wait applied before retrying a rate-limited provider call.
const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(5);

/// Consecutive rate-limit retries allowed before giving up on the run.
const MAX_RATE_LIMIT_RETRIES: u32 = 5;

/// Base system prompt for RCA analysis.
const RCA_SYSTEM_PROMPT: &str = r#"You are an expert Site Reliability Engineer (SRE) and Root Cause Analysis specialist. Your task is to analyze alerts from infrastructure monitoring systems and determine the root cause of issues.

## Your Workflow

1. **Understand the Alert(s)**: Analyze alert details including severity, labels, annotations, and timing.
   - For multiple correlated alerts, identify the chronological sequence
   - Pay attention to which alert fired first - it's often closest to root cause

2. **Gather Evidence**: Use the available tools to query logs (Loki) and metrics (Cortex) related to the alert.
   - Query logs for error messages, exceptions, and relevant events
   - Query metrics for resource utilization, error rates, and performance indicators
   - Focus on the time window around the alert (typically 15 minutes before to 5 minutes after)

3. **Analyze Patterns**: Look for:
   - Error patterns in logs (exceptions, failures, timeouts)
   - Resource exhaustion (CPU, memory, disk, network)
   - Cascading failures (one failure causing others)
   - Configuration changes or deployments
   - External dependency issues

4. **Determine Root Cause**: Based on evidence:
   - Identify the primary cause vs symptoms
   - Assign a confidence score (0-100%)
   - Document supporting evidence

5. **Generate Report**: Call the generate_report tool with:
   - Clear root cause description
   - Confidence score with justification
   - Timeline of events
   - Supporting evidence (key logs and metrics)
   - Actionable remediation steps (both immediate and long-term)

## Multi-Alert Correlation Analysis

When analyzing multiple correlated alerts:

1. **Order alerts chronologically** - The first alert is often the root cause
2. **Identify the causal chain** - Map how one failure triggered subsequent failures
3. **Distinguish root cause from symptoms**:
   - ROOT CAUSE indicators: disk full, OOM killer, resource quota exceeded, configuration error
   - SYMPTOM indicators: health check failed, service unavailable, high latency, timeout

Common causal patterns:
- **Resource Exhaustion Chain**: DiskFull -> LogWriteFailed -> ServiceCrash -> HealthCheckFailed
- **Memory Pressure Chain**: MemoryPressure -> OOMKilled -> PodRestart -> ServiceDegraded
- **Network Chain**: NetworkPartition -> TimeoutErrors -> RetryStorms -> CircuitBreakerOpen
- **Dependency Chain**: DatabaseOverload -> SlowQueries -> APITimeout -> UserErrors

For multi-alert incidents the report must focus root_cause on the PRIMARY cause
(not symptoms), explain the full causal chain in the summary, include ALL
correlated alerts in the timeline, and address the root cause first in
remediation before preventive measures for the cascade.

## Tool Usage Guidelines

- **query_loki**: Use LogQL to search logs. Start with broad queries, then narrow down.
  - Example: `{service="payment-api"} |= "error"` for error logs
  - Example: `{namespace="production"} |~ "OOM|OutOfMemory"` for memory issues

- **query_cortex**: Use PromQL to query metrics.
  - Example: `100 * (1 - avg(rate(node_cpu_seconds_total{mode="idle"}[5m])))` for CPU
  - Example: `rate(http_requests_total{status=~"5.."}[5m])` for error rates

- **generate_report**: Call this ONCE when you have enough evidence to make a determination.

## Remediation Guidelines

### MANDATORY: EVERY REMEDIATION STEP REQUIRES A COMMAND

THIS IS NON-NEGOTIABLE: Every single remediation step MUST have a `command` field with an actual shell command.
DO NOT skip the command field. DO NOT provide empty commands. DO NOT provide placeholder commands.

Every step should include three kinds of commands when applicable:
1. **Verification Command**: How to verify/diagnose the issue (e.g., `ip link show eth0`)
2. **Fix Command**: How to fix the issue (e.g., `sudo ip link set eth0 up`)
3. **Validation Command**: How to confirm the fix worked (e.g., `ping -c 3 10.0.0.1`)

Immediate actions (priority: "immediate") restore service NOW: restart, scale,
rollback, cleanup. Long-term actions (priority: "long_term") prevent
recurrence: config changes, monitoring, architecture, process.

For EACH remediation step provide:
- **action**: Clear, concise action title
- **command**: REQUIRED - specific shell command(s) to run
- **description**: How to verify the issue, apply the fix, and validate it worked
- **risk**: "low" (safe), "medium" (brief impact), "high" (potential data loss)
- **category**: restart, scale, config, cleanup, rollback, or investigate
- **estimated_impact**: no_downtime, brief_downtime, service_restart, data_loss_risk
- **requires_approval**: true for high-risk actions
- **automation_ready**: true if action can be scripted, false if needs human judgment

Common remediation patterns:

| Issue Type | Verification | Fix Command | Validation |
|------------|--------------|-------------|------------|
| Network Interface Down | `ip link show <dev>` | `sudo ip link set <dev> up` | `ping -c 3 <gateway>` |
| Disk Full | `df -h` | `sudo rm -rf /var/log/*.gz` | `df -h` |
| OOM | `free -m` | `kubectl rollout restart deploy/<name>` | `kubectl get pods` |
| CPU Saturation | `top -bn1 \| head -20` | `kubectl scale deploy/<name> --replicas=3` | `kubectl get pods` |
| Service Down | `systemctl status <svc>` | `sudo systemctl restart <svc>` | `systemctl status <svc>` |
| Container Crash | `docker ps -a` | `docker restart <id>` | `docker ps` |

## Important Notes

- Always provide evidence for your conclusions
- If data is unavailable, note it in the report
- Be specific in remediation steps - include commands when appropriate
- Order remediation steps by priority: immediate actions first
- Assign lower confidence scores when evidence is incomplete
- For high-risk actions, set requires_approval: true
"#;

/// Analysis run metadata attached to every outcome.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AnalysisMetadata {
    pub provider: String,
    pub model: String,
    pub tokens_used: u64,
    pub duration_seconds: f64,
    pub tool_calls: u32,
}

/// Result of one orchestrated analysis.
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub success: bool,
    pub report: Option<Value>,
    pub error: Option<String>,
    pub warning: Option<String>,
    pub metadata: AnalysisMetadata,
}

pub struct RcaAgent {
    llm: Arc<dyn LlmProvider>,
    loki: Arc<LokiClient>,
    cortex: Arc<CortexClient>,
    max_iterations: u32,
    tools: Vec<ToolDefinition>,
    system_prompt: String,
    total_tokens: u64,
    tool_calls: u32,
    started_at: Option<Instant>,
    // Pinned query window; tool-call timestamps are always overwritten with
    // these to defeat hallucinated dates.
    query_start_time: Option<String>,
    query_end_time: Option<String>,
}

impl RcaAgent {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        loki: Arc<LokiClient>,
        cortex: Arc<CortexClient>,
        rca: &RcaConfig,
    ) -> Self {
        let system_prompt = Self::build_system_prompt(rca);
        tracing::info!("RCA agent initialized with {} provider ({})", llm.name(), llm.model());
        Self {
            llm,
            loki,
            cortex,
            max_iterations: rca.max_iterations,
            tools: vec![
                query_loki::tool_definition(),
                query_cortex::tool_definition(),
                generate_report::tool_definition(),
            ],
            system_prompt,
            total_tokens: 0,
            tool_calls: 0,
            started_at: None,
            query_start_time: None,
            query_end_time: None,
        }
    }

    /// Expert context from a file path wins over the inline setting; with
    /// neither, the generic SRE prompt stands alone.
    fn build_system_prompt(rca: &RcaConfig) -> String {
        let mut expert_context = String::new();

        let file_path = rca.expert_context_file.trim();
        if !file_path.is_empty() {
            match std::fs::read_to_string(file_path) {
                Ok(content) => {
                    expert_context = content.trim().to_string();
                    tracing::info!("Loaded RCA expert context from file: {}", file_path);
                }
                Err(e) => tracing::warn!("Failed to load expert context file: {}", e),
            }
        }

        if expert_context.is_empty() {
            expert_context = rca.expert_context.trim().to_string();
            if !expert_context.is_empty() {
                tracing::info!("Using inline RCA expert context from configuration");
            }
        }

        if expert_context.is_empty() {
            RCA_SYSTEM_PROMPT.to_string()
        } else {
            format!("{}\n\n{}", RCA_SYSTEM_PROMPT, expert_context)
        }
    }

    pub async fn analyze_alert(&mut self, alert: &Alert) -> AnalysisOutcome {
        self.started_at = Some(Instant::now());
        self.total_tokens = 0;
        self.tool_calls = 0;

        let prompt = self.format_alert_for_analysis(alert);
        self.run_agent_loop(&prompt).await
    }

    pub async fn analyze_incident(
        &mut self,
        incident: &Incident,
        alerts: &[Alert],
    ) -> AnalysisOutcome {
        self.started_at = Some(Instant::now());
        self.total_tokens = 0;
        self.tool_calls = 0;

        let prompt = self.format_incident_for_analysis(incident, alerts);
        self.run_agent_loop(&prompt).await
    }

    /// Pin the query window for this run: start 15 minutes before the
    /// earliest signal, end at now (or shortly after the signal if later).
    fn pin_query_window(&mut self, reference: DateTime<Utc>, now: DateTime<Utc>) -> (String, String) {
        let query_start = reference - ChronoDuration::minutes(15);
        let query_end = std::cmp::max(now, reference + ChronoDuration::minutes(5));

        let start_iso = query_start.format("%Y-%m-%dT%H:%M:%SZ").to_string();
        let end_iso = query_end.format("%Y-%m-%dT%H:%M:%SZ").to_string();

        self.query_start_time = Some(start_iso.clone());
        self.query_end_time = Some(end_iso.clone());
        (start_iso, end_iso)
    }

    pub(crate) fn format_alert_for_analysis(&mut self, alert: &Alert) -> String {
        let data = json!({
            "alertname": alert.alertname,
            "severity": alert.severity.as_str(),
            "status": alert.status.as_str(),
            "labels": alert.labels.0,
            "annotations": alert.annotations.0,
            "starts_at": alert.starts_at.to_rfc3339(),
            "ends_at": alert.ends_at.map(|t| t.to_rfc3339()),
        });

        let now = Utc::now();
        let (query_start_iso, query_end_iso) = self.pin_query_window(alert.starts_at, now);

        let logql_hints = query_loki::LogQlQueryBuilder::new(&alert.labels.0)
            .get_query_hints(&alert.alertname);
        let promql_hints = query_cortex::PromQlQueryBuilder::new(&alert.labels.0)
            .get_query_hints(&alert.alertname);

        let dependencies = Self::detect_dependencies(&alert.labels.0, &alert.alertname);
        let dependency_hints = if dependencies.is_empty() {
            String::new()
        } else {
            format!(
                "\n\n## Potential Dependencies\n\nConsider querying these related services: {}",
                dependencies.join(", ")
            )
        };

        format!(
            r#"Please analyze the following alert and determine its root cause:

## Alert Details

```json
{data}
```

## Time Context - USE THESE EXACT TIMESTAMPS

- Alert Start: {starts_at}
- Current Time: {now}
- **Query Start Time (use this)**: {query_start}
- **Query End Time (use this)**: {query_end}

IMPORTANT: When calling query_loki or query_cortex, use these EXACT values:
- start_time: "{query_start}"
- end_time: "{query_end}"

## Query Hints

{logql_hints}

{promql_hints}{dependency_hints}

## Instructions

1. Query relevant logs and metrics using the timestamps above
2. Identify the root cause of this alert
3. Generate a comprehensive RCA report with remediation steps

Begin your analysis by querying for relevant data."#,
            data = serde_json::to_string_pretty(&data).unwrap_or_default(),
            starts_at = alert.starts_at.to_rfc3339(),
            now = now.to_rfc3339(),
            query_start = query_start_iso,
            query_end = query_end_iso,
            logql_hints = logql_hints,
            promql_hints = promql_hints,
            dependency_hints = dependency_hints,
        )
    }

    fn format_incident_for_analysis(&mut self, incident: &Incident, alerts: &[Alert]) -> String {
        let mut alerts_sorted: Vec<&Alert> = alerts.iter().collect();
        alerts_sorted.sort_by_key(|a| a.starts_at);

        let primary_alert_id = incident.primary_alert_id.as_deref();
        let alerts_data: Vec<Value> = alerts_sorted
            .iter()
            .map(|alert| {
                json!({
                    "alertname": alert.alertname,
                    "severity": alert.severity.as_str(),
                    "status": alert.status.as_str(),
                    "labels": alert.labels.0,
                    "annotations": alert.annotations.0,
                    "starts_at": alert.starts_at.to_rfc3339(),
                    "is_primary": Some(alert.id.as_str()) == primary_alert_id,
                })
            })
            .collect();

        let earliest = alerts_sorted
            .first()
            .map(|a| a.starts_at)
            .unwrap_or(incident.started_at);

        let now = Utc::now();
        let query_start = earliest - ChronoDuration::minutes(15);
        let start_iso = query_start.format("%Y-%m-%dT%H:%M:%SZ").to_string();
        let end_iso = now.format("%Y-%m-%dT%H:%M:%SZ").to_string();
        self.query_start_time = Some(start_iso.clone());
        self.query_end_time = Some(end_iso.clone());

        let initial_timeline: Vec<Value> = alerts_data
            .iter()
            .enumerate()
            .map(|(i, info)| {
                json!({
                    "timestamp": info["starts_at"],
                    "event": format!("Alert fired: {}", info["alertname"].as_str().unwrap_or("?")),
                    "severity": info["severity"],
                    "is_primary": info["is_primary"],
                    "order": i + 1,
                })
            })
            .collect();

        let incident_data = json!({
            "title": incident.title,
            "severity": incident.severity.as_str(),
            "affected_services": incident.affected_services.0,
            "started_at": incident.started_at.to_rfc3339(),
            "alert_count": alerts.len(),
            "correlation_reason": incident.correlation_reason,
        });

        let first_target = alerts_sorted
            .first()
            .and_then(|a| a.label("service").or_else(|| a.label("device")))
            .unwrap_or("unknown");

        format!(
            r#"Please analyze the following incident with multiple correlated alerts and determine the root cause:

## Incident Summary

```json
{incident_data}
```

## Correlated Alerts (in chronological order)

```json
{alerts_data}
```

## Initial Timeline (alerts only - enrich with logs/metrics)

```json
{initial_timeline}
```

## Correlation Context

- **Why correlated**: {correlation_reason}
- **Primary alert (suspected root cause)**: The alert marked with `is_primary: true` is the system's initial guess
- **Your task**: Verify or correct this assessment based on evidence

## Time Context - USE THESE EXACT TIMESTAMPS

- Incident Start: {incident_start}
- Current Time: {now}
- **Query Start Time (use this)**: {query_start}
- **Query End Time (use this)**: {query_end}

IMPORTANT: When calling query_loki or query_cortex, use these EXACT values:
- start_time: "{query_start}"
- end_time: "{query_end}"

## Instructions

1. Analyze the sequence of alerts to understand the cascade of events
2. Query relevant logs and metrics using the timestamps above
3. Identify the PRIMARY root cause (the first failure that triggered the chain)
4. Distinguish between the root cause and secondary symptoms
5. Generate a comprehensive RCA report with:
   - Clear identification of root cause vs symptoms
   - Timeline showing the progression of failures (include all alerts plus key log/metric events)
   - Evidence from logs and metrics
   - Remediation steps addressing both the root cause and preventive measures

## IMPORTANT: You MUST use tools

1. FIRST: Call the `query_loki` tool to search for error logs from the primary alert's service
2. THEN: Analyze the log results to understand what happened
3. FINALLY: Call the `generate_report` tool with your findings

Do NOT respond with text only. You MUST call query_loki first to investigate.

Begin by calling query_loki for: {first_target}"#,
            incident_data = serde_json::to_string_pretty(&incident_data).unwrap_or_default(),
            alerts_data = serde_json::to_string_pretty(&alerts_data).unwrap_or_default(),
            initial_timeline = serde_json::to_string_pretty(&initial_timeline).unwrap_or_default(),
            correlation_reason = incident
                .correlation_reason
                .as_deref()
                .unwrap_or("Time proximity and label matching"),
            incident_start = incident.started_at.to_rfc3339(),
            now = now.to_rfc3339(),
            query_start = start_iso,
            query_end = end_iso,
            first_target = first_target,
        )
    }

    /// Heuristic service-dependency suggestions from the alert context.
    pub fn detect_dependencies(labels: &HashMap<String, String>, alertname: &str) -> Vec<String> {
        let mut dependencies: Vec<String> = Vec::new();
        let service = labels.get("service").map(String::as_str).unwrap_or("");
        let service_lower = service.to_lowercase();
        let alertname_lower = alertname.to_lowercase();

        // API services often depend on databases
        if ["api", "backend", "service"].iter().any(|x| service_lower.contains(x)) {
            for db in ["postgres", "mysql", "redis", "mongodb"] {
                dependencies.push(db.to_string());
            }
        }

        // Database alerts affect their client services
        if ["database", "db", "postgres", "mysql", "redis"]
            .iter()
            .any(|x| alertname_lower.contains(x))
        {
            dependencies.push("all-api-services".to_string());
        }

        // Network issues might affect everything downstream in the namespace
        if ["network", "connection", "timeout"].iter().any(|x| alertname_lower.contains(x)) {
            if let Some(namespace) = labels.get("namespace") {
                dependencies.push(format!("all-services-in-{}", namespace));
            }
        }

        // A job label suggests siblings sharing its base name
        if let Some(job) = labels.get("job") {
            if let Some((base, _)) = job.rsplit_once('-') {
                dependencies.push(format!("{}-*", base));
            }
        }

        dependencies.truncate(5);
        dependencies
    }

    /// Normalize tool arguments: map common alias names, pin timestamps, and
    /// default the report's required fields.
    pub fn normalize_tool_input(&self, tool_name: &str, arguments: Value) -> Value {
        let mut args = match arguments {
            Value::Object(map) => Value::Object(map),
            // Some providers send arguments as a JSON string
            Value::String(s) => serde_json::from_str(&s).unwrap_or(json!({})),
            _ => json!({}),
        };

        let rename = |args: &mut Value, wrong: &str, correct: &str| {
            if let Some(obj) = args.as_object_mut() {
                if let Some(value) = obj.remove(wrong) {
                    obj.entry(correct.to_string()).or_insert(value);
                }
            }
        };

        match tool_name {
            "query_loki" => {
                rename(&mut args, "start", "start_time");
                rename(&mut args, "end", "end_time");
                rename(&mut args, "query", "logql_query");
                rename(&mut args, "logql", "logql_query");
                self.pin_timestamps(&mut args);
            }
            "query_cortex" => {
                rename(&mut args, "start", "start_time");
                rename(&mut args, "end", "end_time");
                rename(&mut args, "query", "promql_query");
                rename(&mut args, "promql", "promql_query");
                self.pin_timestamps(&mut args);
            }
            "generate_report" => {
                rename(&mut args, "root", "root_cause");
                rename(&mut args, "cause", "root_cause");
                rename(&mut args, "confidence", "confidence_score");
                rename(&mut args, "score", "confidence_score");

                if args.get("root_cause").and_then(|v| v.as_str()).is_none() {
                    let fallback = args["summary"]
                        .as_str()
                        .unwrap_or("Root cause could not be determined from available evidence")
                        .to_string();
                    args["root_cause"] = json!(fallback);
                }
                if args.get("summary").and_then(|v| v.as_str()).is_none() {
                    let fallback = args["root_cause"]
                        .as_str()
                        .unwrap_or("Analysis completed")
                        .to_string();
                    args["summary"] = json!(fallback);
                }

                // Coerce confidence to an integer and clamp to [0, 100]
                let confidence = match &args["confidence_score"] {
                    Value::Number(n) => n.as_f64().map(|f| f as i64),
                    Value::String(s) => s.parse::<f64>().ok().map(|f| f as i64),
                    _ => None,
                };
                args["confidence_score"] = json!(confidence.unwrap_or(50).clamp(0, 100));
            }
            _ => {}
        }

        args
    }

    /// Overwrite the model-provided window with the pinned one. LLMs often
    /// hallucinate timestamps drawn from training data.
    fn pin_timestamps(&self, args: &mut Value) {
        if let (Some(start), Some(end)) = (&self.query_start_time, &self.query_end_time) {
            args["start_time"] = json!(start);
            args["end_time"] = json!(end);
        }
    }

    async fn execute_tool(&self, tool_name: &str, args: &Value) -> Value {
        match tool_name {
            "query_loki" => query_loki::execute_query_loki(&self.loki, args).await,
            "query_cortex" => query_cortex::execute_query_cortex(&self.cortex, args).await,
            "generate_report" => generate_report::execute_generate_report(args),
            other => json!({"error": format!("Unknown tool: {}", other)}),
        }
    }

    async fn run_agent_loop(&mut self, initial_prompt: &str) -> AnalysisOutcome {
        let mut messages: Vec<Value> = vec![json!({"role": "user", "content": initial_prompt})];
        let mut iteration: u32 = 0;
        let mut rate_limit_retries: u32 = 0;
        let mut report_data: Option<Value> = None;

        while iteration < self.max_iterations {
            iteration += 1;
            tracing::info!(
                "RCA agent iteration {}/{} using {}",
                iteration,
                self.max_iterations,
                self.llm.name()
            );

            let response = match self
                .llm
                .chat(&messages, Some(&self.tools), Some(&self.system_prompt), 4096, 0.0)
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!("LLM error: {}", e);
                    if e.is_rate_limit() && rate_limit_retries < MAX_RATE_LIMIT_RETRIES {
                        rate_limit_retries += 1;
                        tracing::info!(
                            "Rate limited, waiting {:?} before retrying the same iteration",
                            RATE_LIMIT_BACKOFF
                        );
                        tokio::time::sleep(RATE_LIMIT_BACKOFF).await;
                        // Retry without consuming the iteration budget
                        iteration -= 1;
                        continue;
                    }
                    return self.error_outcome(format!("LLM error ({}): {}", self.llm.name(), e));
                }
            };

            self.total_tokens += response.usage.total();

            if response.is_complete() {
                if let Some(report) = report_data.take() {
                    return self.finalize(report, None);
                }

                // Keep the final text in the transcript for fallback scanning
                if let Some(content) = &response.content {
                    messages.push(json!({"role": "assistant", "content": content}));
                }

                if self.tool_calls > 0 && iteration + 1 < self.max_iterations {
                    tracing::info!(
                        "Model stopped after {} tool calls without report, prompting to continue",
                        self.tool_calls
                    );
                    let force_level = if iteration >= 5 { "CRITICAL" } else { "IMPORTANT" };
                    messages.push(json!({
                        "role": "user",
                        "content": format!(
                            "**{}**: You MUST call the `generate_report` tool NOW to complete this analysis.\n\n\
                             Based on the evidence gathered (or lack thereof), call generate_report with:\n\
                             - root_cause: Your best assessment of what caused the issue (even if uncertain)\n\
                             - confidence_score: 0-100 (use lower scores if evidence is limited)\n\
                             - summary: Brief description of the incident and findings\n\
                             - remediation_steps: Array with at least one step having 'priority' and 'action' fields\n\n\
                             If you couldn't find logs or metrics, that's OK - report what you know from the alert itself.\n\
                             DO NOT respond with text. ONLY call the generate_report tool.",
                            force_level
                        ),
                    }));
                    continue;
                }

                tracing::info!("Agent completed analysis without generating report");
                let combined = Self::collect_assistant_text(&messages);
                if combined.len() > 50 {
                    return self.create_fallback_report(&combined);
                }
                return self.error_outcome("Agent completed without generating a report".to_string());
            }

            if response.has_tool_calls() {
                messages.push(self.llm.format_assistant_message(&response));

                for tool_call in &response.tool_calls {
                    self.tool_calls += 1;
                    tracing::info!("Executing tool: {}", tool_call.name);
                    let args = self.normalize_tool_input(&tool_call.name, tool_call.arguments.clone());
                    let result = self.execute_tool(&tool_call.name, &args).await;

                    if tool_call.name == "generate_report" && result["success"] == true {
                        report_data = result.get("report").cloned();
                    }

                    // Every tool_use gets its tool_result, even after the
                    // report is captured, to keep the transcript well-formed
                    messages.push(self.llm.format_tool_result(&tool_call.id, &tool_call.name, &result));
                }

                if let Some(report) = report_data.take() {
                    return self.finalize(report, None);
                }
            } else {
                tracing::warn!("Unexpected state: stop_reason={:?}", response.stop_reason);
                if let Some(content) = &response.content {
                    messages.push(json!({"role": "assistant", "content": content}));
                    messages.push(json!({
                        "role": "user",
                        "content": "Please continue your analysis and generate the report using the generate_report tool.",
                    }));
                }
            }
        }

        tracing::warn!("Max iterations ({}) reached", self.max_iterations);
        if let Some(report) = report_data {
            return self.finalize(report, None);
        }

        let combined = Self::collect_assistant_text(&messages);
        if combined.len() > 50 {
            tracing::info!("Max iterations reached - creating fallback report from conversation");
            return self.create_fallback_report(&combined);
        }

        tracing::info!("Max iterations reached - creating minimal report from alerts");
        self.create_minimal_report(initial_prompt)
    }

    fn collect_assistant_text(messages: &[Value]) -> String {
        messages
            .iter()
            .filter(|m| m["role"] == "assistant")
            .filter_map(|m| m["content"].as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn finalize(&self, report: Value, warning: Option<String>) -> AnalysisOutcome {
        AnalysisOutcome {
            success: true,
            report: Some(report),
            error: None,
            warning,
            metadata: self.metadata(),
        }
    }

    fn error_outcome(&self, error: String) -> AnalysisOutcome {
        AnalysisOutcome {
            success: false,
            report: None,
            error: Some(error),
            warning: None,
            metadata: self.metadata(),
        }
    }

    fn metadata(&self) -> AnalysisMetadata {
        AnalysisMetadata {
            provider: self.llm.name().to_string(),
            model: self.llm.model().to_string(),
            tokens_used: self.total_tokens,
            duration_seconds: self
                .started_at
                .map(|s| (s.elapsed().as_millis() as f64 / 10.0).round() / 100.0)
                .unwrap_or(0.0),
            tool_calls: self.tool_calls,
        }
    }

    fn truncate_chars(text: &str, max_chars: usize) -> String {
        text.chars().take(max_chars).collect()
    }

    /// Build a report from the model's text analysis when it never called
    /// generate_report. Low confidence by construction.
    fn create_fallback_report(&self, text_analysis: &str) -> AnalysisOutcome {
        let lines: Vec<&str> = text_analysis.trim().lines().collect();

        let summary_lines: Vec<&str> = lines
            .iter()
            .take(5)
            .filter(|line| !line.trim().is_empty() && line.len() > 20)
            .copied()
            .collect();
        let summary = if summary_lines.is_empty() {
            "Analysis completed via text response".to_string()
        } else {
            Self::truncate_chars(&summary_lines.join(" "), 500)
        };

        let root_cause_indicators = ["root cause", "caused by", "issue is", "problem is", "due to"];
        let root_cause = lines
            .iter()
            .find(|line| {
                let lower = line.to_lowercase();
                root_cause_indicators.iter().any(|i| lower.contains(i))
            })
            .map(|line| Self::truncate_chars(line.trim(), 500))
            .unwrap_or_else(|| "Unable to definitively determine root cause".to_string());

        let action_indicators =
            ["recommend", "suggest", "should", "need to", "must", "fix", "resolve", "restart", "scale"];
        let mut remediation_steps: Vec<Value> = lines
            .iter()
            .filter(|line| {
                let lower = line.to_lowercase();
                line.len() > 20 && action_indicators.iter().any(|i| lower.contains(i))
            })
            .take(3)
            .map(|line| {
                json!({
                    "priority": "immediate",
                    "action": Self::truncate_chars(line.trim(), 200),
                    "risk": "low",
                })
            })
            .collect();

        if remediation_steps.is_empty() {
            remediation_steps.push(json!({
                "priority": "immediate",
                "action": "Review the text analysis above for specific remediation steps",
                "risk": "low",
            }));
        }

        let report = json!({
            "root_cause": root_cause,
            "confidence_score": 30,
            "summary": format!("[Fallback Report] {}", summary),
            "timeline": [],
            "evidence": {"logs": [], "metrics": []},
            "remediation_steps": remediation_steps,
            "_fallback": true,
            "_text_analysis": Self::truncate_chars(text_analysis, 2000),
        });

        tracing::info!(
            "Created fallback report with {} remediation steps",
            report["remediation_steps"].as_array().map(Vec::len).unwrap_or(0)
        );

        self.finalize(
            report,
            Some(
                "This report was generated from text analysis as the model did not use the \
                 generate_report tool"
                    .to_string(),
            ),
        )
    }

    /// Last resort: a minimal report extracted from the alert fields in the
    /// initial prompt.
    fn create_minimal_report(&self, initial_prompt: &str) -> AnalysisOutcome {
        static ALERTNAME_RE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r#""alertname":\s*"([^"]+)""#).expect("valid regex"));
        static SERVICE_RE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r#""service":\s*"([^"]+)""#).expect("valid regex"));
        static DEVICE_RE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r#""device":\s*"([^"]+)""#).expect("valid regex"));
        static DESCRIPTION_RE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r#""description":\s*"([^"]+)""#).expect("valid regex"));
        static SUMMARY_RE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r#""summary":\s*"([^"]+)""#).expect("valid regex"));

        let capture = |re: &Regex| {
            re.captures(initial_prompt)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
        };

        let alert_name = capture(&ALERTNAME_RE).unwrap_or_else(|| "Unknown".to_string());
        // Network equipment carries a device label instead of service
        let service = capture(&SERVICE_RE)
            .or_else(|| capture(&DEVICE_RE))
            .unwrap_or_else(|| "Unknown".to_string());
        let description = capture(&SUMMARY_RE)
            .or_else(|| capture(&DESCRIPTION_RE))
            .unwrap_or_else(|| "Analysis incomplete".to_string());

        let report = json!({
            "root_cause": format!("Alert '{}' on service '{}' - {}", alert_name, service, description),
            "confidence_score": 40,
            "summary": format!(
                "[Minimal Report] The RCA agent was unable to complete full analysis within \
                 iteration limits. Alert '{}' fired for service '{}'. {}. Manual investigation \
                 recommended.",
                alert_name, service, description
            ),
            "timeline": [{
                "timestamp": Utc::now().to_rfc3339(),
                "event": format!("Alert {} triggered investigation", alert_name),
                "source": "alert",
                "details": null,
            }],
            "evidence": {"logs": [], "metrics": []},
            "remediation_steps": [
                {
                    "priority": "immediate",
                    "action": format!("Investigate {} on {}", alert_name, service),
                    "description": description,
                    "risk": "low",
                },
                {
                    "priority": "immediate",
                    "action": "Check service logs and metrics manually",
                    "description": "The automated analysis could not gather sufficient evidence. Manual log review recommended.",
                    "risk": "low",
                },
            ],
        });

        tracing::info!("Created minimal report for {} on {}", alert_name, service);

        self.finalize(
            report,
            Some("This is a minimal report created because the agent exceeded max iterations".to_string()),
        )
    }
}

/// Detached post-commit RCA task for one incident.
///
/// Transitions the incident to `analyzing`, runs the agent, persists the
/// report, and returns the incident to `open`. Any failure marks the report
/// failed; it never propagates to other incidents.
pub async fn run_incident_rca(state: Arc<AppState>, incident_id: String) {
    // Let the ingestion transaction become durably visible before reading
    tokio::time::sleep(Duration::from_secs(1)).await;

    let llm = match &state.llm_provider {
        Some(llm) => Arc::clone(llm),
        None => {
            tracing::warn!("RCA skipped for incident {}: no LLM provider configured", incident_id);
            return;
        }
    };

    let incident_service = IncidentService::new(state.db.clone());
    let alert_service = AlertService::new(state.db.clone());
    let report_service = ReportService::new(state.db.clone());

    let incident = match incident_service.get(&incident_id).await {
        Ok(Some(incident)) => incident,
        Ok(None) => {
            tracing::warn!("RCA skipped: incident {} not found", incident_id);
            return;
        }
        Err(e) => {
            tracing::error!("RCA task failed to load incident {}: {}", incident_id, e);
            return;
        }
    };

    match incident_service.transition_to_analyzing(&incident_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            tracing::warn!(
                "RCA skipped for incident {}: cannot transition {} -> analyzing",
                incident_id,
                incident.status.as_str()
            );
            return;
        }
        Err(e) => {
            tracing::error!("RCA task failed to mark incident {} analyzing: {}", incident_id, e);
            return;
        }
    }

    let report = match report_service.get_by_incident(&incident_id).await {
        Ok(Some(report)) => report,
        Ok(None) => match report_service.create_pending(&incident_id).await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!("Failed to create pending report for {}: {}", incident_id, e);
                let _ = incident_service.update_status(&incident_id, crate::models::IncidentStatus::Open).await;
                return;
            }
        },
        Err(e) => {
            tracing::error!("Failed to load report for {}: {}", incident_id, e);
            let _ = incident_service.update_status(&incident_id, crate::models::IncidentStatus::Open).await;
            return;
        }
    };

    let alerts = alert_service.list_by_incident(&incident_id).await.unwrap_or_default();

    let mut agent = RcaAgent::new(
        llm,
        Arc::clone(&state.loki_client),
        Arc::clone(&state.cortex_client),
        &state.config.rca,
    );

    let outcome = match alerts.len() {
        0 => {
            let _ = report_service
                .mark_failed(&report.id, "Incident has no linked alerts", None)
                .await;
            let _ = incident_service.update_status(&incident_id, crate::models::IncidentStatus::Open).await;
            return;
        }
        1 => agent.analyze_alert(&alerts[0]).await,
        _ => agent.analyze_incident(&incident, &alerts).await,
    };

    if let Some(warning) = &outcome.warning {
        tracing::warn!("RCA for incident {}: {}", incident_id, warning);
    }

    let metadata = serde_json::to_value(&outcome.metadata).ok();

    match (outcome.success, outcome.report) {
        (true, Some(report_data)) => {
            if let Err(e) = report_service
                .update_from_analysis(&report.id, &report_data, metadata.as_ref())
                .await
            {
                tracing::error!("Failed to persist report for incident {}: {}", incident_id, e);
            } else {
                let _ = incident_service.set_rca_completed(&incident_id).await;
                tracing::info!(
                    "RCA complete for incident {} (confidence: {})",
                    incident_id,
                    report_data["confidence_score"]
                );
            }
        }
        _ => {
            let error = outcome.error.unwrap_or_else(|| "RCA produced no report".to_string());
            tracing::error!("RCA failed for incident {}: {}", incident_id, error);
            if let Err(e) = report_service.mark_failed(&report.id, &error, metadata.as_ref()).await {
                tracing::error!("Failed to mark report failed for {}: {}", incident_id, e);
            }
        }
    }

    // RCA never resolves an incident by itself; resolution belongs to
    // ingestion. A resolved-while-analyzing incident stays resolved.
    if let Ok(Some(current)) = incident_service.get(&incident_id).await {
        if current.status == crate::models::IncidentStatus::Analyzing {
            let _ = incident_service.update_status(&incident_id, crate::models::IncidentStatus::Open).await;
        }
    }
}
