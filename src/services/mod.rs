pub mod alert_service;
pub mod cache;
pub mod correlation_service;
pub mod cortex_client;
pub mod incident_service;
pub mod llm;
pub mod loki_client;
pub mod rca_agent;
pub mod report_service;
pub mod semantic_correlator;
pub mod webhook_service;

pub use alert_service::{AlertFilters, AlertService, NewAlert};
pub use correlation_service::CorrelationService;
pub use cortex_client::{Aggregation, Anomaly, CortexClient};
pub use incident_service::{valid_transitions, IncidentFilters, IncidentService, NewIncident};
pub use llm::{create_llm_provider, LlmError, LlmProvider, LlmResponse, ToolCall, ToolDefinition};
pub use loki_client::{LokiClient, SampleStrategy};
pub use rca_agent::{run_incident_rca, AnalysisMetadata, AnalysisOutcome, RcaAgent};
pub use report_service::{ReportFilters, ReportService};
pub use semantic_correlator::SemanticCorrelator;
pub use webhook_service::{WebhookOutcome, WebhookService};

/// Errors from the log/metric backend clients.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },
}
