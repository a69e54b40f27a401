//! Argus Library
//!
//! Automated root-cause analysis for infrastructure alerts: webhook
//! ingestion, alert-to-incident correlation, and an LLM-driven RCA agent.

use sqlx::SqlitePool;
use std::sync::Arc;

pub mod config;
pub mod db;
pub mod handlers;
pub mod models;
pub mod services;
pub mod tools;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use services::llm::{create_llm_provider, LlmError, LlmProvider};
pub use services::{
    AlertService, CorrelationService, CortexClient, IncidentService, LokiClient, RcaAgent,
    ReportService, WebhookService,
};

/// Application shared state.
///
/// Rust's type system is the DI container: every service is wrapped in Arc
/// for cheap cloning and thread safety.
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub config: Arc<Config>,

    pub alert_service: Arc<AlertService>,
    pub incident_service: Arc<IncidentService>,
    pub report_service: Arc<ReportService>,
    pub webhook_service: Arc<WebhookService>,

    pub loki_client: Arc<LokiClient>,
    pub cortex_client: Arc<CortexClient>,

    /// Absent when no provider is configured; ingestion still works, RCA and
    /// semantic correlation are skipped.
    pub llm_provider: Option<Arc<dyn LlmProvider>>,
}

impl AppState {
    pub fn new(db: SqlitePool, config: Config, llm_provider: Option<Arc<dyn LlmProvider>>) -> Self {
        let config = Arc::new(config);
        let loki_client = Arc::new(LokiClient::from_config(&config.observability));
        let cortex_client = Arc::new(CortexClient::from_config(&config.observability));

        Self {
            alert_service: Arc::new(AlertService::new(db.clone())),
            incident_service: Arc::new(IncidentService::new(db.clone())),
            report_service: Arc::new(ReportService::new(db.clone())),
            webhook_service: Arc::new(WebhookService::new(
                db.clone(),
                &config.rca,
                llm_provider.clone(),
            )),
            loki_client,
            cortex_client,
            llm_provider,
            db,
            config,
        }
    }
}

#[cfg(test)]
mod tests;
