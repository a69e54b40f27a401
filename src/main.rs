use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use argus_rca::config::Config;
use argus_rca::services::llm::create_llm_provider;
use argus_rca::{db, handlers, models, services, AppState};

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::webhook::alertmanager_webhook,

        handlers::alerts::list_alerts,
        handlers::alerts::get_alert,

        handlers::incidents::list_incidents,
        handlers::incidents::get_incident,
        handlers::incidents::get_incident_alerts,
        handlers::incidents::correlate_alerts,
        handlers::incidents::reset_stuck_incidents,

        handlers::reports::list_reports,
        handlers::reports::get_report,
        handlers::reports::get_incident_report,
        handlers::reports::export_report,

        handlers::cache_stats::get_cache_stats,
        handlers::health::health_check,
        handlers::health::ready_check,
    ),
    components(
        schemas(
            models::AlertSeverity,
            models::AlertStatus,
            models::AlertResponse,
            models::AlertListResponse,
            models::AlertmanagerStatus,
            models::AlertmanagerAlert,
            models::AlertmanagerWebhookPayload,
            models::WebhookAcceptedResponse,
            models::IncidentStatus,
            models::IncidentSeverity,
            models::IncidentSummary,
            models::IncidentResponse,
            models::IncidentListResponse,
            models::ManualCorrelationRequest,
            models::ManualCorrelationResponse,
            models::ResetStuckResponse,
            models::RcaReportStatus,
            models::RcaReportResponse,
            models::RcaReportListResponse,
            services::AnalysisMetadata,
            services::cache::CacheStats,
            services::cache::QueryCacheStats,
            handlers::health::ReadinessChecks,
            handlers::health::ReadinessResponse,
        )
    ),
    tags(
        (name = "webhooks", description = "Alertmanager webhook ingestion"),
        (name = "alerts", description = "Alert read API"),
        (name = "incidents", description = "Incident read API and manual correlation"),
        (name = "reports", description = "RCA report read API and export"),
        (name = "admin", description = "Operational endpoints"),
        (name = "health", description = "Liveness and readiness"),
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let log_filter = tracing_subscriber::EnvFilter::new(&config.logging.level);
    let registry = tracing_subscriber::registry().with(log_filter);

    // Hold the non-blocking writer guard for the process lifetime
    let _log_guard;
    if let Some(log_file) = &config.logging.file {
        let log_path = std::path::Path::new(log_file);
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let log_dir = log_path.parent().and_then(|p| p.to_str()).unwrap_or("logs");
        let file_name = log_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("argus.log");
        let file_prefix = file_name.strip_suffix(".log").unwrap_or(file_name);

        let file_appender = tracing_appender::rolling::daily(log_dir, file_prefix);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        _log_guard = Some(guard);
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        _log_guard = None;
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    tracing::info!("Argus starting up");
    tracing::info!("Configuration loaded successfully");

    let pool = db::create_pool(&config.database.url).await?;
    tracing::info!("Database pool created and migrations applied");

    let llm_provider = match create_llm_provider(&config.llm) {
        Ok(provider) => Some(provider),
        Err(e) => {
            tracing::warn!("LLM provider unavailable, RCA disabled: {}", e);
            None
        }
    };

    let state = Arc::new(AppState::new(pool, config.clone(), llm_provider));

    let api_routes = Router::new()
        .route("/api/v1/alerts", get(handlers::alerts::list_alerts))
        .route("/api/v1/alerts/:id", get(handlers::alerts::get_alert))
        .route("/api/v1/incidents", get(handlers::incidents::list_incidents))
        .route("/api/v1/incidents/:id", get(handlers::incidents::get_incident))
        .route(
            "/api/v1/incidents/:id/alerts",
            get(handlers::incidents::get_incident_alerts),
        )
        .route(
            "/api/v1/incidents/:id/correlate",
            post(handlers::incidents::correlate_alerts),
        )
        .route(
            "/api/v1/incidents/:id/report",
            get(handlers::reports::get_incident_report),
        )
        .route("/api/v1/reports", get(handlers::reports::list_reports))
        .route("/api/v1/reports/:id", get(handlers::reports::get_report))
        .route("/api/v1/reports/:id/export", get(handlers::reports::export_report))
        .route(
            "/api/v1/admin/incidents/reset-stuck",
            post(handlers::incidents::reset_stuck_incidents),
        )
        .route("/api/v1/cache/stats", get(handlers::cache_stats::get_cache_stats));

    let webhook_routes = Router::new().route(
        "/webhooks/alertmanager",
        post(handlers::webhook::alertmanager_webhook),
    );

    let health_routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::ready_check));

    let app = Router::new()
        .merge(SwaggerUi::new("/api-docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_routes)
        .merge(webhook_routes)
        .merge(health_routes)
        .with_state(Arc::clone(&state))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive());

    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on http://{}", addr);
    tracing::info!("API documentation available at http://{}/api-docs", addr);
    tracing::info!("Argus is ready to serve requests");

    axum::serve(listener, app).await?;

    Ok(())
}
