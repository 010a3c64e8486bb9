//! # Server Configuration
//!
//! Router assembly, OpenAPI documentation and the serve loop for the sync
//! engine's management API.

use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

use crate::auth::auth_middleware;
use crate::config::AppConfig;
use crate::engine::Engine;
use crate::handlers;
use crate::telemetry::trace_context_middleware;

/// Application state shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub engine: Arc<Engine>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            config: Arc::clone(&engine.config),
            engine,
        }
    }
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/sync/jobs",
            post(handlers::jobs::create_job).get(handlers::jobs::list_jobs),
        )
        .route(
            "/sync/jobs/{id}",
            get(handlers::jobs::get_job).delete(handlers::jobs::cancel_job),
        )
        .route("/sync/jobs/{id}/retry", post(handlers::jobs::retry_job))
        .route("/sync/jobs/{id}/errors", get(handlers::jobs::list_job_errors))
        .route("/sync/statistics", get(handlers::statistics::get_statistics))
        .route("/sync/webhooks", post(handlers::webhooks::register_webhook))
        .route("/sync/webhooks/{id}/retry", post(handlers::webhooks::retry_webhook))
        .route("/sync/webhooks/{id}/logs", get(handlers::webhooks::list_webhook_logs))
        .route("/sync/conflicts", get(handlers::conflicts::list_conflicts))
        .route(
            "/sync/conflicts/{id}/resolve",
            post(handlers::conflicts::resolve_conflict),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    // The service enforces its own limit; leave room so oversized bodies
    // reach it and produce the structured 413.
    let receive_limit = state.engine.webhooks.max_body_bytes().saturating_add(1);
    let public = Router::new()
        .route("/", get(handlers::health::root))
        .route("/health", get(handlers::health::health))
        .route(
            "/sync/webhooks/receive",
            post(handlers::webhooks::receive_webhook).layer(DefaultBodyLimit::max(receive_limit)),
        );

    Router::new()
        .merge(protected)
        .merge(public)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(trace_context_middleware))
        .layer(CorsLayer::permissive())
}

/// Starts the server and serves until `engine`'s shutdown token fires or the
/// process receives Ctrl+C / SIGTERM.
pub async fn run_server(engine: Arc<Engine>) -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::clone(&engine.config);
    let app = create_app(AppState::new(Arc::clone(&engine)));

    let addr = config
        .bind_addr()
        .map_err(|e| format!("Invalid server address: {}", e))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, profile = %config.profile, "Server listening");

    let token = engine.shutdown_token();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(token))
        .await?;

    tracing::info!("HTTP server stopped, draining workers");
    engine.shutdown().await;
    Ok(())
}

async fn shutdown_signal(token: tokio_util::sync::CancellationToken) {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %error, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::error!(error = %error, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
        _ = token.cancelled() => tracing::info!("Engine shutdown requested"),
    }
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
        );
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::health::root,
        crate::handlers::health::health,
        crate::handlers::jobs::create_job,
        crate::handlers::jobs::list_jobs,
        crate::handlers::jobs::get_job,
        crate::handlers::jobs::cancel_job,
        crate::handlers::jobs::retry_job,
        crate::handlers::jobs::list_job_errors,
        crate::handlers::statistics::get_statistics,
        crate::handlers::webhooks::register_webhook,
        crate::handlers::webhooks::receive_webhook,
        crate::handlers::webhooks::retry_webhook,
        crate::handlers::webhooks::list_webhook_logs,
        crate::handlers::conflicts::list_conflicts,
        crate::handlers::conflicts::resolve_conflict,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::error::ApiError,
            crate::error::SyncFailure,
            crate::models::enums::JobType,
            crate::models::enums::SyncDirection,
            crate::models::enums::JobStatus,
            crate::models::enums::ConflictStatus,
            crate::models::enums::ConflictStrategy,
            crate::models::enums::ErrorSeverity,
            crate::models::enums::FailureKind,
            crate::models::enums::SignatureAlgorithm,
            crate::models::enums::WebhookDirection,
            crate::models::enums::WebhookOutcome,
            crate::models::sync_job::JobSummary,
            crate::orchestrator::JobSpec,
            crate::queue::QueueCounts,
            crate::conflicts::ManualDecision,
            crate::webhooks::RegisterWebhook,
            crate::webhooks::InboundEvent,
            crate::webhooks::ReceiveAck,
            crate::statistics::StatisticsReport,
            crate::statistics::DailyStatistics,
            crate::statistics::StatisticsTotals,
            crate::statistics::StatisticsCounters,
            crate::handlers::health::HealthResponse,
            crate::handlers::jobs::CreateJobResponse,
            crate::handlers::jobs::JobInfo,
            crate::handlers::jobs::JobsResponse,
            crate::handlers::jobs::SyncErrorInfo,
            crate::handlers::webhooks::WebhookConfigInfo,
            crate::handlers::webhooks::WebhookLogInfo,
            crate::handlers::webhooks::WebhookLogsResponse,
            crate::handlers::webhooks::RetryDeliveryResponse,
            crate::handlers::conflicts::ConflictInfo,
            crate::handlers::conflicts::ResolveConflictRequest,
            crate::handlers::conflicts::ResolveConflictResponse,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "jobs", description = "Sync job lifecycle"),
        (name = "webhooks", description = "Webhook registration, ingestion and delivery"),
        (name = "conflicts", description = "Conflict review and manual resolution"),
        (name = "statistics", description = "Aggregated sync counters"),
        (name = "health", description = "Service health"),
    ),
    info(
        title = "EHR Sync API",
        description = "Bidirectional synchronization between EHR providers and the canonical record store",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_documents_bearer_scheme_and_routes() {
        let doc = ApiDoc::openapi();
        let components = doc.components.expect("components");
        assert!(components.security_schemes.contains_key("bearer_auth"));
        assert!(doc.paths.paths.contains_key("/sync/jobs/{id}"));
        assert!(doc.paths.paths.contains_key("/sync/webhooks/receive"));
        assert!(doc.paths.paths.contains_key("/sync/conflicts/{id}/resolve"));
    }
}
