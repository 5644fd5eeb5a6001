//! HTTP server implementation using Axum.

use axum::{
    Router,
    routing::{get, post, put},
};
use nudge_core::config::GatewayConfig;
use nudge_scheduler::SchedulerHandle;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::hub::PushHub;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<SchedulerHandle>,
    /// Same hub the scheduler pushes through.
    pub hub: Arc<PushHub>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(scheduler: Arc<SchedulerHandle>, hub: Arc<PushHub>) -> Self {
        Self {
            scheduler,
            hub,
            start_time: std::time::Instant::now(),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);

    let api = Router::new()
        .route("/api/scheduler/status", get(super::routes::scheduler_status))
        .route(
            "/api/notifications/{id}/respond",
            post(super::routes::respond),
        )
        .route(
            "/api/routines/{id}",
            put(super::routes::schedule_routine).delete(super::routes::cancel_routine),
        );

    Router::new()
        .route("/health", get(super::routes::health_check))
        .route("/ws", get(super::ws::ws_handler))
        .merge(api)
        .layer({
            let cors = CorsLayer::new()
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::PUT,
                    axum::http::Method::DELETE,
                    axum::http::Method::OPTIONS,
                ])
                .allow_headers(Any)
                .max_age(std::time::Duration::from_secs(3600));

            // Example: NUDGE_CORS_ORIGINS=https://app.example.com,https://watch.example.com
            if let Ok(origins_str) = std::env::var("NUDGE_CORS_ORIGINS") {
                let origins: Vec<_> = origins_str
                    .split(',')
                    .filter_map(|s| s.trim().parse::<axum::http::HeaderValue>().ok())
                    .collect();
                cors.allow_origin(origins)
            } else {
                cors.allow_origin(Any)
            }
        })
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Bind and serve until `shutdown` resolves.
pub async fn start(
    config: &GatewayConfig,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = build_router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("🌐 Gateway listening on http://{}", addr);

    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    Ok(())
}
