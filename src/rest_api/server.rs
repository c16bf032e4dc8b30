//! Axum HTTP server for the REST API

use std::net::SocketAddr;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::controller::ControllerHandle;
use crate::{Error, Result};

use super::handlers;

/// Metrics endpoint handler
#[cfg(feature = "metrics")]
async fn metrics_handler() -> Result<String, (axum::http::StatusCode, String)> {
    crate::controller::metrics::encode_registry()
        .map_err(|e| (axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

pub fn router(handle: ControllerHandle) -> Router {
    let router = Router::new().route("/health", get(handlers::health));

    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(metrics_handler));

    router
        .route(
            "/api/v1/modules/{namespace}/{name}/manifest",
            get(handlers::get_manifest),
        )
        .route(
            "/api/v1/modules/{namespace}/{name}/history",
            get(handlers::get_history),
        )
        .route(
            "/api/v1/modules/{namespace}/{name}/phase",
            get(handlers::get_phase),
        )
        .route(
            "/api/v1/modules/{namespace}/{name}/reconcile",
            post(handlers::trigger_reconcile),
        )
        .route(
            "/api/v1/modules/{namespace}/{name}/rollback/{index}",
            post(handlers::rollback),
        )
        .route("/api/v1/cache/stats", get(handlers::cache_stats))
        .route("/api/v1/cache/invalidate", post(handlers::invalidate_template))
        .layer(TraceLayer::new_for_http())
        .with_state(handle)
}

/// Run the REST API server
pub async fn run_server(handle: ControllerHandle, addr: SocketAddr) -> Result<()> {
    let app = router(handle);

    info!("REST API server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind to {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| Error::ConfigError(format!("Server error: {}", e)))?;

    Ok(())
}
