//! API route definitions

use crate::gateway::Gateway;
use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::handlers;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
    pub sse_keep_alive: Duration,
}

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health and status
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        // Request/response transport
        .route(
            "/{endpoint}/mcp",
            post(handlers::streamable_post)
                .get(handlers::streamable_get)
                .delete(handlers::streamable_delete),
        )
        // Push-stream transport
        .route("/{endpoint}/sse", get(handlers::sse_connect))
        .route("/{endpoint}/message", post(handlers::sse_message))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}
