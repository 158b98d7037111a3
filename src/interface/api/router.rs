//! API Router configuration

use super::metrics_handler::metrics_handler;
use super::trigger_handler::{health_check, open_gate, ApiState};
use axum::{
    routing::{any, get},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;

/// Build the API router
pub fn build_router(state: ApiState, prometheus_handle: PrometheusHandle) -> Router {
    // Trigger and status routes
    let gate_routes = Router::new()
        .route("/open", any(open_gate))
        .route("/health", get(health_check));

    // Metrics route (separate state)
    let metrics_routes = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(prometheus_handle);

    Router::new()
        .merge(gate_routes)
        .with_state(state)
        .merge(metrics_routes)
        .layer(TraceLayer::new_for_http())
}
