//! Prometheus metrics handler

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use metrics::{counter, describe_counter, describe_gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Initialize the Prometheus metrics exporter
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    // Describe metrics
    describe_counter!(
        "http_open_requests_total",
        "Activation requests received, by outcome"
    );
    describe_counter!(
        "sip_registrations_total",
        "Total number of REGISTER attempts"
    );
    describe_counter!(
        "sip_registration_failures_total",
        "REGISTER attempts that ended without a binding"
    );
    describe_counter!(
        "sip_calls_total",
        "Total number of SIP calls initiated"
    );
    describe_counter!(
        "sip_calls_failed",
        "Total number of SIP calls that failed"
    );
    describe_gauge!("sip_registered", "1 while registered at the registrar");
    describe_gauge!(
        "sip_active_calls",
        "Number of currently active SIP calls"
    );

    Ok(handle)
}

/// HTTP metrics handler
pub async fn metrics_handler(
    axum::extract::State(prometheus_handle): axum::extract::State<PrometheusHandle>,
) -> Response {
    let metrics = prometheus_handle.render();
    (StatusCode::OK, metrics).into_response()
}

/// Record one activation request
pub fn record_open_request(outcome: &'static str) {
    counter!("http_open_requests_total", "outcome" => outcome).increment(1);
}
