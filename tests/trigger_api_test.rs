//! Trigger API Integration Tests

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use gatecall::application::TriggerGateway;
use gatecall::domain::session::SessionState;
use gatecall::infrastructure::protocols::sip::{CallControl, CallTiming, Command};
use gatecall::interface::api::{build_router, ApiState};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower::ServiceExt; // For `oneshot`

/// The command receiver is handed back so scheduled calls stay "in progress"
fn setup_trigger_test() -> (Router, Arc<SessionState>, mpsc::UnboundedReceiver<Command>) {
    let session = Arc::new(SessionState::new());
    let (commands, rx) = mpsc::unbounded_channel();
    let timing = CallTiming {
        registration_wait: Duration::from_secs(5),
        watchdog: Duration::from_secs(30),
        penalty: Duration::from_secs(60),
    };
    let control = CallControl::new(commands, session.clone(), timing);
    let gateway = TriggerGateway::new(control, "600");

    let prometheus_handle = PrometheusBuilder::new().build_recorder().handle();
    let app = build_router(ApiState::new(gateway), prometheus_handle);
    (app, session, rx)
}

async fn call(app: &Router, method: &str, uri: &str) -> (StatusCode, String) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

#[tokio::test]
async fn test_api_open_guards() {
    let (app, session, _commands) = setup_trigger_test();

    let (status, body) = call(&app, "GET", "/open").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Opening...");
    assert!(session.is_call_in_progress());

    let (status, body) = call(&app, "POST", "/open").await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        body,
        "ERROR: Too fast (1 per 1m0s), maybe the gate is already open?"
    );

    session.clear_rate_limit();
    let (status, body) = call(&app, "GET", "/open").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body, "ERROR: Someone is already opening right now");
}

#[tokio::test]
async fn test_api_health_reports_flags() {
    let (app, session, _commands) = setup_trigger_test();
    session.set_registered(true);

    let (status, body) = call(&app, "GET", "/health").await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["success"], true);
    assert_eq!(json["data"]["registered"], true);
    assert_eq!(json["data"]["call_in_progress"], false);
    assert_eq!(json["data"]["rate_limited"], false);
    assert!(json.get("error").is_none());

    call(&app, "GET", "/open").await;
    let (_, body) = call(&app, "GET", "/health").await;
    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["data"]["call_in_progress"], true);
    assert_eq!(json["data"]["rate_limited"], true);
}

#[tokio::test]
async fn test_api_metrics_endpoint() {
    let (app, _, _commands) = setup_trigger_test();

    let (status, _) = call(&app, "GET", "/metrics").await;
    assert_eq!(status, StatusCode::OK);
}
