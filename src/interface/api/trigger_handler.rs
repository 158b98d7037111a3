//! Trigger API handlers

use super::dto::{ApiResponse, StatusResponse};
use super::metrics_handler::record_open_request;
use crate::application::trigger::{format_cooldown, Activation, TriggerGateway};
use axum::{
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Application state
#[derive(Clone)]
pub struct ApiState {
    pub gateway: Arc<TriggerGateway>,
}

impl ApiState {
    pub fn new(gateway: TriggerGateway) -> Self {
        Self {
            gateway: Arc::new(gateway),
        }
    }
}

/// Proxy-supplied client address, else the peer address
fn client_address(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Open the gate
pub async fn open_gate(
    State(state): State<ApiState>,
    method: Method,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Response {
    let client = client_address(&headers, peer.map(|ConnectInfo(addr)| addr));
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");
    info!("HTTP {} /open from {} ({})", method, client, user_agent);

    match state.gateway.activate() {
        Activation::Started(_) => {
            record_open_request("started");
            (StatusCode::OK, "Opening...").into_response()
        }
        Activation::RateLimited { cooldown } => {
            record_open_request("rate_limited");
            (
                StatusCode::TOO_MANY_REQUESTS,
                format!(
                    "ERROR: Too fast (1 per {}), maybe the gate is already open?",
                    format_cooldown(cooldown)
                ),
            )
                .into_response()
        }
        Activation::AlreadyInProgress => {
            record_open_request("in_progress");
            (
                StatusCode::CONFLICT,
                "ERROR: Someone is already opening right now",
            )
                .into_response()
        }
    }
}

/// Registration and call flags
pub async fn health_check(State(state): State<ApiState>) -> Json<ApiResponse<StatusResponse>> {
    Json(ApiResponse::success(state.gateway.status().into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_client_address_prefers_forwarded_for() {
        let peer: SocketAddr = "10.0.0.5:40000".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_address(&headers, Some(peer)), "10.0.0.5:40000");
        assert_eq!(client_address(&headers, None), "unknown");

        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7"));
        assert_eq!(client_address(&headers, Some(peer)), "203.0.113.7");
    }
}
