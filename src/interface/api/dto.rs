//! API DTOs (Data Transfer Objects)

use crate::domain::session::SessionSnapshot;
use serde::{Deserialize, Serialize};

/// Gate controller status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub registered: bool,
    pub call_in_progress: bool,
    pub rate_limited: bool,
}

impl From<SessionSnapshot> for StatusResponse {
    fn from(snapshot: SessionSnapshot) -> Self {
        Self {
            registered: snapshot.registered,
            call_in_progress: snapshot.call_in_progress,
            rate_limited: snapshot.rate_limited,
        }
    }
}

/// Generic API response
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
        }
    }
}
