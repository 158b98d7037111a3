//! API interface implementations

pub mod dto;
pub mod metrics_handler;
pub mod router;
pub mod trigger_handler;

pub use dto::{ApiResponse, StatusResponse};
pub use metrics_handler::init_metrics;
pub use router::build_router;
pub use trigger_handler::ApiState;
