//! Interface layer - External interfaces
//!
//! This layer handles:
//! - The HTTP trigger endpoint
//! - Health and Prometheus endpoints
//! - Request/response formatting

pub mod api;
