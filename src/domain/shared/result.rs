//! Domain result type

use super::error::GateError;

/// Standard result type for gate operations
pub type Result<T> = std::result::Result<T, GateError>;
