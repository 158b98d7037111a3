//! Domain layer - Core business logic and rules
//!
//! This layer contains:
//! - Value Objects: SIP addresses, call generations
//! - Session state shared between the trigger and the SIP loop
//! - The error taxonomy

pub mod session;
pub mod shared;

// Re-export commonly used types
pub use session::{CallRejected, CallTicket, SessionSnapshot, SessionState};
pub use shared::{GateError, Result};
