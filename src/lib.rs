//! gatecall - opens a gate by ringing a phone
//!
//! An HTTP request triggers a short outbound SIP call through a registrar
//! that uses Digest authentication. The call is cancelled as soon as the far
//! end rings or answers; the ring itself is the signal.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod interface;

// Re-export commonly used types
pub use domain::shared::error::GateError;
pub use domain::shared::result::Result;
