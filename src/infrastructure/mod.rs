//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - Protocol implementations (SIP user agent, UDP transport)

pub mod protocols;
