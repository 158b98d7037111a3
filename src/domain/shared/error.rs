//! Domain errors

use crate::infrastructure::protocols::sip::{DigestError, SipError};
use thiserror::Error;

/// Errors surfaced by the gate controller
#[derive(Error, Debug)]
pub enum GateError {
    #[error("Digest authentication failed: {0}")]
    Digest(#[from] DigestError),

    #[error("SIP error: {0}")]
    Sip(#[from] SipError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl GateError {
    /// Only a broken entropy source is allowed to stop the process.
    /// Everything else degrades to "try again at the next opportunity".
    pub fn is_fatal(&self) -> bool {
        matches!(self, GateError::Digest(DigestError::Randomness(_)))
    }
}

impl From<config::ConfigError> for GateError {
    fn from(err: config::ConfigError) -> Self {
        GateError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_randomness_is_fatal() {
        assert!(GateError::from(DigestError::Randomness("no entropy".into())).is_fatal());
        assert!(!GateError::from(DigestError::Format("x".into())).is_fatal());
        assert!(!GateError::from(DigestError::UnsupportedAlgorithm("SHA-256".into())).is_fatal());
        assert!(!GateError::from(SipError::TransportError("down".into())).is_fatal());
        assert!(!GateError::Config("missing".into()).is_fatal());
    }
}
