//! Shared value objects

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one call attempt for the lifetime of the process.
///
/// Timers capture the generation they were armed for, so a timer that fires
/// after its call already finished can tell it is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallGeneration(u64);

impl CallGeneration {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// SIP URI value object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SipUri {
    user: Option<String>,
    host: String,
    port: Option<u16>,
}

impl SipUri {
    pub fn new(user: Option<String>, host: String, port: Option<u16>) -> Self {
        Self { user, host, port }
    }

    /// URI of the registrar itself (`sip:host`)
    pub fn server(host: &str) -> Self {
        Self::new(None, host.to_string(), None)
    }

    /// URI of a user or number at the registrar (`sip:user@host`)
    pub fn at(user: &str, host: &str) -> Self {
        Self::new(Some(user.to_string()), host.to_string(), None)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sip:")?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}
