//! Gate trigger use case

use crate::domain::session::{CallRejected, SessionSnapshot};
use crate::domain::shared::CallGeneration;
use crate::infrastructure::protocols::sip::CallControl;
use std::time::Duration;
use tracing::{info, warn};

/// Result of one activation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// A call was scheduled
    Started(CallGeneration),
    /// Still inside the cooldown window of the previous activation
    RateLimited { cooldown: Duration },
    /// The previous call has not finished yet
    AlreadyInProgress,
}

/// Turns an external activation signal into a call to the gate
#[derive(Clone)]
pub struct TriggerGateway {
    control: CallControl,
    call_number: String,
}

impl TriggerGateway {
    pub fn new(control: CallControl, call_number: &str) -> Self {
        Self {
            control,
            call_number: call_number.to_string(),
        }
    }

    pub fn call_number(&self) -> &str {
        &self.call_number
    }

    pub fn cooldown(&self) -> Duration {
        self.control.timing().penalty
    }

    pub fn status(&self) -> SessionSnapshot {
        self.control.session().snapshot()
    }

    pub fn activate(&self) -> Activation {
        match self.control.place_call(&self.call_number) {
            Ok(generation) => {
                info!("Will call {} (call {})", self.call_number, generation);
                Activation::Started(generation)
            }
            Err(CallRejected::RateLimited) => {
                warn!("Cooldown active, activation ignored");
                Activation::RateLimited {
                    cooldown: self.cooldown(),
                }
            }
            Err(CallRejected::AlreadyInProgress) => {
                warn!("Call already in progress, activation ignored");
                Activation::AlreadyInProgress
            }
        }
    }
}

/// `10s`, `1m30s`, `500ms`
pub fn format_cooldown(cooldown: Duration) -> String {
    let secs = cooldown.as_secs();
    if cooldown.subsec_millis() != 0 || secs == 0 {
        return format!("{}ms", cooldown.as_millis());
    }
    if secs >= 60 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}
