//! SIP user agent client
//!
//! Just enough of RFC 3261 to register with one registrar and ring one number.
//!
//! Architecture:
//! ```text
//! ┌─────────────────────────┐
//! │   CallStateMachine      │
//! │  (user_agent, dialog)   │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transition table      │
//! │  (call_state, auth)     │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Message factory       │
//! │  (builder, message)     │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transport Layer       │
//! │  (UDP)                  │
//! └─────────────────────────┘
//! ```

pub mod auth;
pub mod builder;
pub mod call_state;
pub mod dialog;
pub mod message;
pub mod transport;
pub mod user_agent;

pub use auth::{ChallengeParameters, DigestAuthenticator, DigestError};
pub use builder::{Credentials, DialogFactory};
pub use call_state::{DialogRole, DialogState, Effect, SipEvent, Transition};
pub use dialog::{CallSession, RegistrationSession};
pub use message::{SipError, SipMessage, SipMethod, SipRequest, SipResponse};
pub use transport::{discover_local_ip, IncomingMessage, Transport, TransportChannels, UdpTransport};
pub use user_agent::{CallControl, CallStateMachine, CallTiming, Command, MachineSettings};
