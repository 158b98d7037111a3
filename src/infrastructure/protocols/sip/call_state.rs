//! Dialog state transitions
//!
//! Every response the user agent reacts to is first reduced to a `SipEvent`,
//! then looked up in one table keyed by (dialog role, current state, event).
//! The table says where the dialog goes next and which side effect the
//! processing loop has to carry out; it never touches the network itself.

use super::message::SipMethod;
use std::fmt;

/// Which dialog a response belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DialogRole {
    Registration,
    Call,
}

/// Dialog State
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DialogState {
    /// Nothing outstanding
    Idle,
    /// REGISTER sent, waiting for a final response
    Registering,
    /// Registrar accepted us
    Registered,
    /// INVITE sent
    Inviting,
    /// INVITE challenged, authenticated retry waiting for the retry delay
    Challenged,
    /// 180/183 seen, CANCEL in flight
    Ringing,
    /// 200 to INVITE seen, CANCEL in flight
    Answered,
    /// Final error response from the far end
    Rejected,
    /// Call over, late responses are only acknowledged
    Terminated,
}

impl DialogState {
    /// Check if a call dialog still waits for a final outcome
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DialogState::Inviting
                | DialogState::Challenged
                | DialogState::Ringing
                | DialogState::Answered
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            DialogState::Idle => "Idle",
            DialogState::Registering => "Registering",
            DialogState::Registered => "Registered",
            DialogState::Inviting => "Inviting",
            DialogState::Challenged => "Challenged",
            DialogState::Ringing => "Ringing",
            DialogState::Answered => "Answered",
            DialogState::Rejected => "Rejected",
            DialogState::Terminated => "Terminated",
        }
    }
}

impl fmt::Display for DialogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A response, reduced to what the state machine cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SipEvent {
    /// 401/407 with retry budget left
    Challenge,
    /// 401/407 with the budget used up
    ChallengeExhausted,
    /// 180 Ringing / 183 Session Progress
    Progress,
    /// 2xx to the given method
    Accepted(SipMethod),
    /// 403
    Forbidden,
    /// 487
    RequestTerminated,
    /// Any other final error response
    Rejected,
}

impl SipEvent {
    /// Classify a response to `method`.
    ///
    /// Provisional responses other than 180/183 carry no information for us
    /// and yield `None`.
    pub fn classify(status: u16, method: SipMethod, auth_retries_remaining: u32) -> Option<Self> {
        match status {
            180 | 183 => Some(SipEvent::Progress),
            100..=199 => None,
            200..=299 => Some(SipEvent::Accepted(method)),
            401 | 407 if auth_retries_remaining > 0 => Some(SipEvent::Challenge),
            401 | 407 => Some(SipEvent::ChallengeExhausted),
            403 => Some(SipEvent::Forbidden),
            487 => Some(SipEvent::RequestTerminated),
            300..=699 => Some(SipEvent::Rejected),
            _ => None,
        }
    }
}

/// Side effect the processing loop runs after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    /// Answer the registration challenge and schedule the retry
    Authenticate,
    /// Give up on this registration attempt until the next refresh
    RegistrationFailed,
    MarkRegistered,
    /// ACK the challenged INVITE, then answer the challenge
    AckAndAuthenticate,
    /// ACK the last challenge and drop the call attempt
    AckAndAbandon,
    /// CANCEL the pending INVITE
    Cancel,
    /// ACK and release the call slot
    AckAndEnd,
    /// ACK a late final response
    Ack,
    /// Release the call slot
    EndCall,
    /// ACK, drop registration and call, then register again from scratch
    AckAndReset,
}

/// Outcome of a table lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: DialogState,
    pub effect: Effect,
}

const fn to(next: DialogState, effect: Effect) -> Option<Transition> {
    Some(Transition { next, effect })
}

/// Look up the transition for `event` in `state`.
///
/// `None` means the event is not expected here and is ignored.
pub fn transition(role: DialogRole, state: DialogState, event: SipEvent) -> Option<Transition> {
    use DialogState::*;

    match role {
        DialogRole::Registration => match (state, event) {
            (Registering, SipEvent::Challenge) => to(Registering, Effect::Authenticate),
            (Registering, SipEvent::ChallengeExhausted)
            | (Registering, SipEvent::Forbidden)
            | (Registering, SipEvent::RequestTerminated)
            | (Registering, SipEvent::Rejected) => to(Idle, Effect::RegistrationFailed),
            (Registering, SipEvent::Accepted(SipMethod::Register)) => {
                to(Registered, Effect::MarkRegistered)
            }
            // retransmitted 200
            (Registered, SipEvent::Accepted(SipMethod::Register)) => to(Registered, Effect::None),
            _ => None,
        },

        DialogRole::Call => match (state, event) {
            // remote hangup confirmed, whatever we were doing
            (_, SipEvent::Accepted(SipMethod::Bye)) => to(Terminated, Effect::EndCall),

            // From Inviting
            (Inviting, SipEvent::Challenge) => to(Challenged, Effect::AckAndAuthenticate),
            (Inviting, SipEvent::ChallengeExhausted) => to(Terminated, Effect::AckAndAbandon),
            (Inviting, SipEvent::Progress) => to(Ringing, Effect::Cancel),
            (Inviting, SipEvent::Accepted(SipMethod::Invite)) => to(Answered, Effect::Cancel),

            // CANCEL already sent, do not send another
            (Ringing, SipEvent::Progress) => to(Ringing, Effect::None),
            (Ringing, SipEvent::Accepted(SipMethod::Invite)) => to(Answered, Effect::None),
            (Answered, SipEvent::Progress) => to(Answered, Effect::None),
            (Answered, SipEvent::Accepted(SipMethod::Invite)) => to(Answered, Effect::None),

            // CANCEL confirmed, or the INVITE it raced with terminated
            (Inviting | Ringing | Answered, SipEvent::Accepted(SipMethod::Cancel))
            | (Inviting | Ringing | Answered, SipEvent::RequestTerminated) => {
                to(Terminated, Effect::AckAndEnd)
            }
            (Terminated, SipEvent::Accepted(SipMethod::Cancel))
            | (Terminated, SipEvent::RequestTerminated) => to(Terminated, Effect::Ack),

            (Inviting | Ringing | Answered, SipEvent::Forbidden) => {
                to(Rejected, Effect::AckAndReset)
            }
            (Inviting | Ringing | Answered, SipEvent::Rejected) => to(Rejected, Effect::AckAndEnd),

            _ => None,
        },
    }
}
