//! Dialog records owned by the user agent loop

use super::call_state::DialogState;
use super::message::SipRequest;
use crate::domain::shared::CallGeneration;

/// `nc` bookkeeping for one dialog.
///
/// Restarts at 1 whenever the server hands out a new nonce and counts up
/// while it keeps challenging with the same one.
#[derive(Debug, Clone, Default)]
pub struct NonceCounter {
    nonce: String,
    count: u32,
}

impl NonceCounter {
    pub fn next(&mut self, nonce: &str) -> u32 {
        if self.nonce == nonce {
            self.count += 1;
        } else {
            self.nonce = nonce.to_string();
            self.count = 1;
        }
        self.count
    }
}

/// The request currently outstanding on a dialog
#[derive(Debug, Clone)]
pub struct DialogRequest {
    /// Last request put on the wire
    pub request: SipRequest,
    /// CSeq responses must carry to be ours
    pub cseq: u32,
    pub state: DialogState,
    pub auth_retries_remaining: u32,
    /// Authenticated retry waiting for the retry delay to pass
    deferred: Option<SipRequest>,
    nonces: NonceCounter,
}

impl DialogRequest {
    pub fn new(request: SipRequest, state: DialogState, auth_retries: u32) -> Self {
        Self {
            cseq: request.cseq().unwrap_or_default(),
            request,
            state,
            auth_retries_remaining: auth_retries,
            deferred: None,
            nonces: NonceCounter::default(),
        }
    }

    pub fn matches(&self, cseq: u32) -> bool {
        self.cseq == cseq
    }

    pub fn next_nonce_count(&mut self, nonce: &str) -> u32 {
        self.nonces.next(nonce)
    }

    /// Park an authenticated retry; from now on only responses to the retry
    /// are ours.
    pub fn defer(&mut self, retry: SipRequest) {
        self.cseq = retry.cseq().unwrap_or_default();
        self.auth_retries_remaining = self.auth_retries_remaining.saturating_sub(1);
        self.deferred = Some(retry);
    }

    /// Hand out the parked retry if it is still the one with `cseq`.
    pub fn take_deferred(&mut self, cseq: u32) -> Option<SipRequest> {
        if self.cseq != cseq {
            return None;
        }
        let retry = self.deferred.take()?;
        self.request = retry.clone();
        Some(retry)
    }

    pub fn has_deferred(&self) -> bool {
        self.deferred.is_some()
    }
}

/// Our binding at the registrar
#[derive(Debug, Clone)]
pub struct RegistrationSession {
    pub dialog: DialogRequest,
}

impl RegistrationSession {
    pub fn new(request: SipRequest, auth_retries: u32) -> Self {
        Self {
            dialog: DialogRequest::new(request, DialogState::Registering, auth_retries),
        }
    }

    /// Re-arm for a refresh with a fresh retry budget
    pub fn restart(&mut self, request: SipRequest, auth_retries: u32) {
        self.dialog = DialogRequest::new(request, DialogState::Registering, auth_retries);
    }

    pub fn is_registered(&self) -> bool {
        self.dialog.state == DialogState::Registered
    }
}

/// One outbound call attempt
#[derive(Debug, Clone)]
pub struct CallSession {
    pub generation: CallGeneration,
    pub target_number: String,
    pub dialog: DialogRequest,
}

impl CallSession {
    pub fn new(
        generation: CallGeneration,
        target_number: &str,
        invite: SipRequest,
        auth_retries: u32,
    ) -> Self {
        Self {
            generation,
            target_number: target_number.to_string(),
            dialog: DialogRequest::new(invite, DialogState::Inviting, auth_retries),
        }
    }

    pub fn is_active(&self) -> bool {
        self.dialog.state.is_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::shared::SipUri;
    use crate::infrastructure::protocols::sip::builder::DialogFactory;

    fn factory() -> DialogFactory {
        DialogFactory::new(
            "1001",
            SipUri::server("pbx.example.com"),
            "10.0.0.2:5070".parse().unwrap(),
        )
    }

    #[test]
    fn test_nonce_counter() {
        let mut counter = NonceCounter::default();
        assert_eq!(counter.next("abc"), 1);
        assert_eq!(counter.next("abc"), 2);
        assert_eq!(counter.next("def"), 1);
    }

    #[test]
    fn test_deferred_retry() {
        let factory = factory();
        let invite = factory.new_invite("600", 10, 20000);
        let mut call = CallSession::new(CallGeneration::new(1), "600", invite.clone(), 3);
        assert!(call.dialog.matches(10));

        let retry = factory.resubmit(&invite, 11, None);
        call.dialog.defer(retry);
        assert!(!call.dialog.matches(10));
        assert!(call.dialog.matches(11));
        assert_eq!(call.dialog.auth_retries_remaining, 2);

        // stale delay from an older retry
        assert!(call.dialog.take_deferred(10).is_none());
        assert!(call.dialog.has_deferred());

        let sent = call.dialog.take_deferred(11).unwrap();
        assert_eq!(sent.cseq(), Some(11));
        assert_eq!(call.dialog.request.cseq(), Some(11));
        assert!(call.dialog.take_deferred(11).is_none());
    }

    #[test]
    fn test_registration_restart_resets_budget() {
        let factory = factory();
        let mut registration =
            RegistrationSession::new(factory.new_register(1), 3);
        registration.dialog.defer(factory.new_register(2));
        registration.dialog.state = DialogState::Registered;
        assert!(registration.is_registered());

        registration.restart(factory.new_register(3), 1);
        assert!(!registration.is_registered());
        assert_eq!(registration.dialog.auth_retries_remaining, 1);
        assert!(registration.dialog.matches(3));
        assert!(!registration.dialog.has_deferred());
    }
}
