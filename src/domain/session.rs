//! Process-wide session flags
//!
//! `SessionState` is the only state shared between the SIP processing loop and
//! the tasks around it (HTTP trigger, timers). All call/rate-limit transitions
//! are single compare-and-swap operations on one word, so two triggers racing
//! each other can never both win the right to place a call.

use super::shared::CallGeneration;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

const CALL_IN_PROGRESS: u64 = 0b01;
const RATE_LIMITED: u64 = 0b10;
const GENERATION_SHIFT: u32 = 2;

/// Why a call could not be started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRejected {
    /// The cooldown window after the previous call is still running
    RateLimited,
    /// Another call is still being placed
    AlreadyInProgress,
}

/// Proof that the caller won the right to place the next call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallTicket {
    generation: CallGeneration,
}

impl CallTicket {
    pub fn generation(&self) -> CallGeneration {
        self.generation
    }
}

/// Point-in-time copy of the flags, for status reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub registered: bool,
    pub call_in_progress: bool,
    pub rate_limited: bool,
}

/// Shared registration / call / rate-limit flags
#[derive(Debug)]
pub struct SessionState {
    /// bit 0: call in progress, bit 1: rate limited, bits 2..: generation
    flags: AtomicU64,
    registered: watch::Sender<bool>,
}

impl SessionState {
    pub fn new() -> Self {
        let (registered, _) = watch::channel(false);
        Self {
            flags: AtomicU64::new(0),
            registered,
        }
    }

    /// Atomically claim the single call slot.
    ///
    /// On success both the call-in-progress and rate-limited flags are set and
    /// a fresh generation is handed out.
    pub fn try_begin_call(&self) -> Result<CallTicket, CallRejected> {
        let result = self
            .flags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |flags| {
                if flags & (RATE_LIMITED | CALL_IN_PROGRESS) != 0 {
                    return None;
                }
                let generation = (flags >> GENERATION_SHIFT) + 1;
                Some((generation << GENERATION_SHIFT) | CALL_IN_PROGRESS | RATE_LIMITED)
            });

        match result {
            Ok(previous) => {
                let generation = CallGeneration::new((previous >> GENERATION_SHIFT) + 1);
                debug!("Call slot claimed by call {}", generation);
                Ok(CallTicket { generation })
            }
            Err(flags) if flags & RATE_LIMITED != 0 => Err(CallRejected::RateLimited),
            Err(_) => Err(CallRejected::AlreadyInProgress),
        }
    }

    /// Release the call slot if it is still held by `generation`.
    ///
    /// Returns `false` when the call already ended or a newer call owns the
    /// slot, which makes late timers harmless.
    pub fn end_call(&self, generation: CallGeneration) -> bool {
        self.flags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |flags| {
                let current = flags >> GENERATION_SHIFT;
                if current == generation.value() && flags & CALL_IN_PROGRESS != 0 {
                    Some(flags & !CALL_IN_PROGRESS)
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// End of the cooldown window
    pub fn clear_rate_limit(&self) {
        self.flags.fetch_and(!RATE_LIMITED, Ordering::AcqRel);
    }

    pub fn is_call_in_progress(&self) -> bool {
        self.flags.load(Ordering::Acquire) & CALL_IN_PROGRESS != 0
    }

    pub fn is_rate_limited(&self) -> bool {
        self.flags.load(Ordering::Acquire) & RATE_LIMITED != 0
    }

    /// Generation of the most recently started call
    pub fn current_generation(&self) -> CallGeneration {
        CallGeneration::new(self.flags.load(Ordering::Acquire) >> GENERATION_SHIFT)
    }

    pub fn is_registered(&self) -> bool {
        *self.registered.borrow()
    }

    pub fn set_registered(&self, registered: bool) {
        let previous = self.registered.send_replace(registered);
        if previous != registered {
            debug!("Registration flag changed: {} -> {}", previous, registered);
        }
    }

    /// Wait until the registration flag is set, for at most `limit`.
    pub async fn wait_registered(&self, limit: Duration) -> bool {
        let mut rx = self.registered.subscribe();
        let outcome = tokio::time::timeout(limit, rx.wait_for(|registered| *registered)).await;
        matches!(outcome, Ok(Ok(_)))
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            registered: self.is_registered(),
            call_in_progress: self.is_call_in_progress(),
            rate_limited: self.is_rate_limited(),
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_begin_call_sets_both_flags() {
        let state = SessionState::new();
        let ticket = state.try_begin_call().unwrap();

        assert_eq!(ticket.generation(), CallGeneration::new(1));
        assert!(state.is_call_in_progress());
        assert!(state.is_rate_limited());
    }

    #[test]
    fn test_second_begin_is_rejected() {
        let state = SessionState::new();
        state.try_begin_call().unwrap();

        assert_eq!(state.try_begin_call(), Err(CallRejected::RateLimited));

        state.clear_rate_limit();
        assert_eq!(state.try_begin_call(), Err(CallRejected::AlreadyInProgress));
    }

    #[test]
    fn test_rate_limit_outlives_call() {
        let state = SessionState::new();
        let ticket = state.try_begin_call().unwrap();

        assert!(state.end_call(ticket.generation()));
        assert!(!state.is_call_in_progress());
        assert_eq!(state.try_begin_call(), Err(CallRejected::RateLimited));

        state.clear_rate_limit();
        let next = state.try_begin_call().unwrap();
        assert_eq!(next.generation(), CallGeneration::new(2));
    }

    #[test]
    fn test_stale_end_call_is_noop() {
        let state = SessionState::new();
        let first = state.try_begin_call().unwrap();
        assert!(state.end_call(first.generation()));
        state.clear_rate_limit();

        let second = state.try_begin_call().unwrap();
        // watchdog of the first call firing late
        assert!(!state.end_call(first.generation()));
        assert!(state.is_call_in_progress());

        assert!(state.end_call(second.generation()));
        assert!(!state.end_call(second.generation()));
    }

    #[test]
    fn test_concurrent_begin_has_single_winner() {
        let state = Arc::new(SessionState::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let state = state.clone();
                std::thread::spawn(move || state.try_begin_call().is_ok())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_wait_registered() {
        let state = Arc::new(SessionState::new());
        assert!(!state.wait_registered(Duration::from_millis(20)).await);

        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.wait_registered(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        state.set_registered(true);

        assert!(waiter.await.unwrap());
        assert!(state.wait_registered(Duration::from_millis(1)).await);
    }
}
