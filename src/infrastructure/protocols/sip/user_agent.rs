//! Outbound user agent: registration and call-as-trigger
//!
//! `CallStateMachine` is a single loop owning every dialog field. It is fed by
//! three channels: messages from the transport, transport errors, and
//! `Command`s produced by timers and by `CallControl`. Code outside the loop
//! only touches the shared `SessionState` flags.

use super::auth::{parse_challenge, DigestAuthenticator, DigestError};
use super::builder::{Credentials, DialogFactory};
use super::call_state::{transition, DialogRole, DialogState, Effect, SipEvent};
use super::dialog::{CallSession, DialogRequest, RegistrationSession};
use super::message::{reason_phrase, SipError, SipMessage, SipMethod, SipRequest, SipResponse};
use super::transport::{IncomingMessage, Transport, TransportChannels};
use crate::domain::session::{CallRejected, SessionState};
use crate::domain::shared::{CallGeneration, GateError};
use metrics::{counter, gauge};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub const DEFAULT_RTP_PORT: u16 = 20000;

/// Work items fed back into the processing loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Registration confirmed within the wait window, send the INVITE
    PlaceCall {
        generation: CallGeneration,
        number: String,
    },
    /// Scheduled registration refresh
    Reregister,
    /// Retry delay elapsed for the authenticated request with `cseq`
    SendDeferred { role: DialogRole, cseq: u32 },
    /// Dead-call watchdog fired and released the call slot
    Watchdog { generation: CallGeneration },
}

/// Retry budgets and delays of the processing loop
#[derive(Debug, Clone)]
pub struct MachineSettings {
    pub retry_delay: Duration,
    pub register_auth_retries: u32,
    pub reregister_auth_retries: u32,
    pub invite_auth_retries: u32,
    pub reregister_interval: Duration,
    pub rtp_port: u16,
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(1),
            register_auth_retries: 3,
            reregister_auth_retries: 1,
            invite_auth_retries: 3,
            reregister_interval: Duration::from_secs(240),
            rtp_port: DEFAULT_RTP_PORT,
        }
    }
}

/// Timers started for every call placement
#[derive(Debug, Clone, Copy)]
pub struct CallTiming {
    /// How long a call waits for a registration before giving up
    pub registration_wait: Duration,
    /// Dead-call watchdog
    pub watchdog: Duration,
    /// Cooldown before the next call may be placed
    pub penalty: Duration,
}

impl Default for CallTiming {
    fn default() -> Self {
        Self {
            registration_wait: Duration::from_secs(15),
            watchdog: Duration::from_secs(30),
            penalty: Duration::from_secs(10),
        }
    }
}

/// Log non-fatal errors, pass fatal ones on
fn check(outcome: Result<(), GateError>) -> Result<(), GateError> {
    match outcome {
        Err(err) if err.is_fatal() => {
            error!("Fatal error in user agent: {}", err);
            Err(err)
        }
        Err(err) => {
            warn!("{}", err);
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}

enum LoopEvent {
    Message(IncomingMessage),
    TransportError(GateError),
    Command(Command),
}

/// Cloneable handle for placing calls from outside the loop
#[derive(Clone)]
pub struct CallControl {
    commands: mpsc::UnboundedSender<Command>,
    session: Arc<SessionState>,
    timing: CallTiming,
}

impl CallControl {
    pub fn new(
        commands: mpsc::UnboundedSender<Command>,
        session: Arc<SessionState>,
        timing: CallTiming,
    ) -> Self {
        Self {
            commands,
            session,
            timing,
        }
    }

    pub fn session(&self) -> &Arc<SessionState> {
        &self.session
    }

    pub fn timing(&self) -> CallTiming {
        self.timing
    }

    /// Claim the call slot and schedule the call.
    ///
    /// Returns as soon as the slot is claimed; the INVITE itself goes out once
    /// the registration is confirmed.
    pub fn place_call(&self, number: &str) -> Result<CallGeneration, CallRejected> {
        let generation = self.session.try_begin_call()?.generation();
        info!("Call {} to {} accepted", generation, number);

        let session = self.session.clone();
        let penalty = self.timing.penalty;
        tokio::spawn(async move {
            tokio::time::sleep(penalty).await;
            session.clear_rate_limit();
            debug!("Rate limit cleared");
        });

        let session = self.session.clone();
        let commands = self.commands.clone();
        let watchdog = self.timing.watchdog;
        tokio::spawn(async move {
            tokio::time::sleep(watchdog).await;
            if session.end_call(generation) {
                warn!("Call {} timed out after {:?}", generation, watchdog);
                let _ = commands.send(Command::Watchdog { generation });
            }
        });

        let session = self.session.clone();
        let commands = self.commands.clone();
        let wait = self.timing.registration_wait;
        let number = number.to_string();
        tokio::spawn(async move {
            if !session.wait_registered(wait).await {
                if session.end_call(generation) {
                    counter!("sip_calls_failed").increment(1);
                    warn!("Not registered after {:?}, call {} dropped", wait, generation);
                }
                return;
            }
            if commands
                .send(Command::PlaceCall { generation, number })
                .is_err()
            {
                error!("User agent loop is gone, call {} dropped", generation);
                session.end_call(generation);
            }
        });

        Ok(generation)
    }
}

/// Registration and call processing loop
pub struct CallStateMachine {
    settings: MachineSettings,
    transport: Arc<dyn Transport>,
    factory: DialogFactory,
    authenticator: DigestAuthenticator,
    session: Arc<SessionState>,
    cseq: u32,
    registration: Option<RegistrationSession>,
    call: Option<CallSession>,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands: mpsc::UnboundedReceiver<Command>,
    inbound: mpsc::Receiver<IncomingMessage>,
    errors: mpsc::Receiver<SipError>,
}

impl CallStateMachine {
    pub fn new(
        settings: MachineSettings,
        transport: Arc<dyn Transport>,
        channels: TransportChannels,
        factory: DialogFactory,
        authenticator: DigestAuthenticator,
        session: Arc<SessionState>,
    ) -> Self {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        Self {
            settings,
            transport,
            factory,
            authenticator,
            session,
            // CSeq only has to grow; a random start keeps restarts apart
            cseq: u32::from(rand::random::<u16>()) + 1,
            registration: None,
            call: None,
            commands_tx,
            commands,
            inbound: channels.inbound,
            errors: channels.errors,
        }
    }

    pub fn control(&self, timing: CallTiming) -> CallControl {
        CallControl::new(self.commands_tx.clone(), self.session.clone(), timing)
    }

    pub fn session(&self) -> &Arc<SessionState> {
        &self.session
    }

    pub fn registration(&self) -> Option<&RegistrationSession> {
        self.registration.as_ref()
    }

    pub fn call(&self) -> Option<&CallSession> {
        self.call.as_ref()
    }

    fn next_cseq(&mut self) -> u32 {
        self.cseq += 1;
        self.cseq
    }

    fn dialog_mut(&mut self, role: DialogRole) -> Option<&mut DialogRequest> {
        match role {
            DialogRole::Registration => self.registration.as_mut().map(|r| &mut r.dialog),
            DialogRole::Call => self.call.as_mut().map(|c| &mut c.dialog),
        }
    }

    /// Register, then process messages until the transport goes away.
    ///
    /// Only fatal errors end the loop early.
    pub async fn run(mut self) -> Result<(), GateError> {
        let commands = self.commands_tx.clone();
        let interval = self.settings.reregister_interval.max(Duration::from_secs(1));
        let refresher = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if commands.send(Command::Reregister).is_err() {
                    break;
                }
            }
        });

        let result = self.run_loop().await;
        refresher.abort();
        result
    }

    async fn run_loop(&mut self) -> Result<(), GateError> {
        let budget = self.settings.register_auth_retries;
        let outcome = self.register(budget).await;
        check(outcome)?;
        while self.step().await? {}
        info!("Transport closed, user agent stopped");
        Ok(())
    }

    /// Handle one message, transport error or command.
    ///
    /// Returns `Ok(false)` once the transport's inbound channel is closed.
    pub async fn step(&mut self) -> Result<bool, GateError> {
        let event = tokio::select! {
            incoming = self.inbound.recv() => match incoming {
                Some(incoming) => LoopEvent::Message(incoming),
                None => return Ok(false),
            },
            Some(error) = self.errors.recv() => LoopEvent::TransportError(error.into()),
            Some(command) = self.commands.recv() => LoopEvent::Command(command),
        };

        let outcome = match event {
            LoopEvent::Message(incoming) => self.handle_message(incoming).await,
            LoopEvent::TransportError(err) => Err(err),
            LoopEvent::Command(command) => self.handle_command(command).await,
        };
        check(outcome)?;
        Ok(true)
    }

    /// Send a fresh REGISTER (or a refresh on the existing Call-ID) with
    /// `auth_retries` challenge answers allowed.
    pub async fn register(&mut self, auth_retries: u32) -> Result<(), GateError> {
        let cseq = self.next_cseq();
        let request = match &self.registration {
            Some(registration) => self.factory.resubmit(&registration.dialog.request, cseq, None),
            None => self.factory.new_register(cseq),
        };

        match self.registration.as_mut() {
            Some(registration) => registration.restart(request.clone(), auth_retries),
            None => {
                self.registration = Some(RegistrationSession::new(request.clone(), auth_retries))
            }
        }

        counter!("sip_registrations_total").increment(1);
        info!(
            "Registering {} at {} (CSeq {})",
            self.authenticator.username(),
            self.factory.registrar(),
            cseq
        );

        if let Err(err) = self.send(request.into()).await {
            self.registration_failed();
            return Err(err);
        }
        Ok(())
    }

    async fn handle_command(&mut self, command: Command) -> Result<(), GateError> {
        match command {
            Command::PlaceCall { generation, number } => self.place_call(generation, &number).await,
            Command::Reregister => {
                let budget = self.settings.reregister_auth_retries;
                self.register(budget).await
            }
            Command::SendDeferred { role, cseq } => self.send_deferred(role, cseq).await,
            Command::Watchdog { generation } => {
                if let Some(call) = self.call.as_mut() {
                    if call.generation == generation && call.is_active() {
                        call.dialog.state = DialogState::Terminated;
                        gauge!("sip_active_calls").set(0.0);
                        counter!("sip_calls_failed").increment(1);
                        warn!("Call {} abandoned by watchdog", generation);
                    }
                }
                Ok(())
            }
        }
    }

    async fn place_call(&mut self, generation: CallGeneration, number: &str) -> Result<(), GateError> {
        if self.session.current_generation() != generation || !self.session.is_call_in_progress() {
            debug!("Call {} no longer wanted, not dialing", generation);
            return Ok(());
        }

        let cseq = self.next_cseq();
        let invite = self
            .factory
            .new_invite(number, cseq, self.settings.rtp_port);
        self.call = Some(CallSession::new(
            generation,
            number,
            invite.clone(),
            self.settings.invite_auth_retries,
        ));

        counter!("sip_calls_total").increment(1);
        gauge!("sip_active_calls").set(1.0);
        info!("Calling {} (call {}, CSeq {})", number, generation, cseq);

        if let Err(err) = self.send(invite.into()).await {
            self.abort_call();
            return Err(err);
        }
        Ok(())
    }

    async fn send_deferred(&mut self, role: DialogRole, cseq: u32) -> Result<(), GateError> {
        let waiting = match role {
            DialogRole::Registration => DialogState::Registering,
            DialogRole::Call => DialogState::Challenged,
        };
        let Some(dialog) = self.dialog_mut(role) else {
            return Ok(());
        };
        if dialog.state != waiting {
            debug!("Dropping deferred {:?} request, dialog is {}", role, dialog.state);
            return Ok(());
        }
        let Some(request) = dialog.take_deferred(cseq) else {
            debug!("Dropping stale deferred {:?} request (CSeq {})", role, cseq);
            return Ok(());
        };
        if role == DialogRole::Call {
            dialog.state = DialogState::Inviting;
        }

        debug!("Sending authenticated {:?} request (CSeq {})", role, cseq);
        if let Err(err) = self.send(request.into()).await {
            match role {
                DialogRole::Registration => self.registration_failed(),
                DialogRole::Call => self.abort_call(),
            }
            return Err(err);
        }
        Ok(())
    }

    async fn handle_message(&mut self, incoming: IncomingMessage) -> Result<(), GateError> {
        match incoming.message {
            SipMessage::Response(response) => self.handle_response(response).await,
            SipMessage::Request(request) => self.handle_request(request).await,
        }
    }

    async fn handle_request(&mut self, request: SipRequest) -> Result<(), GateError> {
        info!("Received {} request", request.inner.method);
        match request.method() {
            Some(SipMethod::Bye) => {
                let known = self
                    .call
                    .as_ref()
                    .is_some_and(|call| call.dialog.request.call_id() == request.call_id());
                if !known {
                    debug!("BYE for unknown dialog {:?}", request.call_id());
                    let unknown = self.factory.new_response(&request, 481)?;
                    return self.send(unknown.into()).await;
                }
                if let Some(call) = self.call.as_mut() {
                    call.dialog.state = DialogState::Terminated;
                }
                self.end_call(false);
                info!("Remote side hung up");

                let ok = self.factory.new_response(&request, 200)?;
                self.send(ok.into()).await
            }
            Some(SipMethod::Options) => {
                let ok = self.factory.new_response(&request, 200)?;
                self.send(ok.into()).await
            }
            _ => {
                debug!("Ignoring {} request", request.inner.method);
                Ok(())
            }
        }
    }

    async fn handle_response(&mut self, response: SipResponse) -> Result<(), GateError> {
        let status = response.status_code();
        let (Some(cseq), Some(method)) = (response.cseq(), response.cseq_method()) else {
            warn!("Response {} without usable CSeq, ignored", status);
            return Ok(());
        };
        info!(
            "Received {} {} for {} (CSeq {})",
            status,
            reason_phrase(status),
            method,
            cseq
        );

        let role = if method == SipMethod::Register {
            DialogRole::Registration
        } else {
            DialogRole::Call
        };
        let Some(dialog) = self.dialog_mut(role) else {
            debug!("No {:?} dialog for CSeq {}, ignored", role, cseq);
            return Ok(());
        };
        if !dialog.matches(cseq) {
            debug!("Stale response for CSeq {} (current {}), ignored", cseq, dialog.cseq);
            return Ok(());
        }

        let Some(event) = SipEvent::classify(status, method, dialog.auth_retries_remaining) else {
            return Ok(());
        };
        let Some(next) = transition(role, dialog.state, event) else {
            debug!("No transition for {:?} in {} on {:?} dialog", event, dialog.state, role);
            return Ok(());
        };
        debug!("{:?} dialog: {} -> {} ({:?})", role, dialog.state, next.next, next.effect);
        dialog.state = next.next;

        self.apply(role, next.effect, &response).await
    }

    async fn apply(
        &mut self,
        role: DialogRole,
        effect: Effect,
        response: &SipResponse,
    ) -> Result<(), GateError> {
        match effect {
            Effect::None => Ok(()),
            Effect::Authenticate => {
                self.set_registered(false);
                self.answer_challenge(role, response).await
            }
            Effect::RegistrationFailed => {
                warn!(
                    "Registration failed with {} {}, retrying at next refresh",
                    response.status_code(),
                    reason_phrase(response.status_code())
                );
                self.registration_failed();
                Ok(())
            }
            Effect::MarkRegistered => {
                self.set_registered(true);
                match response.expires() {
                    Some(expires) => {
                        info!("Registered at {} for {}s", self.factory.registrar(), expires)
                    }
                    None => info!("Registered at {}", self.factory.registrar()),
                }
                Ok(())
            }
            Effect::AckAndAuthenticate => {
                self.ack(response).await?;
                self.answer_challenge(role, response).await
            }
            Effect::AckAndAbandon => {
                warn!("INVITE authentication retries exhausted, call abandoned");
                self.end_call(true);
                self.ack(response).await
            }
            Effect::Cancel => {
                let Some(call) = self.call.as_ref() else {
                    return Ok(());
                };
                let cancel = self.factory.new_cancel(&call.dialog.request);
                info!(
                    "Call {} to {} reached the far end, cancelling",
                    call.generation, call.target_number
                );
                if let Err(err) = self.send(cancel.into()).await {
                    self.abort_call();
                    return Err(err);
                }
                Ok(())
            }
            Effect::AckAndEnd => {
                let rejected = self
                    .call
                    .as_ref()
                    .is_some_and(|call| call.dialog.state == DialogState::Rejected);
                self.end_call(rejected);
                self.ack(response).await
            }
            Effect::Ack => self.ack(response).await,
            Effect::EndCall => {
                self.end_call(false);
                Ok(())
            }
            Effect::AckAndReset => {
                warn!("Call forbidden, registering again");
                self.set_registered(false);
                self.end_call(true);
                self.ack(response).await?;
                let budget = self.settings.register_auth_retries;
                self.register(budget).await
            }
        }
    }

    /// Build the authenticated retry now, send it after the retry delay.
    async fn answer_challenge(
        &mut self,
        role: DialogRole,
        response: &SipResponse,
    ) -> Result<(), GateError> {
        let outcome = self.prepare_retry(role, response);
        let cseq = match outcome {
            Ok(cseq) => cseq,
            Err(err) => {
                match role {
                    DialogRole::Registration => self.registration_failed(),
                    DialogRole::Call => self.abort_call(),
                }
                return Err(err);
            }
        };

        let commands = self.commands_tx.clone();
        let delay = self.settings.retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands.send(Command::SendDeferred { role, cseq });
        });
        Ok(())
    }

    fn prepare_retry(&mut self, role: DialogRole, response: &SipResponse) -> Result<u32, GateError> {
        let (header, proxy) = match (response.www_authenticate(), response.proxy_authenticate()) {
            (Some(value), _) => (value, false),
            (None, Some(value)) => (value, true),
            (None, None) => {
                return Err(DigestError::Format(format!(
                    "{} without authenticate header",
                    response.status_code()
                ))
                .into())
            }
        };
        let challenge = parse_challenge(&header)?;

        self.cseq += 1;
        let cseq = self.cseq;
        let dialog = match role {
            DialogRole::Registration => self.registration.as_mut().map(|r| &mut r.dialog),
            DialogRole::Call => self.call.as_mut().map(|c| &mut c.dialog),
        }
        .ok_or_else(|| SipError::Internal(format!("no {:?} dialog to authenticate", role)))?;

        let nonce_count = dialog.next_nonce_count(&challenge.nonce);
        let method = dialog.request.inner.method.to_string();
        let uri = dialog.request.uri().to_string();
        let value = self
            .authenticator
            .authorize(&challenge, &method, &uri, nonce_count)?;
        let credentials = if proxy {
            Credentials::ProxyAuthorization(value)
        } else {
            Credentials::Authorization(value)
        };

        let retry = self.factory.resubmit(&dialog.request, cseq, Some(credentials));
        dialog.defer(retry);
        info!(
            "Answering {} challenge for {} (CSeq {}, {} retries left)",
            challenge.realm, method, cseq, dialog.auth_retries_remaining
        );
        Ok(cseq)
    }

    async fn ack(&self, response: &SipResponse) -> Result<(), GateError> {
        let Some(call) = self.call.as_ref() else {
            return Ok(());
        };
        let ack = self.factory.new_ack(response, &call.dialog.request);
        self.send(ack.into()).await
    }

    async fn send(&self, message: SipMessage) -> Result<(), GateError> {
        debug!("Sending {}", message.summary());
        self.transport.send(&message).await?;
        Ok(())
    }

    fn set_registered(&self, registered: bool) {
        self.session.set_registered(registered);
        gauge!("sip_registered").set(if registered { 1.0 } else { 0.0 });
    }

    fn registration_failed(&mut self) {
        if let Some(registration) = self.registration.as_mut() {
            registration.dialog.state = DialogState::Idle;
        }
        self.set_registered(false);
        counter!("sip_registration_failures_total").increment(1);
    }

    /// Release the call slot held by the current call, if it still is.
    fn end_call(&mut self, failed: bool) {
        let Some(call) = self.call.as_ref() else {
            return;
        };
        if self.session.end_call(call.generation) {
            gauge!("sip_active_calls").set(0.0);
            if failed {
                counter!("sip_calls_failed").increment(1);
            }
            info!("Call {} ended", call.generation);
        }
    }

    fn abort_call(&mut self) {
        if let Some(call) = self.call.as_mut() {
            call.dialog.state = DialogState::Terminated;
        }
        self.end_call(true);
    }
}

impl std::fmt::Debug for CallStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallStateMachine")
            .field("cseq", &self.cseq)
            .field("registration", &self.registration.as_ref().map(|r| r.dialog.state))
            .field("call", &self.call.as_ref().map(|c| (c.generation, c.dialog.state)))
            .finish()
    }
}
