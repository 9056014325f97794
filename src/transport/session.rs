//! Per-connection session driver shared by the client and server roles.
//!
//! One task per connection owns the read side, the [`AuthGate`] and the
//! state cell; it is the only place state transitions happen once a socket
//! exists. The application talks to it through a [`SessionHandle`] and hears
//! back through a channel of [`SessionEvent`]s.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::handshake::{AuthGate, GateOutcome};
use crate::protocol::message::{LogoutReason, Message};
use crate::transport::framed::{FramedTransport, Outbound, TransportEvent};
use crate::transport::state::{ConnectionState, StateCell};
use crate::utils::metrics::global_metrics;

/// Why a connection is going away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    RemoteClosed,
    LocalClosed,
    ReadError(String),
    WriteError(String),
    /// Desync, unknown message or malformed payload
    ProtocolViolation(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::RemoteClosed => f.write_str("remote closed"),
            CloseReason::LocalClosed => f.write_str("local closed"),
            CloseReason::ReadError(e) => write!(f, "read error: {e}"),
            CloseReason::WriteError(e) => write!(f, "write error: {e}"),
            CloseReason::ProtocolViolation(e) => write!(f, "protocol violation: {e}"),
        }
    }
}

/// Notifications delivered to the owner of a session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    /// Application message, delivered in arrival order
    Message(Message),
    /// The session logged out; transport loss reports `ConnectionDropped`
    LoggedOut(LogoutReason),
    ConnectionClosing(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Server,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}

/// Requests from the handle to the driver
#[derive(Debug)]
pub(crate) enum Control {
    Logout(LogoutReason),
}

#[derive(Debug, Clone)]
pub(crate) struct SessionOptions {
    pub handshake_timeout: Option<Duration>,
    pub logout_drain_timeout: Duration,
}

/// Live link to a running driver
#[derive(Debug, Clone)]
pub(crate) struct Link {
    pub outbound: Outbound,
    pub control: mpsc::UnboundedSender<Control>,
}

/// State plus event emission, shared by the driver and the client's
/// connect task
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub state: Arc<StateCell>,
    pub events: mpsc::UnboundedSender<SessionEvent>,
    pub role: Role,
}

impl SessionContext {
    /// Attempts a transition and announces it. Rejected transitions are
    /// logged and reported as `false`.
    pub fn transition(&self, next: ConnectionState) -> bool {
        match self.state.transition(next) {
            Ok(from) => {
                debug!(role = self.role.as_str(), from = %from, to = %next, "state changed");
                self.emit(SessionEvent::StateChanged(next));
                true
            }
            Err(e) => {
                debug!(role = self.role.as_str(), error = %e, "transition rejected");
                false
            }
        }
    }

    pub fn emit(&self, event: SessionEvent) {
        // the owner may have stopped listening; the session still runs
        let _ = self.events.send(event);
    }

    pub fn current(&self) -> ConnectionState {
        self.state.get()
    }
}

/// Application-side handle to one session
#[derive(Clone)]
pub struct SessionHandle {
    pub(crate) state: Arc<StateCell>,
    pub(crate) link: Arc<Mutex<Option<Link>>>,
}

impl SessionHandle {
    pub(crate) fn new(state: Arc<StateCell>) -> Self {
        Self {
            state,
            link: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn set_link(&self, link: Option<Link>) -> Result<()> {
        let mut slot = self
            .link
            .lock()
            .map_err(|_| ProtocolError::Internal(constants::ERR_LOCK_POISONED.to_string()))?;
        *slot = link;
        Ok(())
    }

    pub(crate) fn link(&self) -> Result<Option<Link>> {
        self.link
            .lock()
            .map(|slot| slot.clone())
            .map_err(|_| ProtocolError::Internal(constants::ERR_LOCK_POISONED.to_string()))
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Queues a message without waiting for I/O
    ///
    /// # Errors
    /// `ConnectionClosed` when there is no socket or the session has logged
    /// out; encode errors otherwise.
    pub fn send(&self, message: &Message) -> Result<()> {
        let link = self.link()?.ok_or(ProtocolError::ConnectionClosed)?;
        link.outbound.send(message)
    }

    /// Sends `Logout{reason}` and ends the session
    pub fn logout(&self, reason: LogoutReason) -> Result<()> {
        let link = self.link()?.ok_or(ProtocolError::ConnectionClosed)?;
        link.control
            .send(Control::Logout(reason))
            .map_err(|_| ProtocolError::ConnectionClosed)
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("state", &self.state.get())
            .finish()
    }
}

enum Step {
    Continue,
    Finished,
}

/// Drives one connected session until it ends
pub(crate) struct SessionDriver<S> {
    pub ctx: SessionContext,
    pub transport: FramedTransport<S>,
    pub gate: AuthGate,
    pub control: mpsc::UnboundedReceiver<Control>,
    pub options: SessionOptions,
    pub peer: String,
}

impl<S> SessionDriver<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub async fn run(mut self) {
        global_metrics().connection_established();
        if let Step::Continue = self.begin() {
            self.event_loop().await;
        }
        global_metrics().connection_closed();
        debug!(peer = %self.peer, role = self.ctx.role.as_str(), state = %self.ctx.current(), "session finished");
    }

    /// Connected -> Authenticating (and the module's opening messages) or
    /// straight to Ready
    fn begin(&mut self) -> Step {
        if !self.gate.requires_handshake() {
            self.ctx.transition(ConnectionState::Ready);
            return Step::Continue;
        }

        global_metrics().handshake_attempt();
        self.ctx.transition(ConnectionState::Authenticating);
        let mut out = Vec::new();
        let started = self.gate.start(&mut out);
        if let Err(e) = started.and_then(|()| self.send_all(&out)) {
            self.fail_auth(e);
            return Step::Finished;
        }
        Step::Continue
    }

    async fn event_loop(&mut self) {
        let handshake_timeout = self.options.handshake_timeout;
        let deadline = tokio::time::sleep(handshake_timeout.unwrap_or(Duration::MAX));
        tokio::pin!(deadline);

        loop {
            let step = tokio::select! {
                Some(control) = self.control.recv() => self.on_control(control),
                _ = &mut deadline, if handshake_timeout.is_some() && !self.gate.is_authenticated() => {
                    warn!(peer = %self.peer, "handshake timed out");
                    self.fail_auth(ProtocolError::Timeout("authentication".to_string()));
                    Step::Finished
                }
                event = self.transport.next_event() => self.on_transport_event(event),
            };

            match step {
                Step::Continue => {}
                Step::Finished => break,
            }
        }

        self.drain().await;
    }

    fn on_transport_event(&mut self, event: TransportEvent) -> Step {
        match event {
            TransportEvent::Inbound(Ok(message)) => self.on_message(message),
            TransportEvent::Inbound(Err(ProtocolError::Io(e))) => {
                self.on_loss(CloseReason::ReadError(e.to_string()))
            }
            TransportEvent::Inbound(Err(e)) => {
                global_metrics().protocol_error();
                warn!(peer = %self.peer, error = %e, "protocol violation");
                if self.gate.is_authenticated() {
                    self.on_loss(CloseReason::ProtocolViolation(e.to_string()))
                } else {
                    self.fail_auth(e);
                    Step::Finished
                }
            }
            TransportEvent::Closed => self.on_loss(CloseReason::RemoteClosed),
            TransportEvent::WriterStopped(Err(e)) => {
                self.on_loss(CloseReason::WriteError(e.to_string()))
            }
            // only stops cleanly after a close this driver asked for
            TransportEvent::WriterStopped(Ok(())) => Step::Continue,
        }
    }

    fn send_all(&self, messages: &[Message]) -> Result<()> {
        for message in messages {
            self.transport.send(message)?;
        }
        Ok(())
    }

    fn on_message(&mut self, message: Message) -> Step {
        let mut out = Vec::new();
        let routed = self.gate.route(message, &mut out);
        // replies produced by the handshake go out before any filter is installed
        let routed = routed.and_then(|outcome| self.send_all(&out).map(|()| outcome));

        match routed {
            Err(e) => {
                self.fail_auth(e);
                Step::Finished
            }
            Ok(GateOutcome::Consumed) => Step::Continue,
            Ok(GateOutcome::Authenticated(encrypt)) => {
                if let Some(module) = encrypt {
                    if let Err(e) = self.transport.install_encrypt_module(module) {
                        self.fail_auth(e);
                        return Step::Finished;
                    }
                }
                global_metrics().handshake_success();
                info!(peer = %self.peer, role = self.ctx.role.as_str(), encrypted = self.transport.is_encrypted(), "session authenticated");
                self.ctx.transition(ConnectionState::Ready);
                Step::Continue
            }
            Ok(GateOutcome::Deliver(message)) => self.deliver(message),
        }
    }

    fn deliver(&mut self, message: Message) -> Step {
        match message {
            Message::Logout(reason) => {
                info!(peer = %self.peer, reason = %reason, "peer logged out");
                self.transport.close_outbound();
                let next = if self.ctx.role == Role::Client && !self.gate.is_authenticated() {
                    warn!(peer = %self.peer, reason = %reason, "{}", constants::ERR_LOGOUT_DURING_AUTH);
                    global_metrics().handshake_failed();
                    ConnectionState::AuthFailed
                } else {
                    ConnectionState::LoggedOut
                };
                self.ctx.transition(next);
                self.ctx.emit(SessionEvent::LoggedOut(reason));
                Step::Finished
            }
            Message::PingRequest => {
                if let Err(e) = self.transport.send(&Message::PingResponse) {
                    debug!(error = %e, "ping response not sent");
                }
                self.ctx.emit(SessionEvent::Message(Message::PingRequest));
                Step::Continue
            }
            other => {
                self.ctx.emit(SessionEvent::Message(other));
                Step::Continue
            }
        }
    }

    fn on_control(&mut self, control: Control) -> Step {
        match control {
            Control::Logout(reason) => {
                info!(peer = %self.peer, reason = %reason, "logging out");
                if let Err(e) = self.transport.send(&Message::Logout(reason)) {
                    debug!(error = %e, "logout not sent");
                }
                self.transport.close_outbound();
                self.ctx.transition(ConnectionState::LoggedOut);
                self.ctx.emit(SessionEvent::ConnectionClosing(CloseReason::LocalClosed));
                Step::Finished
            }
        }
    }

    /// Handshake failure: the server tells the peer why, both sides end in
    /// `AuthFailed`
    fn fail_auth(&mut self, error: ProtocolError) {
        warn!(peer = %self.peer, role = self.ctx.role.as_str(), error = %error, "authentication failed");
        global_metrics().handshake_failed();

        if self.ctx.role == Role::Server {
            let reason = match error {
                ProtocolError::AuthRejected(_) => LogoutReason::UserPassUnknown,
                _ => LogoutReason::Other,
            };
            if let Err(e) = self.transport.send(&Message::Logout(reason)) {
                debug!(error = %e, "logout not sent");
            }
        }
        self.transport.close_outbound();

        if !self.ctx.transition(ConnectionState::AuthFailed) {
            // gate was already open: a protocol error on a ready session
            self.ctx.transition(ConnectionState::LoggedOut);
        }
        self.ctx.emit(SessionEvent::ConnectionClosing(
            CloseReason::ProtocolViolation(error.to_string()),
        ));
    }

    /// Transport loss or protocol violation on an established session
    fn on_loss(&mut self, reason: CloseReason) -> Step {
        info!(peer = %self.peer, reason = %reason, "connection closing");
        self.transport.close_outbound();
        self.ctx.emit(SessionEvent::ConnectionClosing(reason));
        if self.ctx.transition(ConnectionState::LoggedOut) {
            self.ctx
                .emit(SessionEvent::LoggedOut(LogoutReason::ConnectionDropped));
        }
        Step::Finished
    }

    /// Half-closed: keep reading until the peer closes or the drain window
    /// ends, discarding what arrives, and let queued writes finish
    async fn drain(&mut self) {
        self.transport.close_outbound();
        let window = self.options.logout_drain_timeout;
        let transport = &mut self.transport;
        let drained = tokio::time::timeout(window, async {
            loop {
                match transport.next_event().await {
                    TransportEvent::Inbound(Ok(message)) => {
                        debug!(message_id = message.id().as_u16(), "discarding message after logout");
                    }
                    TransportEvent::WriterStopped(Err(e)) => {
                        debug!(error = %e, "write failed while draining");
                    }
                    TransportEvent::WriterStopped(Ok(())) => {}
                    TransportEvent::Inbound(Err(_)) | TransportEvent::Closed => break,
                }
            }
        })
        .await;

        if drained.is_err() {
            debug!(peer = %self.peer, "drain window elapsed");
        }
    }
}
