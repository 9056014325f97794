//! # Client Connection
//!
//! Owns one client session across reconnects.
//!
//! `connect` moves the state machine to `ResolvingHost` and hands the rest
//! to a spawned task:
//!
//! 1. resolve the host (`ResolveFailed` on error or no endpoints)
//! 2. try every endpoint in order (`ConnectFailed` when all fail)
//! 3. `Connected`, then the session driver takes over the socket
//!
//! The configured connect timeout bounds steps 1 and 2 together.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::{ClientConfig, NetworkConfig, TransportConfig};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::handshake::{AuthGate, AuthModuleFactory};
use crate::protocol::message::{LogoutReason, Message};
use crate::transport::framed::FramedTransport;
use crate::transport::session::{
    CloseReason, Link, Role, SessionContext, SessionDriver, SessionEvent, SessionHandle,
    SessionOptions,
};
use crate::transport::state::{ConnectionState, StateCell};
use crate::utils::metrics::{global_metrics, Timer};

/// Settings a connect task needs, copied out of the connection
#[derive(Clone)]
struct ConnectPlan {
    host: String,
    port: u16,
    connect_timeout: Option<Duration>,
    nodelay: bool,
    transport: TransportConfig,
    options: SessionOptions,
    auth: Option<AuthModuleFactory>,
}

/// Client side of a session
///
/// Events for every connection attempt arrive on the receiver returned by
/// [`ClientConnection::new`].
pub struct ClientConnection {
    config: ClientConfig,
    transport: TransportConfig,
    auth: Option<AuthModuleFactory>,
    ctx: SessionContext,
    handle: SessionHandle,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ClientConnection {
    /// Creates an unconnected client. Without an auth factory the session
    /// is ready as soon as the socket connects.
    pub fn new(
        config: &NetworkConfig,
        auth: Option<AuthModuleFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let state = Arc::new(StateCell::new(ConnectionState::Unconnected));
        let ctx = SessionContext {
            state: Arc::clone(&state),
            events,
            role: Role::Client,
        };

        let client = Self {
            config: config.client.clone(),
            transport: config.transport.clone(),
            auth,
            ctx,
            handle: SessionHandle::new(state),
            task: Mutex::new(None),
        };
        (client, rx)
    }

    pub fn state(&self) -> ConnectionState {
        self.ctx.current()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.handle.watch_state()
    }

    /// Handle usable from other tasks
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Starts a connection attempt.
    ///
    /// Allowed from `Unconnected` or any terminal state; a terminal state is
    /// reset first, and anything still queued from the previous connection
    /// is discarded. Progress is reported through state changes only.
    ///
    /// # Errors
    /// `InvalidTransition` while an attempt or session is in progress.
    pub fn connect(&self, host: impl Into<String>, port: u16) -> Result<()> {
        let host = host.into();
        self.ctx.state.reset()?;

        let mut task = self.lock_task()?;
        if let Some(previous) = task.take() {
            previous.abort();
        }
        self.handle.set_link(None)?;

        if !self.ctx.transition(ConnectionState::ResolvingHost) {
            return Err(ProtocolError::InvalidTransition {
                from: self.ctx.current().to_string(),
                to: ConnectionState::ResolvingHost.to_string(),
            });
        }

        let plan = ConnectPlan {
            host,
            port,
            connect_timeout: self.config.connect_timeout,
            nodelay: self.config.nodelay,
            transport: self.transport.clone(),
            options: SessionOptions {
                handshake_timeout: self.config.handshake_timeout,
                logout_drain_timeout: self.config.logout_drain_timeout,
            },
            auth: self.auth.clone(),
        };
        *task = Some(tokio::spawn(run_connect(
            self.ctx.clone(),
            self.handle.clone(),
            plan,
        )));
        Ok(())
    }

    /// Queues an application message
    pub fn send(&self, message: &Message) -> Result<()> {
        self.handle.send(message)
    }

    /// Ends the current attempt or session.
    ///
    /// A connected session sends `Logout{Other}` and half-closes; an attempt
    /// still resolving or connecting is cancelled. Either way the state ends
    /// in `LoggedOut`. Does nothing when there is no attempt in progress.
    pub fn disconnect(&self) -> Result<()> {
        match self.ctx.current() {
            state if state.is_connected() => self.handle.logout(LogoutReason::Other),
            ConnectionState::ResolvingHost | ConnectionState::Connecting => {
                if let Some(task) = self.lock_task()?.take() {
                    task.abort();
                }
                self.handle.set_link(None)?;
                if self.ctx.transition(ConnectionState::LoggedOut) {
                    info!("connection attempt cancelled");
                    self.ctx
                        .emit(SessionEvent::ConnectionClosing(CloseReason::LocalClosed));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn lock_task(&self) -> Result<std::sync::MutexGuard<'_, Option<JoinHandle<()>>>> {
        self.task
            .lock()
            .map_err(|_| ProtocolError::Internal(constants::ERR_LOCK_POISONED.to_string()))
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("state", &self.ctx.current())
            .field("has_auth", &self.auth.is_some())
            .finish()
    }
}

/// Applies the shared connect deadline to one step
async fn within<T, F>(deadline: Option<Instant>, step: &str, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| ProtocolError::Timeout(step.to_string()))?,
        None => fut.await,
    }
}

async fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let endpoints: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ProtocolError::ResolveError(format!("{host}: {e}")))?
        .collect();
    if endpoints.is_empty() {
        return Err(ProtocolError::ResolveError(format!(
            "{host}: {}",
            constants::ERR_NO_ENDPOINTS
        )));
    }
    Ok(endpoints)
}

async fn connect_any(endpoints: &[SocketAddr], nodelay: bool) -> Result<TcpStream> {
    let mut last_error = None;
    for endpoint in endpoints {
        match TcpStream::connect(endpoint).await {
            Ok(stream) => {
                if nodelay {
                    stream.set_nodelay(true)?;
                }
                return Ok(stream);
            }
            Err(e) => {
                debug!(endpoint = %endpoint, error = %e, "endpoint refused");
                last_error = Some(e);
            }
        }
    }
    Err(ProtocolError::ConnectError(match last_error {
        Some(e) => e.to_string(),
        None => constants::ERR_NO_ENDPOINTS.to_string(),
    }))
}

#[instrument(skip_all, fields(host = %plan.host, port = plan.port))]
async fn run_connect(ctx: SessionContext, handle: SessionHandle, plan: ConnectPlan) {
    let deadline = plan.connect_timeout.map(|limit| Instant::now() + limit);
    let timer = Timer::start("connect");

    let endpoints = match within(deadline, "resolve", resolve(&plan.host, plan.port)).await {
        Ok(endpoints) => endpoints,
        Err(e) => {
            warn!(error = %e, "resolve failed");
            global_metrics().connection_error();
            ctx.transition(ConnectionState::ResolveFailed);
            return;
        }
    };

    // a rejected transition means the attempt was cancelled meanwhile
    if !ctx.transition(ConnectionState::Connecting) {
        return;
    }

    let stream = match within(deadline, "connect", connect_any(&endpoints, plan.nodelay)).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "connect failed");
            global_metrics().connection_error();
            ctx.transition(ConnectionState::ConnectFailed);
            return;
        }
    };

    drop(timer);

    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| plan.host.clone());

    let transport = FramedTransport::new(stream, &plan.transport);
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let link = Link {
        outbound: transport.outbound(),
        control: control_tx,
    };
    if let Err(e) = handle.set_link(Some(link)) {
        warn!(error = %e, "session link unavailable");
        return;
    }

    if !ctx.transition(ConnectionState::Connected) {
        let _ = handle.set_link(None);
        return;
    }
    info!(peer = %peer, "connected");

    let driver = SessionDriver {
        ctx,
        transport,
        gate: AuthGate::new(plan.auth.as_ref().map(|factory| factory())),
        control: control_rx,
        options: plan.options,
        peer,
    };
    driver.run().await;
}
