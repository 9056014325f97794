//! Server-side sessions.
//!
//! An accepted stream enters the state machine at `Connected` and gets its
//! own driver task; nothing here waits on the handshake.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::{NetworkConfig, TransportConfig};
use crate::protocol::handshake::{AuthGate, AuthModuleFactory};
use crate::transport::framed::FramedTransport;
use crate::transport::session::{
    Link, Role, SessionContext, SessionDriver, SessionEvent, SessionHandle, SessionOptions,
};
use crate::transport::state::{ConnectionState, StateCell};

/// A running server session handed to the application
#[derive(Debug)]
pub struct AcceptedSession {
    pub peer: SocketAddr,
    pub handle: SessionHandle,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// Starts server sessions with shared settings
#[derive(Clone)]
pub struct ServerSessions {
    auth: Option<AuthModuleFactory>,
    options: SessionOptions,
    transport: TransportConfig,
}

impl ServerSessions {
    pub fn new(config: &NetworkConfig, auth: Option<AuthModuleFactory>) -> Self {
        Self {
            auth,
            options: SessionOptions {
                handshake_timeout: config.server.handshake_timeout,
                logout_drain_timeout: config.server.logout_drain_timeout,
            },
            transport: config.transport.clone(),
        }
    }

    pub fn requires_auth(&self) -> bool {
        self.auth.is_some()
    }

    /// Spawns a session over `stream`. Must be called inside a tokio
    /// runtime.
    pub fn spawn<S>(&self, stream: S, peer: SocketAddr) -> AcceptedSession
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.spawn_guarded(stream, peer, ())
    }

    /// Like [`spawn`](Self::spawn), holding `guard` until the session ends
    pub(crate) fn spawn_guarded<S, G>(&self, stream: S, peer: SocketAddr, guard: G) -> AcceptedSession
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        G: Send + 'static,
    {
        let state = Arc::new(StateCell::new(ConnectionState::Connected));
        let (events_tx, events) = mpsc::unbounded_channel();
        let ctx = SessionContext {
            state: Arc::clone(&state),
            events: events_tx,
            role: Role::Server,
        };

        let transport = FramedTransport::new(stream, &self.transport);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let handle = SessionHandle::new(state);
        let link = Link {
            outbound: transport.outbound(),
            control: control_tx,
        };
        if let Err(e) = handle.set_link(Some(link)) {
            debug!(error = %e, "session starts without a link");
        }

        let driver = SessionDriver {
            ctx,
            transport,
            gate: AuthGate::new(self.auth.as_ref().map(|factory| factory())),
            control: control_rx,
            options: self.options.clone(),
            peer: peer.to_string(),
        };
        tokio::spawn(async move {
            driver.run().await;
            drop(guard);
        });

        AcceptedSession {
            peer,
            handle,
            events,
        }
    }
}

impl std::fmt::Debug for ServerSessions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSessions")
            .field("requires_auth", &self.requires_auth())
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use crate::protocol::message::{LogoutReason, Message, Text, TextKind};

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn session_without_auth_is_ready_immediately() {
        let (server_side, client_side) = tokio::io::duplex(1024);
        let sessions = ServerSessions::new(&NetworkConfig::default(), None);
        let mut accepted = sessions.spawn(server_side, peer());

        assert_eq!(
            accepted.events.recv().await.unwrap(),
            SessionEvent::StateChanged(ConnectionState::Ready)
        );

        let mut client = FramedTransport::new(client_side, &TransportConfig::default());
        client
            .send(&Message::Text(Text::new(TextKind::Say, "hello")))
            .unwrap();
        let SessionEvent::Message(Message::Text(text)) = accepted.events.recv().await.unwrap()
        else {
            panic!("expected text");
        };
        assert_eq!(text.text, "hello");

        accepted.handle.send(&Message::PingResponse).unwrap();
        assert_eq!(client.recv().await.unwrap().unwrap(), Message::PingResponse);
    }

    #[tokio::test]
    async fn ping_is_answered_and_forwarded() {
        let (server_side, client_side) = tokio::io::duplex(1024);
        let sessions = ServerSessions::new(&NetworkConfig::default(), None);
        let mut accepted = sessions.spawn(server_side, peer());
        let mut client = FramedTransport::new(client_side, &TransportConfig::default());

        client.send(&Message::PingRequest).unwrap();
        assert_eq!(client.recv().await.unwrap().unwrap(), Message::PingResponse);

        accepted.events.recv().await.unwrap();
        assert_eq!(
            accepted.events.recv().await.unwrap(),
            SessionEvent::Message(Message::PingRequest)
        );
    }

    #[tokio::test]
    async fn local_logout_reaches_peer_and_blocks_sends() {
        let (server_side, client_side) = tokio::io::duplex(1024);
        let sessions = ServerSessions::new(&NetworkConfig::default(), None);
        let accepted = sessions.spawn(server_side, peer());
        let mut client = FramedTransport::new(client_side, &TransportConfig::default());

        accepted.handle.logout(LogoutReason::Maintenance).unwrap();
        assert_eq!(
            client.recv().await.unwrap().unwrap(),
            Message::Logout(LogoutReason::Maintenance)
        );

        let mut watch = accepted.handle.watch_state();
        while *watch.borrow_and_update() != ConnectionState::LoggedOut {
            watch.changed().await.unwrap();
        }
        assert!(matches!(
            accepted.handle.send(&Message::PingRequest),
            Err(ProtocolError::ConnectionClosed)
        ));
    }
}
