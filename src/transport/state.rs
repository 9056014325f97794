//! Connection lifecycle states
//!
//! ```text
//! Unconnected -> ResolvingHost -> Connecting -> Connected -> Authenticating -> Ready -> LoggedOut
//!                      |              |            |               |
//!                 ResolveFailed  ConnectFailed     +----------> AuthFailed
//! ```
//!
//! Progress is strictly forward. The only way back is the reconnect reset
//! from a terminal state to `Unconnected`. A server-side session enters the
//! graph at `Connected`.

use std::fmt;

use tokio::sync::watch;
use tracing::trace;

use crate::error::{ProtocolError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Unconnected,
    ResolvingHost,
    ResolveFailed,
    Connecting,
    ConnectFailed,
    Connected,
    Authenticating,
    AuthFailed,
    Ready,
    LoggedOut,
}

impl ConnectionState {
    /// States a session stays in until the next connect
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::ResolveFailed | Self::ConnectFailed | Self::AuthFailed | Self::LoggedOut
        )
    }

    /// Whether a socket exists in this state
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Authenticating | Self::Ready)
    }

    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, next) {
            (Unconnected, ResolvingHost) => true,
            (ResolvingHost, Connecting | ResolveFailed | LoggedOut) => true,
            (Connecting, Connected | ConnectFailed | LoggedOut) => true,
            (Connected, Authenticating | Ready | AuthFailed | LoggedOut) => true,
            (Authenticating, Ready | AuthFailed | LoggedOut) => true,
            (Ready, LoggedOut) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unconnected => "unconnected",
            Self::ResolvingHost => "resolving_host",
            Self::ResolveFailed => "resolve_failed",
            Self::Connecting => "connecting",
            Self::ConnectFailed => "connect_failed",
            Self::Connected => "connected",
            Self::Authenticating => "authenticating",
            Self::AuthFailed => "auth_failed",
            Self::Ready => "ready",
            Self::LoggedOut => "logged_out",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state plus change notification
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<ConnectionState>,
}

impl StateCell {
    pub fn new(initial: ConnectionState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Moves to `next` if the graph allows it, returning the previous state
    pub fn transition(&self, next: ConnectionState) -> Result<ConnectionState> {
        let mut outcome = Err(ProtocolError::Internal(String::new()));
        self.tx.send_if_modified(|current| {
            let from = *current;
            if from.can_transition_to(next) {
                *current = next;
                outcome = Ok(from);
                true
            } else {
                outcome = Err(ProtocolError::InvalidTransition {
                    from: from.to_string(),
                    to: next.to_string(),
                });
                false
            }
        });
        if let Ok(from) = &outcome {
            trace!(from = %from, to = %next, "state transition");
        }
        outcome
    }

    /// Reconnect reset: terminal (or never started) back to `Unconnected`
    pub fn reset(&self) -> Result<()> {
        let mut outcome = Ok(());
        self.tx.send_if_modified(|current| {
            if current.is_terminal() {
                *current = ConnectionState::Unconnected;
                true
            } else {
                if *current != ConnectionState::Unconnected {
                    outcome = Err(ProtocolError::InvalidTransition {
                        from: current.to_string(),
                        to: ConnectionState::Unconnected.to_string(),
                    });
                }
                false
            }
        });
        outcome
    }
}
