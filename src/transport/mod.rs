//! # Transport Layer
//!
//! Sockets, framing and the connection lifecycle.
//!
//! ## Components
//! - **Framed**: message framing over a split stream with a dedicated writer
//! - **State**: the connection state graph and its change notification
//! - **Session**: the per-connection driver shared by both roles
//! - **Client**: resolve, connect, reconnect and disconnect
//! - **Server / Acceptor**: listening, connection limits, server sessions

pub mod acceptor;
pub mod client;
pub mod framed;
pub mod server;
pub mod session;
pub mod state;

pub use acceptor::Acceptor;
pub use client::ClientConnection;
pub use framed::{FramedTransport, Outbound, TransportEvent};
pub use server::{AcceptedSession, ServerSessions};
pub use session::{CloseReason, SessionEvent, SessionHandle};
pub use state::{ConnectionState, StateCell};
