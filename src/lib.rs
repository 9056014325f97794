//! # mog-session
//!
//! Session transport for a multiplayer game client and server.
//!
//! Messages travel as `[u16 id][u16 length][payload]` frames, little-endian,
//! over TCP. Each connection walks a forward-only state graph from
//! `Unconnected` to `Ready`, gated by a pluggable authentication module that
//! may install a stream cipher once the exchange completes.
//!
//! ## Layout
//! - [`core`]: wire primitives, frames and the tokio codec
//! - [`protocol`]: the message set, the auth gate and the reference
//!   authentication strategy
//! - [`transport`]: framed transport, state machine, client, server sessions
//!   and the acceptor
//! - [`config`], [`error`], [`utils`]: configuration, errors, logging and
//!   metrics
//!
//! ## Example
//! ```no_run
//! use mog_session::config::NetworkConfig;
//! use mog_session::protocol::auth::ClientAuth;
//! use mog_session::transport::{ClientConnection, SessionEvent};
//!
//! # async fn run() -> mog_session::error::Result<()> {
//! let config = NetworkConfig::default();
//! let (client, mut events) =
//!     ClientConnection::new(&config, Some(ClientAuth::factory("alice", "secret")));
//! client.connect("127.0.0.1", config.server.port)?;
//!
//! while let Some(event) = events.recv().await {
//!     if let SessionEvent::LoggedOut(reason) = event {
//!         println!("logged out: {reason}");
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use error::{ProtocolError, Result};
pub use protocol::message::{LogoutReason, Message, MessageId};
pub use transport::{Acceptor, ClientConnection, ConnectionState, SessionEvent, SessionHandle};
