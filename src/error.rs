//! # Error Types
//!
//! Error handling for the session transport.
//!
//! This module defines every error variant that can surface while encoding,
//! framing, authenticating or connecting a session.
//!
//! ## Error Categories
//! - **Codec Errors**: reading past the end of a payload, bounded fields over their limit
//! - **Framing Errors**: protocol desync, unknown message ids, oversized payloads
//! - **Handshake Errors**: internal authentication failures and rejected credentials
//! - **Transport Errors**: hostname resolution and connect failures, closed connections
//!
//! Codec and framing errors are always fatal for the connection they occur on;
//! the wire format has no resynchronization marker. Only resolve and connect
//! errors are worth retrying, and only by issuing a fresh connect.
//!
//! ## Example Usage
//! ```rust
//! use mog_session::core::wire::WireReader;
//! use mog_session::error::ProtocolError;
//!
//! let mut reader = WireReader::new(&[0x01]);
//! match reader.read_u16() {
//!     Err(ProtocolError::Underrun { needed, available }) => {
//!         assert_eq!((needed, available), (2, 1));
//!     }
//!     other => panic!("unexpected: {other:?}"),
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Framing errors
    pub const ERR_TRUNCATED_FRAME: &str = "Stream ended inside a frame";
    pub const ERR_TRAILING_PAYLOAD: &str = "Message decoder left payload bytes unread";

    /// Handshake errors
    pub const ERR_ALREADY_AUTHENTICATED: &str = "Peer is already authenticated";
    pub const ERR_UNEXPECTED_AUTH_MESSAGE: &str = "Authentication message out of order";
    pub const ERR_SALT_GENERATION: &str = "Could not produce a non-zero salt";
    pub const ERR_RANDOM_SOURCE: &str = "Random source unavailable";
    pub const ERR_UNKNOWN_USER: &str = "Unknown user or wrong password";
    pub const ERR_CLIENT_PROOF: &str = "Client proof did not verify";
    pub const ERR_SERVER_PROOF: &str = "Server proof did not verify";
    pub const ERR_ENCRYPT_MISMATCH: &str = "Only one side supplied an encryption module";
    pub const ERR_LOGOUT_DURING_AUTH: &str = "Peer logged out during authentication";

    /// Connection errors
    pub const ERR_NO_ENDPOINTS: &str = "Hostname resolved to no endpoints";
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";
}

/// ProtocolError is the primary error type for all session operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Codec read past the bytes available in the payload
    #[error("Read underrun: needed {needed} bytes, {available} available")]
    Underrun { needed: usize, available: usize },

    /// A length-prefixed field declared more than the caller allows
    #[error("Declared length {declared} exceeds limit {max}")]
    LengthExceeded { declared: usize, max: usize },

    /// Frame boundaries can no longer be trusted
    #[error("Protocol desync: {0}")]
    ProtocolDesync(String),

    #[error("Unknown message id 0x{0:04x}")]
    UnknownMessage(u16),

    /// Encoded payload does not fit the 16-bit length field
    #[error("Payload too large: {0} bytes")]
    OversizedPayload(usize),

    /// Field decoded but holds a value outside its domain
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Authentication internal error: {0}")]
    AuthInternalError(String),

    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    #[error("Resolve error: {0}")]
    ResolveError(String),

    #[error("Connect error: {0}")]
    ConnectError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Timeout occurred: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProtocolError {
    /// Whether a fresh connect attempt may succeed after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProtocolError::ResolveError(_) | ProtocolError::ConnectError(_)
        )
    }

    /// Whether the error came out of the authentication exchange
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            ProtocolError::AuthInternalError(_) | ProtocolError::AuthRejected(_)
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_failures_are_retryable() {
        assert!(ProtocolError::ResolveError("nx".into()).is_retryable());
        assert!(ProtocolError::ConnectError("refused".into()).is_retryable());
        assert!(!ProtocolError::AuthRejected("bad".into()).is_retryable());
        assert!(!ProtocolError::ProtocolDesync("x".into()).is_retryable());
        assert!(!ProtocolError::ConnectionClosed.is_retryable());
    }

    #[test]
    fn auth_failures_are_classified() {
        assert!(ProtocolError::AuthInternalError("salt".into()).is_auth_failure());
        assert!(ProtocolError::AuthRejected("proof".into()).is_auth_failure());
        assert!(!ProtocolError::UnknownMessage(7).is_auth_failure());
    }

    #[test]
    fn display_includes_hex_id() {
        let text = ProtocolError::UnknownMessage(0x0abc).to_string();
        assert_eq!(text, "Unknown message id 0x0abc");
    }
}
