//! # Protocol Layer
//!
//! Message definitions and the authentication exchange that gates a session.
//!
//! ## Components
//! - **Message**: typed payloads and the message id table
//! - **Handshake**: `AuthModule`/`EncryptModule` traits, the `AuthGate` that
//!   routes inbound messages until authentication completes, and an
//!   in-memory handshake tester
//! - **Auth**: reference SHA-256 challenge/response strategy with a
//!   ChaCha20 stream filter
//!
//! ## Handshake Flow
//! ```text
//! Client                    Server
//!   |---AuthRequest--------->|
//!   |<--AuthChallenge--------|
//!   |---AuthVerify---------->|
//!   |<--AuthVerifyAck--------|
//!   |   [encrypted session]  |
//! ```

pub mod auth;
pub mod handshake;
pub mod message;

pub use handshake::{AuthGate, AuthModule, AuthModuleFactory, EncryptModule, GateOutcome};
pub use message::{LogoutReason, Message, MessageId};
