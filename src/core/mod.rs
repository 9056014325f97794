//! # Core Protocol Components
//!
//! Wire primitives, frames, and the stream codec.
//!
//! This module provides the foundation for the session protocol: how values
//! are laid out inside a payload and how payloads are framed on a byte
//! stream.
//!
//! ## Components
//! - **Wire**: little-endian integers, fixed-point doubles, bounded strings
//! - **Identifier**: 16-byte opaque correlation id
//! - **Frame**: `[id][length][payload]` unit
//! - **Codec**: Tokio codec for framing over byte streams, with an optional
//!   encryption filter
//!
//! ## Wire Format
//! ```text
//! [MessageId(2)] [Length(2)] [Payload(N)]
//! ```
//!
//! ## Limits
//! - Maximum payload size: 65535 bytes (the length field is 16 bits)
//! - No magic number or version field; a corrupt header is unrecoverable

pub mod codec;
pub mod frame;
pub mod identifier;
pub mod vector;
pub mod wire;

pub use codec::FrameCodec;
pub use frame::{RawFrame, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use identifier::Identifier;
pub use vector::Vector3;
