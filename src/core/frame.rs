//! # Raw Frame
//!
//! The only unit on the wire:
//!
//! ```text
//! [u16 message_id][u16 payload_length][payload_length bytes]
//! ```
//!
//! Both header fields are little-endian. There is no magic number and no
//! version field, so a frame boundary that is lost cannot be recovered.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};

/// Size of the frame header (id + length)
pub const HEADER_SIZE: usize = 4;

/// Largest payload the 16-bit length field can describe
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// A complete frame: message id plus undecoded payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub id: u16,
    pub payload: Bytes,
}

impl RawFrame {
    /// Wraps a payload, rejecting anything the length field cannot carry
    pub fn new(id: u16, payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::OversizedPayload(payload.len()));
        }
        Ok(Self { id, payload })
    }

    /// Total size on the wire
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Appends header and payload to `dst`
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u16_le(self.id);
        dst.put_u16_le(self.payload.len() as u16);
        dst.put_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write_to(&mut buf);
        buf.freeze()
    }

    /// Parses one complete frame from the front of `data`.
    ///
    /// Returns the frame and the number of bytes it occupied. A header shorter
    /// than the minimum, or a declared length beyond the bytes supplied, is a
    /// desync.
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize)> {
        let (id, len) = peek_header(data).ok_or_else(|| {
            ProtocolError::ProtocolDesync(format!(
                "frame header needs {HEADER_SIZE} bytes, got {}",
                data.len()
            ))
        })?;

        let total = HEADER_SIZE + usize::from(len);
        if data.len() < total {
            return Err(ProtocolError::ProtocolDesync(format!(
                "frame 0x{id:04x} declares {len} payload bytes, only {} available",
                data.len() - HEADER_SIZE
            )));
        }

        let payload = Bytes::copy_from_slice(&data[HEADER_SIZE..total]);
        Ok((Self { id, payload }, total))
    }
}

/// Reads `(id, payload_length)` without consuming anything
pub fn peek_header(data: &[u8]) -> Option<(u16, u16)> {
    if data.len() < HEADER_SIZE {
        return None;
    }
    let id = u16::from_le_bytes([data[0], data[1]]);
    let len = u16::from_le_bytes([data[2], data[3]]);
    Some((id, len))
}
