//! # Frame Codec
//!
//! `tokio_util::codec` adapter that turns a byte stream into [`RawFrame`]s
//! and back.
//!
//! The decoder owns the reassembly buffer handed to it by `FramedRead`:
//! bytes accumulate until a header plus its declared payload is available,
//! frames are extracted in arrival order, and any remainder stays buffered
//! for the next read.
//!
//! An optional encryption filter may be installed at any point in the
//! stream. On the read side only bytes that arrived after installation are
//! decrypted; the decoder remembers how far into the buffer it has already
//! filtered so each byte passes through the cipher exactly once.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::core::frame::{peek_header, RawFrame, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::handshake::SharedEncryptModule;
use crate::protocol::message::Message;

/// Encoder/decoder for `[u16 id][u16 len][payload]` frames
pub struct FrameCodec {
    filter: Option<SharedEncryptModule>,
    /// Prefix of the read buffer already passed through `filter`
    filtered: usize,
    max_payload: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_payload(MAX_PAYLOAD_SIZE)
    }

    /// Creates a codec that refuses payloads larger than `max_payload`.
    ///
    /// Values above the wire limit are clamped to it.
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            filter: None,
            filtered: 0,
            max_payload: max_payload.min(MAX_PAYLOAD_SIZE),
        }
    }

    /// Installs the encryption filter. Bytes already decoded or encoded are
    /// unaffected.
    pub fn set_filter(&mut self, filter: SharedEncryptModule) {
        self.filter = Some(filter);
        self.filtered = 0;
    }

    pub fn has_filter(&self) -> bool {
        self.filter.is_some()
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    fn decrypt_pending(&mut self, src: &mut BytesMut) -> Result<()> {
        let Some(filter) = &self.filter else {
            return Ok(());
        };
        if self.filtered < src.len() {
            let mut module = filter
                .lock()
                .map_err(|_| ProtocolError::Internal(constants::ERR_LOCK_POISONED.to_string()))?;
            module.decrypt_read(&mut src[self.filtered..])?;
            self.filtered = src.len();
        }
        Ok(())
    }

    fn encrypt_tail(&self, dst: &mut BytesMut, start: usize) -> Result<()> {
        if let Some(filter) = &self.filter {
            let mut module = filter
                .lock()
                .map_err(|_| ProtocolError::Internal(constants::ERR_LOCK_POISONED.to_string()))?;
            module.encrypt_write(&mut dst[start..])?;
        }
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FrameCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCodec")
            .field("encrypted", &self.filter.is_some())
            .field("filtered", &self.filtered)
            .field("max_payload", &self.max_payload)
            .finish()
    }
}

impl Decoder for FrameCodec {
    type Item = RawFrame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RawFrame>> {
        self.decrypt_pending(src)?;

        let Some((id, len)) = peek_header(src) else {
            src.reserve(HEADER_SIZE);
            return Ok(None);
        };

        let len = usize::from(len);
        if len > self.max_payload {
            return Err(ProtocolError::ProtocolDesync(format!(
                "frame 0x{id:04x} declares {len} bytes, limit is {}",
                self.max_payload
            )));
        }

        let total = HEADER_SIZE + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total);
        if self.filter.is_some() {
            self.filtered = self.filtered.saturating_sub(total);
        }
        let payload = frame.split_off(HEADER_SIZE).freeze();
        trace!(message_id = id, len, "frame decoded");
        Ok(Some(RawFrame { id, payload }))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<RawFrame>> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => Err(ProtocolError::ProtocolDesync(format!(
                "{} ({} bytes buffered)",
                constants::ERR_TRUNCATED_FRAME,
                buf.len()
            ))),
        }
    }
}

impl Encoder<RawFrame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: RawFrame, dst: &mut BytesMut) -> Result<()> {
        if frame.payload.len() > self.max_payload {
            return Err(ProtocolError::OversizedPayload(frame.payload.len()));
        }
        let start = dst.len();
        frame.write_to(dst);
        self.encrypt_tail(dst, start)
    }
}

impl Encoder<&Message> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, message: &Message, dst: &mut BytesMut) -> Result<()> {
        let frame = message.to_frame()?;
        Encoder::<RawFrame>::encode(self, frame, dst)
    }
}
