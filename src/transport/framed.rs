//! # Framed Transport
//!
//! Turns a duplex byte stream into a channel of whole [`Message`]s.
//!
//! The read half is a `FramedRead` driven by [`FrameCodec`], which owns the
//! partial-read reassembly buffer. The write half belongs to a dedicated
//! writer task fed by an unbounded queue:
//!
//! - `send` encodes, encrypts (once a filter is installed) and enqueues
//!   without waiting for I/O
//! - the writer takes one buffer at a time and only dequeues the next after
//!   `write_all` for the previous one has finished
//! - closing the outbound side lets queued buffers drain, then shuts the
//!   write half down
//!
//! Encryption happens under the queue lock, so the keystream is consumed in
//! the same order the bytes reach the wire.

use std::io;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Encoder, FramedRead};
use tracing::{debug, trace};

use crate::config::TransportConfig;
use crate::core::codec::FrameCodec;
use crate::core::frame::RawFrame;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::handshake::{share_encrypt_module, EncryptModule, SharedEncryptModule};
use crate::protocol::message::Message;
use crate::utils::metrics::global_metrics;

struct OutboundState {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    codec: FrameCodec,
    buf: BytesMut,
}

/// Cloneable sending side of a transport
#[derive(Clone)]
pub struct Outbound {
    state: Arc<Mutex<OutboundState>>,
}

impl Outbound {
    fn new(tx: mpsc::UnboundedSender<Bytes>, max_payload: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(OutboundState {
                tx: Some(tx),
                codec: FrameCodec::with_max_payload(max_payload),
                buf: BytesMut::new(),
            })),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, OutboundState>> {
        self.state
            .lock()
            .map_err(|_| ProtocolError::Internal(constants::ERR_LOCK_POISONED.to_string()))
    }

    /// Queues a message. Never waits for the socket.
    ///
    /// # Errors
    /// `ConnectionClosed` once the outbound side has been closed; encode
    /// errors (`OversizedPayload`, `LengthExceeded`, ...) leave the queue
    /// untouched.
    pub fn send(&self, message: &Message) -> Result<()> {
        let frame = message.to_frame()?;
        trace!(message_id = frame.id, "queueing message");
        self.send_frame(frame)
    }

    /// Queues a pre-built frame
    pub fn send_frame(&self, frame: RawFrame) -> Result<()> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        if state.tx.is_none() {
            return Err(ProtocolError::ConnectionClosed);
        }

        state.codec.encode(frame, &mut state.buf)?;
        let bytes = state.buf.split().freeze();
        let len = bytes.len();

        let sent = state
            .tx
            .as_ref()
            .map(|tx| tx.send(bytes).is_ok())
            .unwrap_or(false);
        if !sent {
            state.tx = None;
            return Err(ProtocolError::ConnectionClosed);
        }

        let metrics = global_metrics();
        metrics.inc_messages_sent();
        metrics.add_bytes_sent(len as u64);
        Ok(())
    }

    /// Stops accepting messages; already queued buffers are still written
    pub fn close(&self) {
        if let Ok(mut state) = self.lock() {
            if state.tx.take().is_some() {
                debug!("outbound closed");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().map(|state| state.tx.is_none()).unwrap_or(true)
    }

    fn install_filter(&self, filter: SharedEncryptModule) -> Result<()> {
        self.lock()?.codec.set_filter(filter);
        Ok(())
    }
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbound")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Writes queued buffers in order, one at a time
async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Bytes>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(buf) = rx.recv().await {
        writer.write_all(&buf).await?;
        writer.flush().await?;
    }
    writer.shutdown().await
}

fn record_inbound(frame: &RawFrame) {
    let metrics = global_metrics();
    metrics.inc_messages_received();
    metrics.add_bytes_received(frame.encoded_len() as u64);
}

/// Outcome of [`FramedTransport::next_event`]
#[derive(Debug)]
pub enum TransportEvent {
    Inbound(Result<Message>),
    /// Peer closed its write side with no partial frame pending
    Closed,
    /// Writer task ended; `Ok` after a requested close, `Err` on a write failure
    WriterStopped(io::Result<()>),
}

/// A duplex stream framed into messages
pub struct FramedTransport<S> {
    reader: FramedRead<ReadHalf<S>, FrameCodec>,
    outbound: Outbound,
    writer: JoinHandle<io::Result<()>>,
    writer_done: bool,
}

impl<S> FramedTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Splits `stream` and spawns its writer task. Must be called inside a
    /// tokio runtime.
    pub fn new(stream: S, config: &TransportConfig) -> Self {
        let (read_half, write_half): (ReadHalf<S>, WriteHalf<S>) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();

        let reader = FramedRead::with_capacity(
            read_half,
            FrameCodec::with_max_payload(config.max_payload_size),
            config.read_buffer_capacity,
        );
        let writer = tokio::spawn(write_loop(write_half, rx));

        Self {
            reader,
            outbound: Outbound::new(tx, config.max_payload_size),
            writer,
            writer_done: false,
        }
    }

    pub fn outbound(&self) -> Outbound {
        self.outbound.clone()
    }

    pub fn send(&self, message: &Message) -> Result<()> {
        self.outbound.send(message)
    }

    /// Half-closes: no further sends, queued data still goes out
    pub fn close_outbound(&self) {
        self.outbound.close();
    }

    /// Installs the encryption filter on both directions.
    ///
    /// Messages queued before this call go out in the clear; inbound bytes
    /// not yet decoded are decrypted.
    pub fn install_encrypt_module(&mut self, module: Box<dyn EncryptModule>) -> Result<()> {
        let shared = share_encrypt_module(module);
        self.reader.decoder_mut().set_filter(Arc::clone(&shared));
        self.outbound.install_filter(shared)?;
        debug!("encryption filter installed");
        Ok(())
    }

    pub fn is_encrypted(&self) -> bool {
        self.reader.decoder().has_filter()
    }

    /// Next raw frame; `None` on clean end of stream
    pub async fn recv_frame(&mut self) -> Option<Result<RawFrame>> {
        let frame = self.reader.next().await?;
        if let Ok(frame) = &frame {
            record_inbound(frame);
        }
        Some(frame)
    }

    /// Next decoded message; `None` on clean end of stream
    pub async fn recv(&mut self) -> Option<Result<Message>> {
        let frame = match self.recv_frame().await? {
            Ok(frame) => frame,
            Err(e) => return Some(Err(e)),
        };
        Some(Message::decode(&frame))
    }

    /// Resolves once the writer task has stopped, with its outcome. Pending
    /// forever after the first completion.
    pub async fn writer_finished(&mut self) -> io::Result<()> {
        if self.writer_done {
            return std::future::pending().await;
        }
        let outcome = (&mut self.writer).await;
        self.writer_done = true;
        match outcome {
            Ok(result) => result,
            Err(join) => Err(io::Error::other(join.to_string())),
        }
    }

    /// Waits for whichever comes first: an inbound message, end of stream,
    /// or the writer task stopping
    pub async fn next_event(&mut self) -> TransportEvent {
        let writer_done = self.writer_done;
        tokio::select! {
            written = &mut self.writer, if !writer_done => {
                self.writer_done = true;
                TransportEvent::WriterStopped(match written {
                    Ok(result) => result,
                    Err(join) => Err(io::Error::other(join.to_string())),
                })
            }
            frame = self.reader.next() => match frame {
                None => TransportEvent::Closed,
                Some(Err(e)) => TransportEvent::Inbound(Err(e)),
                Some(Ok(frame)) => {
                    record_inbound(&frame);
                    TransportEvent::Inbound(Message::decode(&frame))
                }
            },
        }
    }

    /// Closes the outbound side and waits for queued data to be written
    pub async fn shutdown(mut self) -> io::Result<()> {
        self.outbound.close();
        if self.writer_done {
            return Ok(());
        }
        self.writer_finished().await
    }
}

impl<S> std::fmt::Debug for FramedTransport<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedTransport")
            .field("outbound", &self.outbound)
            .field("writer_done", &self.writer_done)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::protocol::message::{LogoutReason, Text, TextKind};
    use tokio::io::AsyncReadExt;

    fn config() -> TransportConfig {
        TransportConfig::default()
    }

    #[tokio::test]
    async fn messages_arrive_in_send_order() {
        let (a, b) = tokio::io::duplex(64);
        let left = FramedTransport::new(a, &config());
        let mut right = FramedTransport::new(b, &config());

        for i in 0..50 {
            left.send(&Message::Text(Text::new(TextKind::Say, format!("line {i}"))))
                .unwrap();
        }
        left.close_outbound();

        for i in 0..50 {
            let Message::Text(text) = right.recv().await.unwrap().unwrap() else {
                panic!("expected text");
            };
            assert_eq!(text.text, format!("line {i}"));
        }
        assert!(right.recv().await.is_none());
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (a, _b) = tokio::io::duplex(64);
        let transport = FramedTransport::new(a, &config());
        transport.close_outbound();
        assert!(matches!(
            transport.send(&Message::PingRequest),
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn queued_data_drains_before_shutdown() {
        let (a, mut b) = tokio::io::duplex(8);
        let transport = FramedTransport::new(a, &config());
        for _ in 0..10 {
            transport
                .send(&Message::Logout(LogoutReason::Maintenance))
                .unwrap();
        }

        let reader = tokio::spawn(async move {
            let mut wire = Vec::new();
            b.read_to_end(&mut wire).await.unwrap();
            wire
        });

        transport.shutdown().await.unwrap();
        let wire = reader.await.unwrap();
        assert_eq!(wire.len(), 10 * 5);
        assert_eq!(&wire[..5], &[0x03, 0x00, 0x01, 0x00, 0x05]);
    }

    #[tokio::test]
    async fn unknown_id_surfaces_as_error() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut transport = FramedTransport::new(a, &config());
        b.write_all(&[0x99, 0x09, 0x00, 0x00]).await.unwrap();
        assert!(matches!(
            transport.recv().await,
            Some(Err(ProtocolError::UnknownMessage(0x0999)))
        ));
    }

    #[tokio::test]
    async fn truncated_stream_is_desync() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut transport = FramedTransport::new(a, &config());
        b.write_all(&[0x01, 0x00, 0x01]).await.unwrap();
        drop(b);
        assert!(matches!(
            transport.recv().await,
            Some(Err(ProtocolError::ProtocolDesync(_)))
        ));
    }
}
