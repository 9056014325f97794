//! Authentication gate and the pluggable handshake strategy
//!
//! A session is unauthenticated until its [`AuthModule`] says otherwise.
//! Until then the [`AuthGate`] routes every inbound message except ping and
//! logout to the module and withholds it from the application. Once the
//! module reports success the gate opens for good and hands out the
//! module's optional [`EncryptModule`], which the transport installs as a
//! filter on both directions.
//!
//! **Key Change: Per-Session State**
//! The gate and its module are owned by exactly one connection task. Nothing
//! about a handshake lives in globals, so concurrent handshakes cannot
//! interfere with one another.
//!
//! The message-level exchange is fixed:
//!
//! ```text
//! client                          server
//!   AuthRequest{username, A}  ->
//!                             <-  AuthChallenge{salt, B}
//!   AuthVerify{Hc}            ->
//!                             <-  AuthVerifyAck{Hs}
//! ```
//!
//! The math behind `A`, `B`, `Hc` and `Hs` belongs to the module.

use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, instrument, warn};

use crate::core::codec::FrameCodec;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::Message;

/// Symmetric filter applied to whole frames after authentication
pub trait EncryptModule: Send {
    /// Encrypts outbound bytes in place
    fn encrypt_write(&mut self, data: &mut [u8]) -> Result<()>;

    /// Decrypts inbound bytes in place
    fn decrypt_read(&mut self, data: &mut [u8]) -> Result<()>;
}

/// Encryption module shared between the read and write halves of a connection
pub type SharedEncryptModule = Arc<Mutex<Box<dyn EncryptModule>>>;

/// Wraps a module for use by both codec instances of one connection
pub fn share_encrypt_module(module: Box<dyn EncryptModule>) -> SharedEncryptModule {
    Arc::new(Mutex::new(module))
}

/// Strategy implementing one side of the handshake
pub trait AuthModule: Send {
    /// Starts the exchange; a client typically queues its `AuthRequest` here
    fn init_authentication(&mut self, out: &mut Vec<Message>) -> Result<()>;

    fn is_authenticated(&self) -> bool;

    /// Handles one inbound message. Returns `false` if the message is not
    /// part of the exchange, which the gate treats as a protocol violation.
    ///
    /// # Errors
    /// `AuthRejected` for bad credentials or proofs, `AuthInternalError` for
    /// out-of-order or malformed steps.
    fn on_receive_message(&mut self, message: &Message, out: &mut Vec<Message>) -> Result<bool>;

    /// Hands out the encryption filter negotiated by the handshake, if any.
    /// Called once, after `is_authenticated` turns true.
    fn encrypt_module(&mut self) -> Option<Box<dyn EncryptModule>>;
}

/// Produces a fresh module for every connection
pub type AuthModuleFactory = Arc<dyn Fn() -> Box<dyn AuthModule> + Send + Sync>;

/// What the owner of a gate should do with an inbound message
pub enum GateOutcome {
    /// Pass to the application
    Deliver(Message),
    /// Consumed by the handshake
    Consumed,
    /// Consumed, and the handshake completed with it
    Authenticated(Option<Box<dyn EncryptModule>>),
}

impl std::fmt::Debug for GateOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateOutcome::Deliver(message) => f.debug_tuple("Deliver").field(message).finish(),
            GateOutcome::Consumed => f.write_str("Consumed"),
            GateOutcome::Authenticated(encrypt) => f
                .debug_tuple("Authenticated")
                .field(&encrypt.is_some())
                .finish(),
        }
    }
}

/// Routes inbound messages while a session is unauthenticated
pub struct AuthGate {
    module: Option<Box<dyn AuthModule>>,
    authenticated: bool,
}

impl AuthGate {
    /// A gate without a module is open from the start
    pub fn new(module: Option<Box<dyn AuthModule>>) -> Self {
        let authenticated = module.is_none();
        Self {
            module,
            authenticated,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Whether a handshake has to run before the session is ready
    pub fn requires_handshake(&self) -> bool {
        self.module.is_some()
    }

    /// Lets the module queue its opening messages
    pub fn start(&mut self, out: &mut Vec<Message>) -> Result<()> {
        match self.module.as_mut() {
            Some(module) if !self.authenticated => module.init_authentication(out),
            _ => Ok(()),
        }
    }

    /// Routes one inbound message.
    ///
    /// Pre-authentication only ping and logout are delivered; everything
    /// else goes to the module, and a message the module does not handle
    /// fails the handshake. Post-authentication everything is delivered.
    pub fn route(&mut self, message: Message, out: &mut Vec<Message>) -> Result<GateOutcome> {
        if self.authenticated || message.is_control() {
            return Ok(GateOutcome::Deliver(message));
        }

        let Some(module) = self.module.as_mut() else {
            return Ok(GateOutcome::Deliver(message));
        };

        if !module.on_receive_message(&message, out)? {
            return Err(ProtocolError::AuthInternalError(format!(
                "{}: 0x{:04x}",
                constants::ERR_UNEXPECTED_AUTH_MESSAGE,
                message.id().as_u16()
            )));
        }

        if module.is_authenticated() {
            self.authenticated = true;
            debug!("authentication complete");
            return Ok(GateOutcome::Authenticated(module.encrypt_module()));
        }

        Ok(GateOutcome::Consumed)
    }
}

impl std::fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGate")
            .field("has_module", &self.module.is_some())
            .field("authenticated", &self.authenticated)
            .finish()
    }
}

/// Passes one message through the real frame codec, as the wire would
fn over_the_wire(message: &Message) -> Result<Message> {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::new();
    codec.encode(message, &mut buf)?;
    let frame = codec
        .decode(&mut buf)?
        .ok_or_else(|| ProtocolError::ProtocolDesync(constants::ERR_TRUNCATED_FRAME.into()))?;
    Message::decode(&frame)
}

/// Delivers everything in `inbox` to `gate`, collecting replies in `outbox`
fn pump(
    gate: &mut AuthGate,
    inbox: &mut Vec<Message>,
    outbox: &mut Vec<Message>,
    encrypt: &mut Option<Option<Box<dyn EncryptModule>>>,
) -> Result<()> {
    for message in std::mem::take(inbox) {
        let message = over_the_wire(&message)?;
        match gate.route(message, outbox)? {
            GateOutcome::Authenticated(module) => *encrypt = Some(module),
            GateOutcome::Consumed => {}
            GateOutcome::Deliver(other) => {
                return Err(ProtocolError::AuthInternalError(format!(
                    "{}: 0x{:04x}",
                    constants::ERR_UNEXPECTED_AUTH_MESSAGE,
                    other.id().as_u16()
                )))
            }
        }
    }
    Ok(())
}

/// Runs a complete handshake between two modules in memory.
///
/// Every message travels through the frame codec and the message decoder.
/// Succeeds only if both sides end up authenticated, both or neither
/// supplied an encryption module, and, when both did, each side can
/// decrypt what the other encrypted.
#[instrument(skip_all)]
pub fn exercise_handshake(client: Box<dyn AuthModule>, server: Box<dyn AuthModule>) -> Result<()> {
    const MAX_ROUNDS: usize = 16;

    let mut client = AuthGate::new(Some(client));
    let mut server = AuthGate::new(Some(server));
    let mut to_server = Vec::new();
    let mut to_client = Vec::new();
    client.start(&mut to_server)?;
    server.start(&mut to_client)?;

    let mut client_encrypt = None;
    let mut server_encrypt = None;

    for _ in 0..MAX_ROUNDS {
        if to_server.is_empty() && to_client.is_empty() {
            break;
        }
        pump(&mut server, &mut to_server, &mut to_client, &mut server_encrypt)?;
        pump(&mut client, &mut to_client, &mut to_server, &mut client_encrypt)?;
    }

    let (Some(client_encrypt), Some(server_encrypt)) = (client_encrypt, server_encrypt) else {
        warn!(
            client = client.is_authenticated(),
            server = server.is_authenticated(),
            "handshake did not complete"
        );
        return Err(ProtocolError::AuthInternalError(
            "handshake did not complete on both sides".to_string(),
        ));
    };

    match (client_encrypt, server_encrypt) {
        (None, None) => Ok(()),
        (Some(mut client), Some(mut server)) => {
            check_direction(client.as_mut(), server.as_mut(), b"client to server")?;
            check_direction(server.as_mut(), client.as_mut(), b"server to client")
        }
        _ => Err(ProtocolError::AuthInternalError(
            constants::ERR_ENCRYPT_MISMATCH.to_string(),
        )),
    }
}

fn check_direction(
    sender: &mut dyn EncryptModule,
    receiver: &mut dyn EncryptModule,
    sample: &[u8],
) -> Result<()> {
    let mut data = sample.to_vec();
    sender.encrypt_write(&mut data)?;
    receiver.decrypt_read(&mut data)?;
    if data != sample {
        return Err(ProtocolError::AuthInternalError(format!(
            "encryption modules disagree ({})",
            String::from_utf8_lossy(sample)
        )));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::protocol::message::{
        AuthChallenge, AuthRequest, AuthVerify, AuthVerifyAck, LogoutReason, Text, TextKind,
    };

    struct Xor(u8);

    impl EncryptModule for Xor {
        fn encrypt_write(&mut self, data: &mut [u8]) -> Result<()> {
            data.iter_mut().for_each(|b| *b ^= self.0);
            Ok(())
        }

        fn decrypt_read(&mut self, data: &mut [u8]) -> Result<()> {
            self.encrypt_write(data)
        }
    }

    /// Walks the four steps without any math
    struct Scripted {
        client: bool,
        step: u8,
        key: Option<u8>,
    }

    impl Scripted {
        fn client(key: Option<u8>) -> Box<dyn AuthModule> {
            Box::new(Self {
                client: true,
                step: 0,
                key,
            })
        }

        fn server(key: Option<u8>) -> Box<dyn AuthModule> {
            Box::new(Self {
                client: false,
                step: 0,
                key,
            })
        }
    }

    impl AuthModule for Scripted {
        fn init_authentication(&mut self, out: &mut Vec<Message>) -> Result<()> {
            if self.client {
                out.push(Message::AuthRequest(AuthRequest {
                    username: "alice".into(),
                    a: [0u8; 128],
                }));
            }
            Ok(())
        }

        fn is_authenticated(&self) -> bool {
            self.step == 2
        }

        fn on_receive_message(&mut self, message: &Message, out: &mut Vec<Message>) -> Result<bool> {
            match (self.client, self.step, message) {
                (false, 0, Message::AuthRequest(_)) => {
                    out.push(Message::AuthChallenge(AuthChallenge {
                        salt: vec![1u8; 16],
                        b: [2u8; 128],
                    }));
                    self.step = 1;
                }
                (true, 0, Message::AuthChallenge(_)) => {
                    out.push(Message::AuthVerify(AuthVerify { hc: [3u8; 20] }));
                    self.step = 1;
                }
                (false, 1, Message::AuthVerify(_)) => {
                    out.push(Message::AuthVerifyAck(AuthVerifyAck { hs: [4u8; 20] }));
                    self.step = 2;
                }
                (true, 1, Message::AuthVerifyAck(_)) => self.step = 2,
                _ => return Ok(false),
            }
            Ok(true)
        }

        fn encrypt_module(&mut self) -> Option<Box<dyn EncryptModule>> {
            self.key
                .take()
                .map(|key| Box::new(Xor(key)) as Box<dyn EncryptModule>)
        }
    }

    #[test]
    fn gate_without_module_is_open() {
        let mut gate = AuthGate::new(None);
        assert!(gate.is_authenticated());
        assert!(!gate.requires_handshake());
        let mut out = Vec::new();
        let text = Message::Text(Text::new(TextKind::Say, "hi"));
        assert!(matches!(
            gate.route(text, &mut out).unwrap(),
            GateOutcome::Deliver(_)
        ));
    }

    #[test]
    fn pre_auth_only_control_messages_are_delivered() {
        let mut gate = AuthGate::new(Some(Scripted::server(None)));
        let mut out = Vec::new();

        assert!(matches!(
            gate.route(Message::PingRequest, &mut out).unwrap(),
            GateOutcome::Deliver(Message::PingRequest)
        ));
        assert!(matches!(
            gate.route(Message::Logout(LogoutReason::Other), &mut out).unwrap(),
            GateOutcome::Deliver(Message::Logout(LogoutReason::Other))
        ));

        let text = Message::Text(Text::new(TextKind::Say, "too early"));
        assert!(matches!(
            gate.route(text, &mut out),
            Err(ProtocolError::AuthInternalError(_))
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn post_auth_everything_is_delivered() {
        let mut gate = AuthGate::new(Some(Scripted::server(Some(5))));
        let mut out = Vec::new();
        let request = Message::AuthRequest(AuthRequest {
            username: "alice".into(),
            a: [0u8; 128],
        });
        assert!(matches!(
            gate.route(request.clone(), &mut out).unwrap(),
            GateOutcome::Consumed
        ));
        let verify = Message::AuthVerify(AuthVerify { hc: [3u8; 20] });
        assert!(matches!(
            gate.route(verify, &mut out).unwrap(),
            GateOutcome::Authenticated(Some(_))
        ));
        assert_eq!(out.len(), 2);
        assert!(gate.is_authenticated());

        // auth messages after success belong to the application
        assert!(matches!(
            gate.route(request, &mut out).unwrap(),
            GateOutcome::Deliver(Message::AuthRequest(_))
        ));
    }

    #[test]
    fn exercise_with_and_without_encryption() {
        exercise_handshake(Scripted::client(None), Scripted::server(None)).unwrap();
        exercise_handshake(Scripted::client(Some(9)), Scripted::server(Some(9))).unwrap();
    }

    #[test]
    fn exercise_detects_one_sided_encryption() {
        let err = exercise_handshake(Scripted::client(Some(9)), Scripted::server(None)).unwrap_err();
        assert!(err.to_string().contains(constants::ERR_ENCRYPT_MISMATCH));
    }

    #[test]
    fn exercise_detects_incompatible_ciphers() {
        assert!(exercise_handshake(Scripted::client(Some(1)), Scripted::server(Some(2))).is_err());
    }

    #[test]
    fn exercise_fails_when_one_side_never_finishes() {
        struct Silent;
        impl AuthModule for Silent {
            fn init_authentication(&mut self, _out: &mut Vec<Message>) -> Result<()> {
                Ok(())
            }
            fn is_authenticated(&self) -> bool {
                false
            }
            fn on_receive_message(&mut self, _: &Message, _: &mut Vec<Message>) -> Result<bool> {
                Ok(true)
            }
            fn encrypt_module(&mut self) -> Option<Box<dyn EncryptModule>> {
                None
            }
        }

        assert!(exercise_handshake(Scripted::client(None), Box::new(Silent)).is_err());
    }
}
