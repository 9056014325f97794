//! # Messages
//!
//! Typed payloads carried in frames.
//!
//! Every message is identified by its `u16` id and knows how to write its
//! payload with a [`WireWriter`] and read it back with a [`WireReader`].
//! Decoding is strict: a payload must be consumed exactly, and enumerated
//! fields outside their domain are rejected.
//!
//! ## Message ids
//! ```text
//! 0x0001 PingRequest        0x0010 Action
//! 0x0002 PingResponse       0x0011 AddRemoveObject
//! 0x0003 Logout             0x0012 UpdateObjectMovement
//! 0x0004 ConnectionInit     0x0013 Command
//! 0x0005 SessionInit        0x0014 MovePlayer
//!                           0x0015 Text
//! 0x0200 AuthRequest        0x0202 AuthVerify
//! 0x0201 AuthChallenge      0x0203 AuthVerifyAck
//! ```
//!
//! `ConnectionInit` is reserved; a frame carrying it is reported as an
//! unknown message.

use std::fmt;

use crate::core::frame::{RawFrame, MAX_PAYLOAD_SIZE};
use crate::core::identifier::Identifier;
use crate::core::vector::Vector3;
use crate::core::wire::{WireReader, WireWriter};
use crate::error::{constants, ProtocolError, Result};

/// Payload byte of a ping request
pub const PING_REQUEST_MAGIC: u8 = 42;
/// Payload byte of a ping response
pub const PING_RESPONSE_MAGIC: u8 = 64;

/// Username bound in `AuthRequest`
pub const MAX_USERNAME_LEN: usize = 16;
/// Size of the public values `A` and `B`
pub const AUTH_PUBLIC_LEN: usize = 128;
/// Upper bound of the salt length byte in `AuthChallenge`
pub const MAX_SALT_LEN: usize = 32;
/// Size of the `Hc`/`Hs` proofs
pub const AUTH_PROOF_LEN: usize = 20;

pub const MAX_NAME_LEN: usize = 64;
pub const MAX_VERB_LEN: usize = 64;
pub const MAX_TEXT_LEN: usize = 256;
pub const MAX_RECIPIENT_LEN: usize = 64;

/// Numeric message identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageId {
    PingRequest = 0x0001,
    PingResponse = 0x0002,
    Logout = 0x0003,
    ConnectionInit = 0x0004,
    SessionInit = 0x0005,
    Action = 0x0010,
    AddRemoveObject = 0x0011,
    UpdateObjectMovement = 0x0012,
    Command = 0x0013,
    MovePlayer = 0x0014,
    Text = 0x0015,
    AuthRequest = 0x0200,
    AuthChallenge = 0x0201,
    AuthVerify = 0x0202,
    AuthVerifyAck = 0x0203,
}

impl MessageId {
    pub fn from_u16(raw: u16) -> Option<Self> {
        Some(match raw {
            0x0001 => Self::PingRequest,
            0x0002 => Self::PingResponse,
            0x0003 => Self::Logout,
            0x0004 => Self::ConnectionInit,
            0x0005 => Self::SessionInit,
            0x0010 => Self::Action,
            0x0011 => Self::AddRemoveObject,
            0x0012 => Self::UpdateObjectMovement,
            0x0013 => Self::Command,
            0x0014 => Self::MovePlayer,
            0x0015 => Self::Text,
            0x0200 => Self::AuthRequest,
            0x0201 => Self::AuthChallenge,
            0x0202 => Self::AuthVerify,
            0x0203 => Self::AuthVerifyAck,
            _ => return None,
        })
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Messages of the authentication exchange
    pub fn is_auth(self) -> bool {
        matches!(
            self,
            Self::AuthRequest | Self::AuthChallenge | Self::AuthVerify | Self::AuthVerifyAck
        )
    }
}

/// Reason carried by a `Logout` message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LogoutReason {
    UserPassUnknown = 0,
    ServerShutdown = 1,
    Blocked = 2,
    ConnectionDropped = 3,
    ServerFull = 4,
    Maintenance = 5,
    Other = 6,
}

impl LogoutReason {
    pub fn from_u8(raw: u8) -> Result<Self> {
        Ok(match raw {
            0 => Self::UserPassUnknown,
            1 => Self::ServerShutdown,
            2 => Self::Blocked,
            3 => Self::ConnectionDropped,
            4 => Self::ServerFull,
            5 => Self::Maintenance,
            6 => Self::Other,
            other => {
                return Err(ProtocolError::InvalidValue(format!(
                    "unknown logout reason {other}"
                )))
            }
        })
    }
}

impl fmt::Display for LogoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::UserPassUnknown => "unknown user or wrong password",
            Self::ServerShutdown => "server shutdown",
            Self::Blocked => "account blocked",
            Self::ConnectionDropped => "connection dropped",
            Self::ServerFull => "server full",
            Self::Maintenance => "maintenance",
            Self::Other => "other",
        };
        f.write_str(text)
    }
}

/// Position and motion of an object
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MovementInfo {
    pub position: Vector3,
    pub heading: f64,
    pub speed: f64,
}

impl MovementInfo {
    fn write(&self, w: &mut WireWriter) -> Result<()> {
        w.write_vector(&self.position)?;
        w.write_fixed(self.heading)?;
        w.write_fixed(self.speed)
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            position: r.read_vector()?,
            heading: r.read_fixed()?,
            speed: r.read_fixed()?,
        })
    }
}

/// First message of a game session, server to client
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInit {
    pub player: Identifier,
    pub name: String,
    pub movement: MovementInfo,
}

/// A player-issued command
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub actor: Identifier,
    pub verb: String,
    pub target: Option<Identifier>,
}

/// An action performed by an object, as broadcast by the server
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub actor: Identifier,
    pub verb: String,
    pub target: Option<Identifier>,
}

/// Object entering the observer's view
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInfo {
    pub id: Identifier,
    pub name: String,
    pub movement: MovementInfo,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AddRemoveObject {
    pub added: Vec<ObjectInfo>,
    pub removed: Vec<Identifier>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateObjectMovement {
    pub object: Identifier,
    pub movement: MovementInfo,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MovePlayer {
    pub movement: MovementInfo,
}

/// Chat channel of a `Text` message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TextKind {
    Say = 1,
    Yell = 2,
    Whisper = 3,
    Party = 4,
    Guild = 5,
    Zone = 6,
    World = 7,
}

impl TextKind {
    pub fn from_u8(raw: u8) -> Result<Self> {
        Ok(match raw {
            1 => Self::Say,
            2 => Self::Yell,
            3 => Self::Whisper,
            4 => Self::Party,
            5 => Self::Guild,
            6 => Self::Zone,
            7 => Self::World,
            other => {
                return Err(ProtocolError::InvalidValue(format!(
                    "invalid text message kind {other}"
                )))
            }
        })
    }
}

/// Chat text. `recipient` is only carried for whispers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Text {
    pub kind: TextKind,
    pub text: String,
    pub recipient: Option<String>,
}

impl Text {
    pub fn new(kind: TextKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            recipient: None,
        }
    }

    pub fn whisper(recipient: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind: TextKind::Whisper,
            text: text.into(),
            recipient: Some(recipient.into()),
        }
    }
}

/// Step 1, client to server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub username: String,
    pub a: [u8; AUTH_PUBLIC_LEN],
}

/// Step 2, server to client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub salt: Vec<u8>,
    pub b: [u8; AUTH_PUBLIC_LEN],
}

/// Step 3, client proof
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthVerify {
    pub hc: [u8; AUTH_PROOF_LEN],
}

/// Step 4, server proof
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthVerifyAck {
    pub hs: [u8; AUTH_PROOF_LEN],
}

/// All messages understood by the session layer
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    PingRequest,
    PingResponse,
    Logout(LogoutReason),
    SessionInit(SessionInit),
    Action(Action),
    AddRemoveObject(AddRemoveObject),
    UpdateObjectMovement(UpdateObjectMovement),
    Command(Command),
    MovePlayer(MovePlayer),
    Text(Text),
    AuthRequest(AuthRequest),
    AuthChallenge(AuthChallenge),
    AuthVerify(AuthVerify),
    AuthVerifyAck(AuthVerifyAck),
}

impl Message {
    pub fn id(&self) -> MessageId {
        match self {
            Message::PingRequest => MessageId::PingRequest,
            Message::PingResponse => MessageId::PingResponse,
            Message::Logout(_) => MessageId::Logout,
            Message::SessionInit(_) => MessageId::SessionInit,
            Message::Action(_) => MessageId::Action,
            Message::AddRemoveObject(_) => MessageId::AddRemoveObject,
            Message::UpdateObjectMovement(_) => MessageId::UpdateObjectMovement,
            Message::Command(_) => MessageId::Command,
            Message::MovePlayer(_) => MessageId::MovePlayer,
            Message::Text(_) => MessageId::Text,
            Message::AuthRequest(_) => MessageId::AuthRequest,
            Message::AuthChallenge(_) => MessageId::AuthChallenge,
            Message::AuthVerify(_) => MessageId::AuthVerify,
            Message::AuthVerifyAck(_) => MessageId::AuthVerifyAck,
        }
    }

    /// Messages that bypass the authentication gate
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Message::PingRequest | Message::PingResponse | Message::Logout(_)
        )
    }

    /// Serializes the payload (without frame header)
    pub fn encode_payload(&self, w: &mut WireWriter) -> Result<()> {
        match self {
            Message::PingRequest => w.write_u8(PING_REQUEST_MAGIC),
            Message::PingResponse => w.write_u8(PING_RESPONSE_MAGIC),
            Message::Logout(reason) => w.write_u8(*reason as u8),
            Message::SessionInit(m) => {
                w.write_identifier(&m.player);
                w.write_string(&m.name, MAX_NAME_LEN)?;
                m.movement.write(w)?;
            }
            Message::Action(m) => write_verb(w, &m.actor, &m.verb, m.target.as_ref())?,
            Message::Command(m) => write_verb(w, &m.actor, &m.verb, m.target.as_ref())?,
            Message::AddRemoveObject(m) => {
                write_count(w, m.added.len())?;
                for object in &m.added {
                    w.write_identifier(&object.id);
                    w.write_string(&object.name, MAX_NAME_LEN)?;
                    object.movement.write(w)?;
                }
                write_count(w, m.removed.len())?;
                for id in &m.removed {
                    w.write_identifier(id);
                }
            }
            Message::UpdateObjectMovement(m) => {
                w.write_identifier(&m.object);
                m.movement.write(w)?;
            }
            Message::MovePlayer(m) => m.movement.write(w)?,
            Message::Text(m) => {
                w.write_u8(m.kind as u8);
                w.write_string(&m.text, MAX_TEXT_LEN)?;
                match (m.kind, m.recipient.as_deref()) {
                    (TextKind::Whisper, Some(recipient)) if !recipient.is_empty() => {
                        w.write_string(recipient, MAX_RECIPIENT_LEN)?;
                    }
                    (TextKind::Whisper, _) => {
                        return Err(ProtocolError::InvalidValue(
                            "whisper requires a recipient".to_string(),
                        ));
                    }
                    (_, Some(_)) => {
                        return Err(ProtocolError::InvalidValue(format!(
                            "{:?} text cannot carry a recipient",
                            m.kind
                        )));
                    }
                    (_, None) => {}
                }
            }
            Message::AuthRequest(m) => {
                w.write_string(&m.username, MAX_USERNAME_LEN)?;
                w.write_block(&m.a);
            }
            Message::AuthChallenge(m) => {
                if m.salt.is_empty() || m.salt.len() > MAX_SALT_LEN {
                    return Err(ProtocolError::AuthInternalError(format!(
                        "salt length {} outside 1..={MAX_SALT_LEN}",
                        m.salt.len()
                    )));
                }
                w.write_u8(m.salt.len() as u8);
                w.write_block(&m.salt);
                w.write_block(&m.b);
            }
            Message::AuthVerify(m) => w.write_block(&m.hc),
            Message::AuthVerifyAck(m) => w.write_block(&m.hs),
        }
        Ok(())
    }

    /// Serializes into a frame, rejecting payloads over the wire limit
    pub fn to_frame(&self) -> Result<RawFrame> {
        let mut w = WireWriter::new();
        self.encode_payload(&mut w)?;
        if w.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::OversizedPayload(w.len()));
        }
        RawFrame::new(self.id().as_u16(), w.into_inner().freeze())
    }

    /// Decodes a frame into a message
    ///
    /// # Errors
    /// - `UnknownMessage` for ids outside the table (including the reserved
    ///   `ConnectionInit`)
    /// - `ProtocolDesync` if the decoder leaves payload bytes unread
    /// - codec errors from the individual fields
    pub fn decode(frame: &RawFrame) -> Result<Self> {
        let id = match MessageId::from_u16(frame.id) {
            Some(MessageId::ConnectionInit) | None => {
                return Err(ProtocolError::UnknownMessage(frame.id))
            }
            Some(id) => id,
        };

        let mut r = WireReader::new(&frame.payload);
        let message = Self::decode_payload(id, &mut r)?;
        if r.remaining() != 0 {
            return Err(ProtocolError::ProtocolDesync(format!(
                "{}: 0x{:04x} left {} of {} bytes",
                constants::ERR_TRAILING_PAYLOAD,
                frame.id,
                r.remaining(),
                frame.payload.len()
            )));
        }
        Ok(message)
    }

    fn decode_payload(id: MessageId, r: &mut WireReader<'_>) -> Result<Self> {
        Ok(match id {
            MessageId::PingRequest => {
                expect_magic(r.read_u8()?, PING_REQUEST_MAGIC, "ping request")?;
                Message::PingRequest
            }
            MessageId::PingResponse => {
                expect_magic(r.read_u8()?, PING_RESPONSE_MAGIC, "ping response")?;
                Message::PingResponse
            }
            MessageId::Logout => Message::Logout(LogoutReason::from_u8(r.read_u8()?)?),
            MessageId::SessionInit => Message::SessionInit(SessionInit {
                player: r.read_identifier()?,
                name: r.read_string(MAX_NAME_LEN)?,
                movement: MovementInfo::read(r)?,
            }),
            MessageId::Action => {
                let (actor, verb, target) = read_verb(r)?;
                Message::Action(Action { actor, verb, target })
            }
            MessageId::Command => {
                let (actor, verb, target) = read_verb(r)?;
                Message::Command(Command { actor, verb, target })
            }
            MessageId::AddRemoveObject => {
                let added_count = usize::from(r.read_u16()?);
                let mut added = Vec::with_capacity(added_count.min(r.remaining()));
                for _ in 0..added_count {
                    added.push(ObjectInfo {
                        id: r.read_identifier()?,
                        name: r.read_string(MAX_NAME_LEN)?,
                        movement: MovementInfo::read(r)?,
                    });
                }
                let removed_count = usize::from(r.read_u16()?);
                let mut removed = Vec::with_capacity(removed_count.min(r.remaining()));
                for _ in 0..removed_count {
                    removed.push(r.read_identifier()?);
                }
                Message::AddRemoveObject(AddRemoveObject { added, removed })
            }
            MessageId::UpdateObjectMovement => {
                Message::UpdateObjectMovement(UpdateObjectMovement {
                    object: r.read_identifier()?,
                    movement: MovementInfo::read(r)?,
                })
            }
            MessageId::MovePlayer => Message::MovePlayer(MovePlayer {
                movement: MovementInfo::read(r)?,
            }),
            MessageId::Text => {
                let kind = TextKind::from_u8(r.read_u8()?)?;
                let text = r.read_string(MAX_TEXT_LEN)?;
                let recipient = if kind == TextKind::Whisper {
                    let recipient = r.read_string(MAX_RECIPIENT_LEN)?;
                    if recipient.is_empty() {
                        return Err(ProtocolError::InvalidValue(
                            "whisper requires a recipient".to_string(),
                        ));
                    }
                    Some(recipient)
                } else {
                    None
                };
                Message::Text(Text {
                    kind,
                    text,
                    recipient,
                })
            }
            MessageId::AuthRequest => Message::AuthRequest(AuthRequest {
                username: r.read_string(MAX_USERNAME_LEN)?,
                a: r.read_array::<AUTH_PUBLIC_LEN>()?,
            }),
            MessageId::AuthChallenge => {
                let salt_len = usize::from(r.read_u8()?);
                if salt_len == 0 || salt_len > MAX_SALT_LEN {
                    return Err(ProtocolError::AuthInternalError(format!(
                        "salt length {salt_len} outside 1..={MAX_SALT_LEN}"
                    )));
                }
                Message::AuthChallenge(AuthChallenge {
                    salt: r.read_block(salt_len)?,
                    b: r.read_array::<AUTH_PUBLIC_LEN>()?,
                })
            }
            MessageId::AuthVerify => Message::AuthVerify(AuthVerify {
                hc: r.read_array::<AUTH_PROOF_LEN>()?,
            }),
            MessageId::AuthVerifyAck => Message::AuthVerifyAck(AuthVerifyAck {
                hs: r.read_array::<AUTH_PROOF_LEN>()?,
            }),
            MessageId::ConnectionInit => return Err(ProtocolError::UnknownMessage(id.as_u16())),
        })
    }
}

fn expect_magic(value: u8, expected: u8, what: &str) -> Result<()> {
    if value != expected {
        return Err(ProtocolError::InvalidValue(format!(
            "{what} byte must be {expected}, got {value}"
        )));
    }
    Ok(())
}

fn write_count(w: &mut WireWriter, count: usize) -> Result<()> {
    let count = u16::try_from(count).map_err(|_| ProtocolError::OversizedPayload(count))?;
    w.write_u16(count);
    Ok(())
}

// actor, verb, then a presence byte for the optional target
fn write_verb(
    w: &mut WireWriter,
    actor: &Identifier,
    verb: &str,
    target: Option<&Identifier>,
) -> Result<()> {
    w.write_identifier(actor);
    w.write_string(verb, MAX_VERB_LEN)?;
    match target {
        Some(target) => {
            w.write_u8(1);
            w.write_identifier(target);
        }
        None => w.write_u8(0),
    }
    Ok(())
}

fn read_verb(r: &mut WireReader<'_>) -> Result<(Identifier, String, Option<Identifier>)> {
    let actor = r.read_identifier()?;
    let verb = r.read_string(MAX_VERB_LEN)?;
    let target = match r.read_u8()? {
        0 => None,
        1 => Some(r.read_identifier()?),
        other => {
            return Err(ProtocolError::InvalidValue(format!(
                "target flag must be 0 or 1, got {other}"
            )))
        }
    };
    Ok((actor, verb, target))
}

impl TryFrom<&RawFrame> for Message {
    type Error = ProtocolError;

    fn try_from(frame: &RawFrame) -> Result<Self> {
        Message::decode(frame)
    }
}
