//! Reference authentication strategy
//!
//! Salted password-verifier challenge/response over the four-message
//! exchange, built from SHA-256:
//!
//! ```text
//! verifier = H(salt || username || ":" || password)
//! shared   = H(A || B || verifier)
//! Hc       = H("client" || shared || salt)[..20]
//! Hs       = H("server" || shared || Hc)[..20]
//! K        = H("session" || shared)
//! ```
//!
//! `A` and `B` are 128 random bytes from the OS. Both sides derive `K`
//! and, unless disabled, wrap it in a ChaCha20 stream filter with one nonce
//! per direction.
//!
//! The password never crosses the wire, but the server must know it (or a
//! per-salt verifier) in plain form. Deployments that need a zero-knowledge
//! scheme plug in their own [`AuthModule`].

use std::collections::HashMap;
use std::sync::Arc;

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::{ChaCha20, Key, Nonce};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::handshake::{AuthModule, AuthModuleFactory, EncryptModule};
use crate::protocol::message::{
    AuthChallenge, AuthRequest, AuthVerify, AuthVerifyAck, Message, AUTH_PROOF_LEN,
    AUTH_PUBLIC_LEN, MAX_USERNAME_LEN,
};

/// Salt length used by [`ServerAuth`]
pub const SALT_LEN: usize = 16;

const NONCE_CLIENT_TO_SERVER: [u8; 12] = *b"mog-c2s\0\0\0\0\0";
const NONCE_SERVER_TO_CLIENT: [u8; 12] = *b"mog-s2c\0\0\0\0\0";

/// Attempts at drawing a non-zero salt before giving up
const SALT_ATTEMPTS: usize = 4;

type SessionKey = Zeroizing<[u8; 32]>;

/// Account lookup used by the server side
pub trait CredentialStore: Send + Sync {
    fn password(&self, username: &str) -> Option<String>;
}

/// Fixed in-memory account table
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    accounts: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_account(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.insert(username, password);
        self
    }

    pub fn insert(&mut self, username: impl Into<String>, password: impl Into<String>) {
        self.accounts.insert(username.into(), password.into());
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

impl CredentialStore for StaticCredentials {
    fn password(&self, username: &str) -> Option<String> {
        self.accounts.get(username).cloned()
    }
}

fn hash(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut out = [0u8; N];
    getrandom::fill(&mut out)
        .map_err(|e| ProtocolError::AuthInternalError(format!("{}: {e}", constants::ERR_RANDOM_SOURCE)))?;
    Ok(out)
}

fn generate_salt() -> Result<[u8; SALT_LEN]> {
    for _ in 0..SALT_ATTEMPTS {
        let salt = random_bytes::<SALT_LEN>()?;
        if salt.iter().any(|&b| b != 0) {
            return Ok(salt);
        }
    }
    Err(ProtocolError::AuthInternalError(
        constants::ERR_SALT_GENERATION.to_string(),
    ))
}

fn proof_eq(a: &[u8; AUTH_PROOF_LEN], b: &[u8; AUTH_PROOF_LEN]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn truncate_proof(digest: [u8; 32]) -> [u8; AUTH_PROOF_LEN] {
    let mut proof = [0u8; AUTH_PROOF_LEN];
    proof.copy_from_slice(&digest[..AUTH_PROOF_LEN]);
    proof
}

/// Values both sides derive once `A`, `B` and the verifier are known
struct Derived {
    hc: [u8; AUTH_PROOF_LEN],
    hs: [u8; AUTH_PROOF_LEN],
    key: SessionKey,
}

fn derive(
    username: &str,
    password: &str,
    salt: &[u8],
    a: &[u8; AUTH_PUBLIC_LEN],
    b: &[u8; AUTH_PUBLIC_LEN],
) -> Derived {
    let verifier = Zeroizing::new(hash(&[salt, username.as_bytes(), b":".as_slice(), password.as_bytes()]));
    let shared = Zeroizing::new(hash(&[a.as_slice(), b.as_slice(), verifier.as_slice()]));
    let hc = truncate_proof(hash(&[b"client".as_slice(), shared.as_slice(), salt]));
    let hs = truncate_proof(hash(&[b"server".as_slice(), shared.as_slice(), hc.as_slice()]));
    let key = Zeroizing::new(hash(&[b"session".as_slice(), shared.as_slice()]));
    Derived { hc, hs, key }
}

/// ChaCha20 keystream filter, one cipher state per direction
pub struct ChaCha20Stream {
    outbound: ChaCha20,
    inbound: ChaCha20,
}

impl ChaCha20Stream {
    fn new(key: &[u8; 32], outbound_nonce: &[u8; 12], inbound_nonce: &[u8; 12]) -> Self {
        let key = Key::from_slice(key);
        Self {
            outbound: ChaCha20::new(key, Nonce::from_slice(outbound_nonce)),
            inbound: ChaCha20::new(key, Nonce::from_slice(inbound_nonce)),
        }
    }

    pub fn for_client(key: &[u8; 32]) -> Self {
        Self::new(key, &NONCE_CLIENT_TO_SERVER, &NONCE_SERVER_TO_CLIENT)
    }

    pub fn for_server(key: &[u8; 32]) -> Self {
        Self::new(key, &NONCE_SERVER_TO_CLIENT, &NONCE_CLIENT_TO_SERVER)
    }
}

impl EncryptModule for ChaCha20Stream {
    fn encrypt_write(&mut self, data: &mut [u8]) -> Result<()> {
        self.outbound
            .try_apply_keystream(data)
            .map_err(|e| ProtocolError::Internal(format!("keystream exhausted: {e}")))
    }

    fn decrypt_read(&mut self, data: &mut [u8]) -> Result<()> {
        self.inbound
            .try_apply_keystream(data)
            .map_err(|e| ProtocolError::Internal(format!("keystream exhausted: {e}")))
    }
}

enum ClientStep {
    Idle,
    AwaitChallenge { a: [u8; AUTH_PUBLIC_LEN] },
    AwaitAck { hs: [u8; AUTH_PROOF_LEN], key: SessionKey },
    Done { key: Option<SessionKey> },
}

/// Client half of the reference handshake
pub struct ClientAuth {
    username: String,
    password: Zeroizing<String>,
    encrypt: bool,
    step: ClientStep,
}

impl ClientAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Zeroizing::new(password.into()),
            encrypt: true,
            step: ClientStep::Idle,
        }
    }

    /// Completes the handshake without installing a filter
    pub fn without_encryption(mut self) -> Self {
        self.encrypt = false;
        self
    }

    /// Factory producing a module per connection
    pub fn factory(username: impl Into<String>, password: impl Into<String>) -> AuthModuleFactory {
        let username = username.into();
        let password = Zeroizing::new(password.into());
        Arc::new(move || Box::new(ClientAuth::new(username.clone(), password.as_str())) as Box<dyn AuthModule>)
    }

    fn on_challenge(&mut self, challenge: &AuthChallenge, out: &mut Vec<Message>) -> Result<()> {
        let ClientStep::AwaitChallenge { a } = &self.step else {
            return Err(out_of_order("AuthChallenge"));
        };
        let derived = derive(&self.username, &self.password, &challenge.salt, a, &challenge.b);
        out.push(Message::AuthVerify(AuthVerify { hc: derived.hc }));
        self.step = ClientStep::AwaitAck {
            hs: derived.hs,
            key: derived.key,
        };
        Ok(())
    }

    fn on_ack(&mut self, ack: &AuthVerifyAck) -> Result<()> {
        let ClientStep::AwaitAck { hs, key } = &self.step else {
            return Err(out_of_order("AuthVerifyAck"));
        };
        if !proof_eq(hs, &ack.hs) {
            warn!("server proof mismatch");
            return Err(ProtocolError::AuthRejected(
                constants::ERR_SERVER_PROOF.to_string(),
            ));
        }
        self.step = ClientStep::Done {
            key: Some(key.clone()),
        };
        debug!(username = %self.username, "client authenticated");
        Ok(())
    }
}

impl AuthModule for ClientAuth {
    fn init_authentication(&mut self, out: &mut Vec<Message>) -> Result<()> {
        if !matches!(self.step, ClientStep::Idle) {
            return Err(out_of_order("init"));
        }
        if self.username.len() >= MAX_USERNAME_LEN {
            return Err(ProtocolError::LengthExceeded {
                declared: self.username.len(),
                max: MAX_USERNAME_LEN,
            });
        }
        let a = random_bytes::<AUTH_PUBLIC_LEN>()?;
        out.push(Message::AuthRequest(AuthRequest {
            username: self.username.clone(),
            a,
        }));
        self.step = ClientStep::AwaitChallenge { a };
        Ok(())
    }

    fn is_authenticated(&self) -> bool {
        matches!(self.step, ClientStep::Done { .. })
    }

    fn on_receive_message(&mut self, message: &Message, out: &mut Vec<Message>) -> Result<bool> {
        if self.is_authenticated() && message.id().is_auth() {
            return Err(ProtocolError::AuthInternalError(
                constants::ERR_ALREADY_AUTHENTICATED.to_string(),
            ));
        }
        match message {
            Message::AuthChallenge(challenge) => self.on_challenge(challenge, out)?,
            Message::AuthVerifyAck(ack) => self.on_ack(ack)?,
            Message::AuthRequest(_) | Message::AuthVerify(_) => {
                return Err(out_of_order("server-bound auth message"))
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn encrypt_module(&mut self) -> Option<Box<dyn EncryptModule>> {
        let ClientStep::Done { key } = &mut self.step else {
            return None;
        };
        let key = key.take()?;
        self.encrypt
            .then(|| Box::new(ChaCha20Stream::for_client(&key)) as Box<dyn EncryptModule>)
    }
}

enum ServerStep {
    AwaitRequest,
    AwaitVerify {
        username: String,
        hc: [u8; AUTH_PROOF_LEN],
        hs: [u8; AUTH_PROOF_LEN],
        key: SessionKey,
    },
    Done {
        key: Option<SessionKey>,
    },
}

/// Server half of the reference handshake
pub struct ServerAuth {
    credentials: Arc<dyn CredentialStore>,
    encrypt: bool,
    step: ServerStep,
}

impl ServerAuth {
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            credentials,
            encrypt: true,
            step: ServerStep::AwaitRequest,
        }
    }

    pub fn without_encryption(mut self) -> Self {
        self.encrypt = false;
        self
    }

    pub fn factory(credentials: Arc<dyn CredentialStore>) -> AuthModuleFactory {
        Arc::new(move || Box::new(ServerAuth::new(Arc::clone(&credentials))) as Box<dyn AuthModule>)
    }

    fn on_request(&mut self, request: &AuthRequest, out: &mut Vec<Message>) -> Result<()> {
        if !matches!(self.step, ServerStep::AwaitRequest) {
            return Err(out_of_order("AuthRequest"));
        }

        let Some(password) = self.credentials.password(&request.username) else {
            warn!(username = %request.username, "unknown user");
            return Err(ProtocolError::AuthRejected(
                constants::ERR_UNKNOWN_USER.to_string(),
            ));
        };
        let password = Zeroizing::new(password);

        let salt = generate_salt()?;
        let b = random_bytes::<AUTH_PUBLIC_LEN>()?;
        let derived = derive(&request.username, &password, &salt, &request.a, &b);

        out.push(Message::AuthChallenge(AuthChallenge {
            salt: salt.to_vec(),
            b,
        }));
        self.step = ServerStep::AwaitVerify {
            username: request.username.clone(),
            hc: derived.hc,
            hs: derived.hs,
            key: derived.key,
        };
        Ok(())
    }

    fn on_verify(&mut self, verify: &AuthVerify, out: &mut Vec<Message>) -> Result<()> {
        let ServerStep::AwaitVerify {
            username,
            hc,
            hs,
            key,
        } = &self.step
        else {
            return Err(out_of_order("AuthVerify"));
        };
        if !proof_eq(hc, &verify.hc) {
            warn!(username = %username, "client proof mismatch");
            return Err(ProtocolError::AuthRejected(
                constants::ERR_CLIENT_PROOF.to_string(),
            ));
        }
        out.push(Message::AuthVerifyAck(AuthVerifyAck { hs: *hs }));
        debug!(username = %username, "server authenticated client");
        self.step = ServerStep::Done {
            key: Some(key.clone()),
        };
        Ok(())
    }
}

impl AuthModule for ServerAuth {
    fn init_authentication(&mut self, _out: &mut Vec<Message>) -> Result<()> {
        Ok(())
    }

    fn is_authenticated(&self) -> bool {
        matches!(self.step, ServerStep::Done { .. })
    }

    fn on_receive_message(&mut self, message: &Message, out: &mut Vec<Message>) -> Result<bool> {
        if self.is_authenticated() && message.id().is_auth() {
            return Err(ProtocolError::AuthInternalError(
                constants::ERR_ALREADY_AUTHENTICATED.to_string(),
            ));
        }
        match message {
            Message::AuthRequest(request) => self.on_request(request, out)?,
            Message::AuthVerify(verify) => self.on_verify(verify, out)?,
            Message::AuthChallenge(_) | Message::AuthVerifyAck(_) => {
                return Err(out_of_order("client-bound auth message"))
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn encrypt_module(&mut self) -> Option<Box<dyn EncryptModule>> {
        let ServerStep::Done { key } = &mut self.step else {
            return None;
        };
        let key = key.take()?;
        self.encrypt
            .then(|| Box::new(ChaCha20Stream::for_server(&key)) as Box<dyn EncryptModule>)
    }
}

fn out_of_order(what: &str) -> ProtocolError {
    ProtocolError::AuthInternalError(format!(
        "{}: {what}",
        constants::ERR_UNEXPECTED_AUTH_MESSAGE
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::protocol::handshake::exercise_handshake;
    use crate::protocol::message::LogoutReason;

    fn store() -> Arc<dyn CredentialStore> {
        Arc::new(StaticCredentials::new().with_account("alice", "wonderland"))
    }

    #[test]
    fn full_handshake_with_encryption() {
        exercise_handshake(
            Box::new(ClientAuth::new("alice", "wonderland")),
            Box::new(ServerAuth::new(store())),
        )
        .unwrap();
    }

    #[test]
    fn full_handshake_without_encryption() {
        exercise_handshake(
            Box::new(ClientAuth::new("alice", "wonderland").without_encryption()),
            Box::new(ServerAuth::new(store()).without_encryption()),
        )
        .unwrap();
    }

    #[test]
    fn one_sided_encryption_is_a_violation() {
        let err = exercise_handshake(
            Box::new(ClientAuth::new("alice", "wonderland")),
            Box::new(ServerAuth::new(store()).without_encryption()),
        )
        .unwrap_err();
        assert!(matches!(err, ProtocolError::AuthInternalError(_)));
    }

    #[test]
    fn wrong_password_is_rejected_by_server() {
        let err = exercise_handshake(
            Box::new(ClientAuth::new("alice", "looking-glass")),
            Box::new(ServerAuth::new(store())),
        )
        .unwrap_err();
        assert!(matches!(err, ProtocolError::AuthRejected(_)));
    }

    #[test]
    fn unknown_user_is_rejected() {
        let mut server = ServerAuth::new(store());
        let mut out = Vec::new();
        let request = Message::AuthRequest(AuthRequest {
            username: "mallory".into(),
            a: [0u8; AUTH_PUBLIC_LEN],
        });
        assert!(matches!(
            server.on_receive_message(&request, &mut out),
            Err(ProtocolError::AuthRejected(_))
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn challenge_shape() {
        let mut server = ServerAuth::new(store());
        let mut out = Vec::new();
        let request = Message::AuthRequest(AuthRequest {
            username: "alice".into(),
            a: [0u8; AUTH_PUBLIC_LEN],
        });
        assert!(server.on_receive_message(&request, &mut out).unwrap());
        let Some(Message::AuthChallenge(challenge)) = out.pop() else {
            panic!("expected a challenge");
        };
        assert_eq!(challenge.salt.len(), SALT_LEN);
        assert!(challenge.salt.iter().any(|&b| b != 0));
        assert!(!server.is_authenticated());
    }

    #[test]
    fn forged_server_proof_is_rejected_by_client() {
        let mut client = ClientAuth::new("alice", "wonderland");
        let mut out = Vec::new();
        client.init_authentication(&mut out).unwrap();
        let challenge = Message::AuthChallenge(AuthChallenge {
            salt: vec![1u8; SALT_LEN],
            b: [7u8; AUTH_PUBLIC_LEN],
        });
        assert!(client.on_receive_message(&challenge, &mut out).unwrap());
        assert!(matches!(out.last(), Some(Message::AuthVerify(_))));

        let forged = Message::AuthVerifyAck(AuthVerifyAck { hs: [0u8; 20] });
        assert!(matches!(
            client.on_receive_message(&forged, &mut out),
            Err(ProtocolError::AuthRejected(_))
        ));
        assert!(!client.is_authenticated());
    }

    #[test]
    fn steps_out_of_order_fail() {
        let mut client = ClientAuth::new("alice", "wonderland");
        let mut out = Vec::new();
        let ack = Message::AuthVerifyAck(AuthVerifyAck { hs: [0u8; 20] });
        assert!(matches!(
            client.on_receive_message(&ack, &mut out),
            Err(ProtocolError::AuthInternalError(_))
        ));

        let mut server = ServerAuth::new(store());
        let verify = Message::AuthVerify(AuthVerify { hc: [0u8; 20] });
        assert!(matches!(
            server.on_receive_message(&verify, &mut out),
            Err(ProtocolError::AuthInternalError(_))
        ));
    }

    #[test]
    fn non_auth_messages_are_not_handled() {
        let mut server = ServerAuth::new(store());
        let mut out = Vec::new();
        assert!(!server
            .on_receive_message(&Message::Logout(LogoutReason::Other), &mut out)
            .unwrap());
    }

    #[test]
    fn username_over_limit_fails_at_init() {
        let mut client = ClientAuth::new("a".repeat(MAX_USERNAME_LEN), "pw");
        let mut out = Vec::new();
        assert!(matches!(
            client.init_authentication(&mut out),
            Err(ProtocolError::LengthExceeded { .. })
        ));
    }

    #[test]
    fn chacha_directions_pair_up() {
        let key = [3u8; 32];
        let mut client = ChaCha20Stream::for_client(&key);
        let mut server = ChaCha20Stream::for_server(&key);

        let mut data = *b"hello over the wire";
        client.encrypt_write(&mut data).unwrap();
        assert_ne!(&data, b"hello over the wire");
        server.decrypt_read(&mut data).unwrap();
        assert_eq!(&data, b"hello over the wire");

        let mut reply = *b"and back";
        server.encrypt_write(&mut reply).unwrap();
        client.decrypt_read(&mut reply).unwrap();
        assert_eq!(&reply, b"and back");
    }

    #[test]
    fn factories_produce_fresh_modules() {
        let server = ServerAuth::factory(store());
        let client = ClientAuth::factory("alice", "wonderland");
        for _ in 0..2 {
            exercise_handshake(client(), server()).unwrap();
        }
    }
}
