#![no_main]

use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use mog_session::core::RawFrame;
use mog_session::protocol::auth::{ServerAuth, StaticCredentials};
use mog_session::protocol::handshake::{AuthGate, AuthModule};
use mog_session::protocol::message::Message;

fuzz_target!(|data: &[u8]| {
    // Arbitrary frames thrown at a server gate must fail cleanly, never panic
    let credentials = Arc::new(StaticCredentials::new().with_account("alice", "wonderland"));
    let module: Box<dyn AuthModule> = Box::new(ServerAuth::new(credentials));
    let mut gate = AuthGate::new(Some(module));
    let mut out = Vec::new();

    let mut rest = data;
    while let Ok((frame, used)) = RawFrame::from_bytes(rest) {
        rest = &rest[used..];
        let Ok(message) = Message::decode(&frame) else {
            return;
        };
        if gate.route(message, &mut out).is_err() {
            return;
        }
    }
});
