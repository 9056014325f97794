#![no_main]

use libfuzzer_sys::fuzz_target;
use mog_session::core::RawFrame;
use mog_session::protocol::message::Message;

fuzz_target!(|data: &[u8]| {
    // Anything that decodes must re-encode to the same frame
    let Ok((frame, _)) = RawFrame::from_bytes(data) else {
        return;
    };
    if let Ok(message) = Message::decode(&frame) {
        let again = message.to_frame().expect("decoded message re-encodes");
        assert_eq!(again.id, frame.id);
        assert_eq!(Message::decode(&again).ok(), Some(message));
    }
});
