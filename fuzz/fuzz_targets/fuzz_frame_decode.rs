#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use mog_session::core::codec::FrameCodec;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Feed the stream in two pieces, as a socket might
    let split = data.first().map(|&b| usize::from(b)).unwrap_or(0).min(data.len());
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from(&data[..split]);

    loop {
        match codec.decode(&mut buf) {
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(_) => return,
        }
    }

    buf.extend_from_slice(&data[split..]);
    while let Ok(Some(_)) = codec.decode(&mut buf) {}
    let _ = codec.decode_eof(&mut buf);
});
