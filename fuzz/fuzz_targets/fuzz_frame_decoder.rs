#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use peer_transport::core::codec::FrameCodec;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Arbitrary peer bytes must never panic the decoder, whatever the chunking.
    let split = data.first().map_or(1, |b| (*b as usize).max(1));
    let mut codec = FrameCodec::default();
    let mut buf = BytesMut::new();

    for piece in data.chunks(split) {
        buf.extend_from_slice(piece);
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(frame)) => assert!(!frame.is_empty() && frame.len() <= codec.max_frame_size()),
                Ok(None) => break,
                Err(_) => return,
            }
        }
    }
});
