#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use tether_wire::{encode_frame, FrameDecoder};

#[derive(Debug, Arbitrary)]
struct Input {
    /// Raw stream bytes
    stream: Vec<u8>,
    /// Chunk sizes the stream arrives in
    chunks: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let mut decoder = FrameDecoder::new();
    let mut rest = input.stream.as_slice();
    let mut chunks = input.chunks.iter().map(|c| *c as usize + 1).cycle();

    while !rest.is_empty() {
        let take = chunks.next().unwrap_or(rest.len()).min(rest.len());
        decoder.extend(&rest[..take]);
        rest = &rest[take..];

        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => {
                    // Every decoded frame re-encodes to a prefix plus itself
                    let encoded = encode_frame(&frame).expect("decoded frame fits");
                    assert_eq!(&encoded[4..], &frame[..]);
                }
                Ok(None) => break,
                Err(_) => return,
            }
        }
    }
});
