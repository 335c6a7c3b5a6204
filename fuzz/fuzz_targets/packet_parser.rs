#![no_main]

use libfuzzer_sys::fuzz_target;

use tether_wire::{Packet, RequestBody, ResponseBody};

fuzz_target!(|data: &[u8]| {
    if let Ok(packet) = Packet::from_bytes(data) {
        // Anything accepted must serialize back and parse to the same packet
        let bytes = packet.to_bytes().expect("parsed packet serializes");
        let again = Packet::from_bytes(&bytes).expect("serialized packet parses");
        assert_eq!(packet, again);
    }

    let _ = RequestBody::from_bytes(data);
    let _ = ResponseBody::from_bytes(data);
});
