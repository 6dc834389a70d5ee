#![no_main]

use framelink::protocol::Discard;
use framelink::{new_protocol, ProtocolKind};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Some((&selector, frame)) = data.split_first() else {
        return;
    };
    let kind = match selector % 3 {
        0 => ProtocolKind::LengthField,
        1 => ProtocolKind::Json,
        _ => ProtocolKind::Binary,
    };
    let protocol = new_protocol(kind, 64 * 1024);

    match protocol.unpack(frame) {
        Ok((message, consumed)) => {
            assert!(consumed > 0 && consumed <= frame.len());
            // re-encoding a decoded message must not panic
            let _ = protocol.pack(&message);
        }
        Err(e) if e.is_short_read() => assert_eq!(e.discard, Discard::None),
        Err(e) => assert_ne!(e.discard, Discard::None),
    }
});
