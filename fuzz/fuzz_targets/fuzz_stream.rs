#![no_main]

use bytes::BytesMut;
use framelink::protocol::ProtocolCodec;
use framelink::{new_protocol, ProtocolKind};
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

// Feed arbitrary bytes through the codec the way a socket would and make sure
// decoding always terminates.
fuzz_target!(|data: &[u8]| {
    let mut codec = ProtocolCodec::new(new_protocol(ProtocolKind::Binary, 4096));
    let mut buf = BytesMut::new();
    for chunk in data.chunks(97) {
        buf.extend_from_slice(chunk);
        loop {
            let before = buf.len();
            match codec.decode(&mut buf) {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => assert!(buf.len() < before),
            }
        }
    }
});
