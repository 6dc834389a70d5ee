use framelink::core::MessageBuffer;
use framelink::protocol::ProtocolCodec;
use framelink::{new_protocol, BinaryMessage, FieldMessage, Message, ProtocolKind};

#[test]
fn stress_accumulated_stream_decodes_large_series() {
    // one long stream of mixed sizes, fed in odd-sized slices
    for kind in [ProtocolKind::LengthField, ProtocolKind::Binary] {
        let protocol = new_protocol(kind, 2 * 1024 * 1024);
        let mut wire = Vec::new();
        let sizes = [0usize, 1, 64, 512, 4096, 65536, 1_048_576];
        let mut expected = 0u32;
        for (i, size) in sizes.iter().cycle().take(700).enumerate() {
            let seq = i as u32;
            let msg: Message = match kind {
                ProtocolKind::Binary => BinaryMessage::new(1, seq, vec![0u8; *size % 70_000]).into(),
                _ => FieldMessage::new(1, seq, vec![0u8; *size % 70_000]).into(),
            };
            wire.extend_from_slice(&protocol.pack(&msg).unwrap());
            expected += 1;
        }

        let mut buffer = MessageBuffer::new();
        let mut decoded = 0u32;
        for slice in wire.chunks(7919) {
            buffer.append(slice);
            loop {
                match protocol.unpack(buffer.as_slice()) {
                    Ok((msg, used)) => {
                        assert_eq!(msg.sequence(), decoded);
                        decoded += 1;
                        buffer.consume(used).unwrap();
                    }
                    Err(e) if e.is_short_read() => break,
                    Err(e) => panic!("{kind}: {e}"),
                }
            }
        }
        assert_eq!(decoded, expected, "{kind}");
        assert!(buffer.is_empty());
    }
}

#[test]
fn stress_codec_encode_decode_series() {
    use bytes::BytesMut;
    use tokio_util::codec::{Decoder, Encoder};

    let mut codec = ProtocolCodec::new(new_protocol(ProtocolKind::LengthField, 1 << 20));
    let mut buf = BytesMut::new();
    for size in [0usize, 1, 64, 512, 4096, 65536] {
        for seq in 0..2_000u32 {
            codec
                .encode(Message::from(FieldMessage::new(2, seq, vec![0u8; size])), &mut buf)
                .unwrap();
            let msg = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(msg.sequence(), seq);
            assert!(buf.is_empty());
        }
    }
}
