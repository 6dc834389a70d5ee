//! Framing edge cases across all three protocols

#![allow(clippy::expect_used, clippy::unwrap_used)]

use framelink::protocol::{
    binary, json, length_field, BinaryProtocol, Discard, JsonProtocol, LengthFieldProtocol,
};
use framelink::{
    new_protocol, BinaryMessage, EngineError, FieldMessage, JsonMessage, Message, Protocol,
    ProtocolKind,
};

fn sample(kind: ProtocolKind, sequence: u32, data: &'static [u8]) -> Message {
    match kind {
        ProtocolKind::LengthField => FieldMessage::new(1, sequence, data).into(),
        ProtocolKind::Binary => BinaryMessage::new(1, sequence, data).into(),
        ProtocolKind::Json => {
            let mut map = serde_json::Map::new();
            map.insert(
                "text".into(),
                serde_json::Value::String(String::from_utf8_lossy(data).into_owned()),
            );
            JsonMessage::new(1, sequence, map).into()
        }
    }
}

const KINDS: [ProtocolKind; 3] = [ProtocolKind::LengthField, ProtocolKind::Json, ProtocolKind::Binary];

#[test]
fn test_empty_buffer_is_short_read() {
    for kind in KINDS {
        let protocol = new_protocol(kind, 1024);
        let err = protocol.unpack(&[]).unwrap_err();
        assert!(err.is_short_read(), "{kind}");
        assert_eq!(err.discard, Discard::None);
    }
}

#[test]
fn test_empty_payloads_roundtrip() {
    for kind in KINDS {
        let protocol = new_protocol(kind, 1024);
        let msg = match kind {
            ProtocolKind::Json => JsonMessage::new(0, 0, serde_json::Map::new()).into(),
            _ => sample(kind, 0, b""),
        };
        let frame = protocol.pack(&msg).unwrap();
        let (decoded, used) = protocol.unpack(&frame).unwrap();
        assert_eq!(decoded, msg, "{kind}");
        assert_eq!(used, frame.len());
    }
    assert_eq!(
        LengthFieldProtocol::new(1024)
            .pack(&sample(ProtocolKind::LengthField, 0, b""))
            .unwrap()
            .len(),
        length_field::HEADER_SIZE
    );
    assert_eq!(
        BinaryProtocol::new(1024)
            .pack(&sample(ProtocolKind::Binary, 0, b""))
            .unwrap()
            .len(),
        binary::HEADER_SIZE + binary::FOOTER_SIZE
    );
}

#[test]
fn test_back_to_back_frames_consume_exactly_one() {
    for kind in KINDS {
        let protocol = new_protocol(kind, 4096);
        let first = protocol.pack(&sample(kind, 1, b"first")).unwrap();
        let second = protocol.pack(&sample(kind, 2, b"second")).unwrap();
        let mut wire = first.to_vec();
        wire.extend_from_slice(&second);

        let (msg, used) = protocol.unpack(&wire).unwrap();
        assert_eq!(msg.sequence(), 1);
        assert_eq!(used, first.len());
        let (msg, used) = protocol.unpack(&wire[used..]).unwrap();
        assert_eq!(msg.sequence(), 2);
        assert_eq!(used, second.len());
    }
}

#[test]
fn test_frame_exactly_at_limit() {
    let max = 64;
    let protocol = LengthFieldProtocol::new(max);
    let at_limit: Message = FieldMessage::new(1, 1, vec![7u8; max - length_field::HEADER_SIZE]).into();
    let frame = protocol.pack(&at_limit).unwrap();
    assert_eq!(frame.len(), max);
    assert_eq!(protocol.unpack(&frame).unwrap().0, at_limit);

    let over: Message = FieldMessage::new(1, 1, vec![7u8; max - length_field::HEADER_SIZE + 1]).into();
    assert!(matches!(
        protocol.pack(&over),
        Err(EngineError::MessageTooLarge { size: 65, max: 64 })
    ));
}

#[test]
fn test_oversized_frame_fully_buffered_is_skipped_exactly() {
    let big = LengthFieldProtocol::new(1024);
    let small = LengthFieldProtocol::new(64);
    let oversized = big.pack(&FieldMessage::new(1, 1, vec![0u8; 100]).into()).unwrap();
    let next = small.pack(&FieldMessage::new(1, 2, &b"ok"[..]).into()).unwrap();
    let mut wire = oversized.to_vec();
    wire.extend_from_slice(&next);

    let err = small.unpack(&wire).unwrap_err();
    assert!(matches!(err.error, EngineError::MessageTooLarge { size: 116, max: 64 }));
    assert_eq!(err.discard, Discard::Bytes(oversized.len()));
    let (msg, _) = small.unpack(&wire[oversized.len()..]).unwrap();
    assert_eq!(msg.sequence(), 2);
}

#[test]
fn test_json_oversized_body_and_garbage() {
    let protocol = JsonProtocol::new(64);
    let mut header = 1000u32.to_be_bytes().to_vec();
    header.extend_from_slice(b"{\"type\"");
    let err = protocol.unpack(&header).unwrap_err();
    assert!(matches!(err.error, EngineError::MessageTooLarge { size: 1000, max: 64 }));
    assert_eq!(err.discard, Discard::All);

    let body = br#""just a string""#;
    let mut frame = (body.len() as u32).to_be_bytes().to_vec();
    frame.extend_from_slice(body);
    let err = protocol.unpack(&frame).unwrap_err();
    assert!(matches!(err.error, EngineError::Json(_)));
    assert_eq!(err.discard, Discard::Bytes(json::PREFIX_SIZE + body.len()));
}

#[test]
fn test_json_missing_optional_fields() {
    let protocol = JsonProtocol::new(1024);
    let body = br#"{"type":3,"sequence":4}"#;
    let mut frame = (body.len() as u32).to_be_bytes().to_vec();
    frame.extend_from_slice(body);
    let (msg, _) = protocol.unpack(&frame).unwrap();
    assert_eq!(msg, Message::from(JsonMessage::new(3, 4, serde_json::Map::new())));
}

#[test]
fn test_binary_header_corruption_fails_checksum() {
    let protocol = BinaryProtocol::new(1024);
    let frame = protocol.pack(&sample(ProtocolKind::Binary, 1, b"abc")).unwrap();
    let mut corrupt = frame.to_vec();
    corrupt[2] ^= 0x10;
    let err = protocol.unpack(&corrupt).unwrap_err();
    assert!(matches!(err.error, EngineError::Checksum { .. }));
    assert_eq!(err.discard, Discard::Bytes(frame.len()));
}

#[test]
fn test_binary_magic_checked_before_checksum() {
    let protocol = BinaryProtocol::new(1024);
    let frame = protocol.pack(&sample(ProtocolKind::Binary, 1, b"abc")).unwrap();
    let mut corrupt = frame.to_vec();
    corrupt[binary::HEADER_SIZE] ^= 0xFF;
    let n = corrupt.len();
    corrupt[n - 1] = 0x00;
    let err = protocol.unpack(&corrupt).unwrap_err();
    assert!(matches!(err.error, EngineError::InvalidMagic(0xCA00)));
}

#[test]
fn test_wrong_variant_is_rejected_by_every_framing() {
    let field = sample(ProtocolKind::LengthField, 1, b"x");
    let json = sample(ProtocolKind::Json, 1, b"x");
    let binary = sample(ProtocolKind::Binary, 1, b"x");
    let cases: [(ProtocolKind, &Message); 3] = [
        (ProtocolKind::LengthField, &json),
        (ProtocolKind::Json, &binary),
        (ProtocolKind::Binary, &field),
    ];
    for (kind, message) in cases {
        let err = new_protocol(kind, 1024).pack(message).unwrap_err();
        assert!(matches!(err, EngineError::InvalidMessage(_)), "{kind}");
    }
}

#[test]
fn test_frame_length_matches_consumed() {
    for kind in KINDS {
        let protocol = new_protocol(kind, 4096);
        let frame = protocol.pack(&sample(kind, 5, b"length")).unwrap();
        assert_eq!(protocol.frame_length(&frame).unwrap(), frame.len(), "{kind}");
        assert_eq!(protocol.max_message_size(), 4096);
        assert_eq!(protocol.kind(), kind);
    }
}
