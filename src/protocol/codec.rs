//! `tokio_util::codec` adapter so any framing can drive a `Framed` stream.
//!
//! The connection loops use [`Protocol::unpack`] directly on their own buffer; this
//! adapter is for callers that prefer the `Stream`/`Sink` interface.

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{Discard, Message, Protocol};
use crate::error::EngineError;

#[derive(Debug, Clone)]
pub struct ProtocolCodec {
    protocol: Arc<dyn Protocol>,
}

impl ProtocolCodec {
    pub fn new(protocol: Arc<dyn Protocol>) -> Self {
        Self { protocol }
    }
}

impl Decoder for ProtocolCodec {
    type Item = Message;
    type Error = EngineError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.protocol.unpack(&src[..]) {
            Ok((message, consumed)) => {
                src.advance(consumed);
                Ok(Some(message))
            }
            Err(e) if e.is_short_read() => {
                if let Ok(total) = self.protocol.frame_length(&src[..]) {
                    src.reserve(total.saturating_sub(src.len()));
                }
                Ok(None)
            }
            Err(e) => {
                match e.discard {
                    Discard::None => {}
                    Discard::Bytes(n) => src.advance(n.min(src.len())),
                    Discard::All => src.clear(),
                }
                Err(e.error)
            }
        }
    }
}

impl Encoder<Message> for ProtocolCodec {
    type Error = EngineError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = self.protocol.pack(&item)?;
        dst.extend_from_slice(&frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{new_protocol, FieldMessage, ProtocolKind};

    #[test]
    fn test_decode_waits_for_full_frame() {
        let mut codec = ProtocolCodec::new(new_protocol(ProtocolKind::LengthField, 1024));
        let mut encoded = BytesMut::new();
        let message: Message = FieldMessage::new(2, 9, &b"chunked"[..]).into();
        codec.encode(message.clone(), &mut encoded).unwrap();

        let mut src = BytesMut::from(&encoded[..10]);
        assert!(codec.decode(&mut src).unwrap().is_none());
        assert_eq!(src.len(), 10);

        src.extend_from_slice(&encoded[10..]);
        assert_eq!(codec.decode(&mut src).unwrap(), Some(message));
        assert!(src.is_empty());
    }

    #[test]
    fn test_decode_error_applies_discard() {
        let mut codec = ProtocolCodec::new(new_protocol(ProtocolKind::LengthField, 1024));
        let mut src = BytesMut::from(&[0u8, 0, 0, 2, 7, 7][..]);
        assert!(matches!(codec.decode(&mut src), Err(EngineError::InvalidFormat(_))));
        assert!(src.is_empty());
    }
}
