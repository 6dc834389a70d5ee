//! JSON framing: a 4-byte big-endian body length followed by a JSON object.
//!
//! The length prefix is authoritative; the body is `{"type","sequence","data","timestamp"}`.

use bytes::{BufMut, Bytes, BytesMut};

use super::{read_u32, Discard, Message, Protocol, ProtocolKind, UnpackError, UnpackResult};
use crate::error::{constants, EngineError, Result};
use crate::protocol::message::JsonMessage;

/// Length prefix size
pub const PREFIX_SIZE: usize = 4;

#[derive(Debug, Clone)]
pub struct JsonProtocol {
    max_message_size: usize,
}

impl JsonProtocol {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }
}

impl Protocol for JsonProtocol {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Json
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// The limit applies to the body, so the prefix rides on top.
    fn max_frame_len(&self) -> usize {
        self.max_message_size.saturating_add(PREFIX_SIZE)
    }

    fn pack(&self, message: &Message) -> Result<Bytes> {
        let Message::Json(msg) = message else {
            return Err(EngineError::InvalidMessage(constants::ERR_WRONG_VARIANT_JSON));
        };

        let body = serde_json::to_vec(msg)?;
        if body.len() > self.max_message_size || body.len() > u32::MAX as usize {
            return Err(EngineError::MessageTooLarge {
                size: body.len(),
                max: self.max_message_size,
            });
        }

        let mut frame = BytesMut::with_capacity(PREFIX_SIZE + body.len());
        frame.put_u32(body.len() as u32);
        frame.put_slice(&body);
        Ok(frame.freeze())
    }

    fn frame_length(&self, buf: &[u8]) -> std::result::Result<usize, UnpackError> {
        if buf.len() < PREFIX_SIZE {
            return Err(UnpackError::short_read());
        }
        let body_len = read_u32(buf, 0) as usize;
        let total = PREFIX_SIZE + body_len;
        if body_len > self.max_message_size {
            return Err(UnpackError::too_large(
                body_len,
                self.max_message_size,
                total,
                buf.len(),
            ));
        }
        Ok(total)
    }

    fn unpack(&self, buf: &[u8]) -> UnpackResult {
        let total = self.frame_length(buf)?;
        if buf.len() < total {
            return Err(UnpackError::short_read());
        }

        match serde_json::from_slice::<JsonMessage>(&buf[PREFIX_SIZE..total]) {
            Ok(msg) => Ok((Message::Json(msg), total)),
            Err(e) => Err(UnpackError::new(EngineError::Json(e), Discard::Bytes(total))),
        }
    }
}
