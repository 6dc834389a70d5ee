//! Length-prefixed framing without checksum.
//!
//! ```text
//! [total_len(4)] [type(4)] [sequence(4)] [data_len(4)] [data(data_len)]
//! ```
//! `total_len` counts the whole frame including itself.

use bytes::{BufMut, Bytes, BytesMut};

use super::{read_u32, Discard, Message, Protocol, ProtocolKind, UnpackError, UnpackResult};
use crate::error::{constants, EngineError, Result};
use crate::protocol::message::FieldMessage;

/// Fixed header size
pub const HEADER_SIZE: usize = 16;

#[derive(Debug, Clone)]
pub struct LengthFieldProtocol {
    max_message_size: usize,
}

impl LengthFieldProtocol {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }
}

impl Protocol for LengthFieldProtocol {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::LengthField
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    fn pack(&self, message: &Message) -> Result<Bytes> {
        let Message::Field(msg) = message else {
            return Err(EngineError::InvalidMessage(constants::ERR_WRONG_VARIANT_FIELD));
        };

        let total = HEADER_SIZE + msg.data.len();
        if total > self.max_message_size || total > u32::MAX as usize {
            return Err(EngineError::MessageTooLarge {
                size: total,
                max: self.max_message_size,
            });
        }

        let mut frame = BytesMut::with_capacity(total);
        frame.put_u32(total as u32);
        frame.put_u32(msg.message_type);
        frame.put_u32(msg.sequence);
        frame.put_u32(msg.data.len() as u32);
        frame.put_slice(&msg.data);
        Ok(frame.freeze())
    }

    fn frame_length(&self, buf: &[u8]) -> std::result::Result<usize, UnpackError> {
        if buf.len() < 4 {
            return Err(UnpackError::short_read());
        }
        let total = read_u32(buf, 0) as usize;
        if total < HEADER_SIZE {
            return Err(UnpackError::new(
                EngineError::InvalidFormat(constants::ERR_TOTAL_LEN_TOO_SMALL.to_string()),
                Discard::All,
            ));
        }
        if total > self.max_message_size {
            return Err(UnpackError::too_large(
                total,
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

        let data_len = read_u32(buf, 12) as usize;
        if HEADER_SIZE + data_len != total {
            return Err(UnpackError::new(
                EngineError::InvalidFormat(format!(
                    "{}: total {total}, data {data_len}",
                    constants::ERR_LENGTH_MISMATCH
                )),
                Discard::Bytes(total),
            ));
        }

        let message = FieldMessage {
            message_type: read_u32(buf, 4),
            sequence: read_u32(buf, 8),
            data: Bytes::copy_from_slice(&buf[HEADER_SIZE..total]),
        };
        Ok((Message::Field(message), total))
    }
}
