//! Checksummed binary framing with a trailing magic number.
//!
//! ```text
//! [version(1)] [type(4)] [sequence(4)] [data_len(4)] [data] [crc32(4)] [magic(2) = 0xCAFE]
//! ```
//! The CRC32 (IEEE) covers header and data. The magic number terminates every
//! frame, so a frame whose trailer is wrong is resynchronised by skipping to the end
//! of the next magic pair in the stream.

use bytes::{BufMut, Bytes, BytesMut};

use super::{read_u32, Discard, Message, Protocol, ProtocolKind, UnpackError, UnpackResult};
use crate::error::{constants, EngineError, Result};
use crate::protocol::message::BinaryMessage;

pub const HEADER_SIZE: usize = 13;
pub const FOOTER_SIZE: usize = 6;
pub const MAGIC: u16 = 0xCAFE;
pub const VERSION: u8 = 1;

const MAGIC_BYTES: [u8; 2] = MAGIC.to_be_bytes();

#[derive(Debug, Clone)]
pub struct BinaryProtocol {
    max_message_size: usize,
    /// Upper bound on bytes examined when hunting for the next magic pair
    max_resync_scan: usize,
}

impl BinaryProtocol {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            max_resync_scan: max_message_size,
        }
    }

    /// Override the resync scan bound
    pub fn with_max_resync_scan(mut self, bytes: usize) -> Self {
        self.max_resync_scan = bytes.max(MAGIC_BYTES.len());
        self
    }

    /// Discard instruction for a frame whose trailer at `magic_at` is not the magic.
    ///
    /// Scans forward from the bad trailer for the next magic pair and drops
    /// everything through it. The scan is bounded so hostile input cannot make
    /// each call quadratic; if no pair is found in the window the window is dropped.
    fn resync(&self, buf: &[u8], magic_at: usize) -> Discard {
        let end = buf.len().min(magic_at.saturating_add(self.max_resync_scan));
        let window = &buf[magic_at..end];
        match window.windows(2).position(|pair| pair == MAGIC_BYTES) {
            Some(pos) => Discard::Bytes(magic_at + pos + MAGIC_BYTES.len()),
            None if end == buf.len() => Discard::All,
            None => Discard::Bytes(end),
        }
    }
}

impl Protocol for BinaryProtocol {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Binary
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    fn pack(&self, message: &Message) -> Result<Bytes> {
        let Message::Binary(msg) = message else {
            return Err(EngineError::InvalidMessage(constants::ERR_WRONG_VARIANT_BINARY));
        };

        let total = HEADER_SIZE + msg.data.len() + FOOTER_SIZE;
        if total > self.max_message_size || msg.data.len() > u32::MAX as usize {
            return Err(EngineError::MessageTooLarge {
                size: total,
                max: self.max_message_size,
            });
        }

        let mut frame = BytesMut::with_capacity(total);
        frame.put_u8(msg.version);
        frame.put_u32(msg.message_type);
        frame.put_u32(msg.sequence);
        frame.put_u32(msg.data.len() as u32);
        frame.put_slice(&msg.data);
        let crc = crc32fast::hash(&frame);
        frame.put_u32(crc);
        frame.put_u16(MAGIC);
        Ok(frame.freeze())
    }

    fn frame_length(&self, buf: &[u8]) -> std::result::Result<usize, UnpackError> {
        if buf.len() < HEADER_SIZE {
            return Err(UnpackError::short_read());
        }
        let data_len = read_u32(buf, 9) as usize;
        let total = HEADER_SIZE
            .saturating_add(data_len)
            .saturating_add(FOOTER_SIZE);
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

        let magic_at = total - MAGIC_BYTES.len();
        let magic = u16::from_be_bytes([buf[magic_at], buf[magic_at + 1]]);
        if magic != MAGIC {
            return Err(UnpackError::new(
                EngineError::InvalidMagic(magic),
                self.resync(buf, magic_at),
            ));
        }

        let crc_at = total - FOOTER_SIZE;
        let expected = read_u32(buf, crc_at);
        let actual = crc32fast::hash(&buf[..crc_at]);
        if expected != actual {
            return Err(UnpackError::new(
                EngineError::Checksum { expected, actual },
                Discard::Bytes(total),
            ));
        }

        let message = BinaryMessage {
            version: buf[0],
            message_type: read_u32(buf, 1),
            sequence: read_u32(buf, 5),
            data: Bytes::copy_from_slice(&buf[HEADER_SIZE..crc_at]),
        };
        Ok((Message::Binary(message), total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(seq: u32, data: &'static [u8]) -> Message {
        BinaryMessage::new(3, seq, data).into()
    }

    #[test]
    fn test_layout_and_trailer() {
        let protocol = BinaryProtocol::new(1024);
        let frame = protocol.pack(&msg(9, b"abc")).unwrap();
        assert_eq!(frame.len(), HEADER_SIZE + 3 + FOOTER_SIZE);
        assert_eq!(frame[0], VERSION);
        assert_eq!(&frame[1..5], &[0, 0, 0, 3]);
        assert_eq!(&frame[5..9], &[0, 0, 0, 9]);
        assert_eq!(&frame[9..13], &[0, 0, 0, 3]);
        assert_eq!(&frame[frame.len() - 2..], &[0xCA, 0xFE]);
        let crc = crc32fast::hash(&frame[..16]);
        assert_eq!(&frame[16..20], &crc.to_be_bytes());
    }

    #[test]
    fn test_payload_corruption_is_checksum_failure() {
        let protocol = BinaryProtocol::new(1024);
        let frame = protocol.pack(&msg(1, b"payload")).unwrap();
        for i in HEADER_SIZE..HEADER_SIZE + 7 {
            let mut corrupt = frame.to_vec();
            corrupt[i] ^= 0x01;
            let err = protocol.unpack(&corrupt).unwrap_err();
            assert!(matches!(err.error, EngineError::Checksum { .. }));
            assert_eq!(err.discard, Discard::Bytes(frame.len()));
        }
    }

    #[test]
    fn test_bad_magic_resyncs_past_next_magic() {
        let protocol = BinaryProtocol::new(1024);
        let bad = protocol.pack(&msg(1, b"one")).unwrap();
        let good = protocol.pack(&msg(2, b"two")).unwrap();

        let mut stream = bad.to_vec();
        let n = stream.len();
        stream[n - 2] = 0x00;
        stream[n - 1] = 0x00;
        stream.extend_from_slice(&[0x11, 0x22, 0xCA, 0xFE]);
        stream.extend_from_slice(&good);

        let err = protocol.unpack(&stream).unwrap_err();
        assert!(matches!(err.error, EngineError::InvalidMagic(0x0000)));
        assert_eq!(err.discard, Discard::Bytes(n + 4));

        let (decoded, consumed) = protocol.unpack(&stream[n + 4..]).unwrap();
        assert_eq!(decoded, msg(2, b"two"));
        assert_eq!(consumed, good.len());
    }

    #[test]
    fn test_resync_without_magic_discards_all() {
        let protocol = BinaryProtocol::new(1024);
        let mut frame = protocol.pack(&msg(1, b"x")).unwrap().to_vec();
        let n = frame.len();
        frame[n - 1] = 0xFF;
        let err = protocol.unpack(&frame).unwrap_err();
        assert!(matches!(err.error, EngineError::InvalidMagic(0xCAFF)));
        assert_eq!(err.discard, Discard::All);
    }

    #[test]
    fn test_resync_scan_is_bounded() {
        let protocol = BinaryProtocol::new(1024).with_max_resync_scan(8);
        let mut stream = protocol.pack(&msg(1, b"x")).unwrap().to_vec();
        let n = stream.len();
        stream[n - 2] = 0;
        stream.extend_from_slice(&[0u8; 32]);
        let err = protocol.unpack(&stream).unwrap_err();
        assert_eq!(err.discard, Discard::Bytes(n - 2 + 8));
    }

    #[test]
    fn test_prefixes_are_short_reads() {
        let protocol = BinaryProtocol::new(1024);
        let frame = protocol.pack(&msg(5, b"hello")).unwrap();
        for cut in 0..frame.len() {
            assert!(protocol.unpack(&frame[..cut]).unwrap_err().is_short_read());
        }
    }

    #[test]
    fn test_oversized_header() {
        let protocol = BinaryProtocol::new(64);
        let mut header = vec![1u8, 0, 0, 0, 1, 0, 0, 0, 1];
        header.extend_from_slice(&1000u32.to_be_bytes());
        let err = protocol.unpack(&header).unwrap_err();
        assert!(matches!(err.error, EngineError::MessageTooLarge { size: 1019, max: 64 }));
        assert_eq!(err.discard, Discard::All);
    }
}
