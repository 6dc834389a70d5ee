//! # Protocol / Framing
//!
//! Pluggable codecs that turn messages into frames and frames back into messages.
//!
//! ## Framings
//! ```text
//! length-field: [total_len(4)] [type(4)] [sequence(4)] [data_len(4)] [data]
//! json:         [len(4)] [{"type","sequence","data","timestamp"}]
//! binary:       [version(1)] [type(4)] [sequence(4)] [data_len(4)] [data] [crc32(4)] [0xCAFE]
//! ```
//! All integers are big-endian.
//!
//! ## Unpack discipline
//! [`Protocol::unpack`] is called on an accumulation buffer that grows across reads.
//! It never mutates the buffer. On success it reports how many bytes the frame used;
//! on failure the [`UnpackError`] says how many bytes the caller must drop before
//! trying again. A short read drops nothing.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

pub mod binary;
pub mod codec;
pub mod dispatcher;
pub mod json;
pub mod length_field;
pub mod message;

pub use binary::BinaryProtocol;
pub use codec::ProtocolCodec;
pub use dispatcher::Dispatcher;
pub use json::JsonProtocol;
pub use length_field::LengthFieldProtocol;
pub use message::{BinaryMessage, FieldMessage, JsonMessage, Message};

/// Default maximum frame size (10 MiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// How many buffered bytes a failed unpack invalidated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discard {
    /// Keep everything (short read)
    None,
    /// Drop this many bytes from the front
    Bytes(usize),
    /// The frame boundary is unknown; drop the whole buffer
    All,
}

/// A classified unpack failure plus the recovery instruction for the buffer
#[derive(Debug)]
pub struct UnpackError {
    pub error: EngineError,
    pub discard: Discard,
}

impl UnpackError {
    pub fn short_read() -> Self {
        Self {
            error: EngineError::ShortRead,
            discard: Discard::None,
        }
    }

    pub fn new(error: EngineError, discard: Discard) -> Self {
        Self { error, discard }
    }

    pub fn is_short_read(&self) -> bool {
        self.error.is_short_read()
    }

    /// Oversized frame of `extent` bytes on the wire: drop it if it is fully
    /// buffered, otherwise its extent is untrusted and the whole buffer goes.
    pub(crate) fn too_large(size: usize, max: usize, extent: usize, buffered: usize) -> Self {
        let discard = if extent <= buffered {
            Discard::Bytes(extent)
        } else {
            Discard::All
        };
        Self::new(EngineError::MessageTooLarge { size, max }, discard)
    }
}

impl fmt::Display for UnpackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (discard: {:?})", self.error, self.discard)
    }
}

impl std::error::Error for UnpackError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl From<UnpackError> for EngineError {
    fn from(err: UnpackError) -> Self {
        err.error
    }
}

/// Result of a single unpack attempt: the message and the bytes it occupied
pub type UnpackResult = std::result::Result<(Message, usize), UnpackError>;

/// A wire framing.
///
/// Implementations are stateless and shared by every connection of a server.
pub trait Protocol: Send + Sync + fmt::Debug {
    fn kind(&self) -> ProtocolKind;

    fn max_message_size(&self) -> usize;

    /// Largest frame this framing can put on the wire, headers included.
    /// Buffered bytes beyond this can never be a partial frame.
    fn max_frame_len(&self) -> usize {
        self.max_message_size()
    }

    /// Encode one message into a complete frame.
    fn pack(&self, message: &Message) -> Result<Bytes>;

    /// Total length of the frame at the front of `buf`, read from its header.
    /// Never consumes; a short read means the header is not complete yet.
    fn frame_length(&self, buf: &[u8]) -> std::result::Result<usize, UnpackError>;

    /// Parse the frame at the front of `buf`.
    fn unpack(&self, buf: &[u8]) -> UnpackResult;
}

/// Framing selector used by configuration and the factory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    LengthField,
    #[default]
    Json,
    Binary,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolKind::LengthField => "length_field",
            ProtocolKind::Json => "json",
            ProtocolKind::Binary => "binary",
        };
        f.write_str(name)
    }
}

impl FromStr for ProtocolKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "length_field" | "lengthfield" => Ok(ProtocolKind::LengthField),
            "json" => Ok(ProtocolKind::Json),
            "binary" => Ok(ProtocolKind::Binary),
            other => Err(EngineError::Config(format!(
                "unsupported protocol type: {other}"
            ))),
        }
    }
}

/// Build a shared protocol instance
pub fn new_protocol(kind: ProtocolKind, max_message_size: usize) -> Arc<dyn Protocol> {
    match kind {
        ProtocolKind::LengthField => Arc::new(LengthFieldProtocol::new(max_message_size)),
        ProtocolKind::Json => Arc::new(JsonProtocol::new(max_message_size)),
        ProtocolKind::Binary => Arc::new(BinaryProtocol::new(max_message_size)),
    }
}

#[inline]
pub(crate) fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}
