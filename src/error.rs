//! # Error Types
//!
//! Classified error handling for the connection engine.
//!
//! Every error belongs to exactly one [`ErrorKind`] so callers can pick a recovery
//! policy (retry, drop, reconnect, alert) without inspecting message text.
//!
//! ## Error Categories
//! - **Connection**: closed, idle timeout, admission refusal, send backpressure
//! - **Protocol**: short read (a buffering signal, not a failure), malformed frames,
//!   oversized frames, checksum and magic-number violations
//! - **System**: I/O failures, overload, fatal accept errors, exhausted retries
//! - **Buffer**: overflow/underflow of the accumulation buffer
//!
//! ## Example Usage
//! ```rust
//! use framelink::error::{EngineError, ErrorKind};
//!
//! let err = EngineError::SendBufferFull;
//! assert_eq!(err.kind(), ErrorKind::Connection);
//! assert!(err.is_transient());
//! ```

use std::fmt;
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Framing errors
    pub const ERR_TOTAL_LEN_TOO_SMALL: &str = "declared frame length is smaller than the header";
    pub const ERR_LENGTH_MISMATCH: &str = "data length does not match declared frame length";
    pub const ERR_WRONG_VARIANT_FIELD: &str = "length-field protocol requires a FieldMessage";
    pub const ERR_WRONG_VARIANT_JSON: &str = "json protocol requires a JsonMessage";
    pub const ERR_WRONG_VARIANT_BINARY: &str = "binary protocol requires a BinaryMessage";

    /// Builder errors
    pub const ERR_HANDLER_MISSING: &str = "a handler must be supplied before building";

    /// Server errors
    pub const ERR_ACCEPT_FAILED: &str = "accept loop failed";
    pub const ERR_SERVER_RUNNING: &str = "server already started";
}

/// Broad error category used for recovery decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    Protocol,
    System,
    Buffer,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Protocol => "protocol",
            ErrorKind::System => "system",
            ErrorKind::Buffer => "buffer",
        };
        f.write_str(name)
    }
}

// EngineError is the single error type surfaced by every component
#[derive(Error, Debug)]
pub enum EngineError {
    // --- connection ---
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection idle timeout")]
    IdleTimeout,

    #[error("Too many connections")]
    TooManyConnections,

    #[error("Send buffer full")]
    SendBufferFull,

    #[error("Write timed out")]
    WriteTimeout,

    #[error("Read timed out")]
    ReadTimeout,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Connect timed out")]
    ConnectTimeout,

    #[error("Socket reader is owned by the read loop")]
    ReaderBusy,

    // --- protocol ---
    #[error("Short read: frame incomplete")]
    ShortRead,

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Message too large: {size} > {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    Checksum { expected: u32, actual: u32 },

    #[error("Invalid magic number: {0:#06x}")]
    InvalidMagic(u16),

    #[error("Invalid message: {0}")]
    InvalidMessage(&'static str),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // --- system ---
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("System overload: {0}")]
    Overload(String),

    #[error("Fatal error: {0}")]
    Fatal(String),

    #[error("Retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Handler panicked: {0}")]
    HandlerPanic(String),

    // --- buffer ---
    #[error("Buffer overflow: {size} > {max}")]
    BufferOverflow { size: usize, max: usize },

    #[error("Buffer underflow: requested {requested}, available {available}")]
    BufferUnderflow { requested: usize, available: usize },

    #[error("Buffer full")]
    BufferFull,

    #[error("Buffer empty")]
    BufferEmpty,
}

impl EngineError {
    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        use EngineError::*;
        match self {
            ConnectionClosed | IdleTimeout | TooManyConnections | SendBufferFull | WriteTimeout
            | ReadTimeout | AlreadyConnected | NotConnected | ConnectTimeout | ReaderBusy => {
                ErrorKind::Connection
            }
            ShortRead | InvalidFormat(_) | MessageTooLarge { .. } | Checksum { .. }
            | InvalidMagic(_) | InvalidMessage(_) | Json(_) => ErrorKind::Protocol,
            Io(_) | Overload(_) | Fatal(_) | RetriesExhausted { .. } | Config(_)
            | HandlerPanic(_) => ErrorKind::System,
            BufferOverflow { .. } | BufferUnderflow { .. } | BufferFull | BufferEmpty => {
                ErrorKind::Buffer
            }
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Io(e) => is_transient_io(e),
            EngineError::WriteTimeout
            | EngineError::ReadTimeout
            | EngineError::Overload(_)
            | EngineError::SendBufferFull => true,
            _ => false,
        }
    }

    /// The buffering signal: more bytes are needed before a frame can be parsed.
    pub fn is_short_read(&self) -> bool {
        matches!(self, EngineError::ShortRead)
    }

    /// The peer is gone or the connection was torn down locally.
    pub fn is_connection_loss(&self) -> bool {
        match self {
            EngineError::ConnectionClosed | EngineError::IdleTimeout | EngineError::NotConnected => {
                true
            }
            EngineError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            EngineError::RetriesExhausted { .. } => true,
            _ => false,
        }
    }
}

/// Classify an OS-level I/O error as transient (worth retrying).
pub fn is_transient_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Type alias for Results using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_classified() {
        assert_eq!(EngineError::IdleTimeout.kind(), ErrorKind::Connection);
        assert_eq!(EngineError::ShortRead.kind(), ErrorKind::Protocol);
        assert_eq!(
            EngineError::Checksum { expected: 1, actual: 2 }.kind(),
            ErrorKind::Protocol
        );
        assert_eq!(EngineError::Fatal("x".into()).kind(), ErrorKind::System);
        assert_eq!(
            EngineError::BufferOverflow { size: 2, max: 1 }.kind(),
            ErrorKind::Buffer
        );
    }

    #[test]
    fn transient_classification() {
        let interrupted = EngineError::Io(io::Error::from(io::ErrorKind::Interrupted));
        let reset = EngineError::Io(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(interrupted.is_transient());
        assert!(!reset.is_transient());
        assert!(reset.is_connection_loss());
        assert!(!EngineError::ShortRead.is_transient());
        assert!(EngineError::ShortRead.is_short_read());
    }

    #[test]
    fn client_visible_conditions_are_distinct() {
        let lost = EngineError::ConnectionClosed;
        let full = EngineError::SendBufferFull;
        let idle = EngineError::IdleTimeout;
        assert!(lost.is_connection_loss() && !lost.is_transient());
        assert!(full.is_transient() && !full.is_connection_loss());
        assert!(idle.is_connection_loss() && !idle.is_transient());
    }

    #[test]
    fn display_includes_details() {
        let err = EngineError::MessageTooLarge { size: 20, max: 10 };
        assert_eq!(err.to_string(), "Message too large: 20 > 10");
        assert_eq!(EngineError::InvalidMagic(0xBEEF).to_string(), "Invalid magic number: 0xbeef");
    }
}
