//! # framelink
//!
//! TCP connection and wire-framing engine.
//!
//! A [`Server`] accepts sockets and wraps each in a [`Connection`] that runs its
//! own read, write and idle loops. Bytes are turned into messages by one of three
//! pluggable framings, and inbound messages are handed to a caller-supplied
//! [`Handler`]. A [`Client`] dials the same way and can either run loops or do
//! direct request/response I/O.
//!
//! ## Framings
//! - **length-field**: 16-byte header, no checksum
//! - **json**: 4-byte length prefix and a JSON body
//! - **binary**: 13-byte header, CRC32 and a `0xCAFE` trailer with resync
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use framelink::{Connection, FieldMessage, Handler, Message, Server};
//! use framelink::config::ConnectionConfig;
//! use framelink::protocol::ProtocolKind;
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_message(&self, conn: &Arc<Connection>, message: Message) {
//!         let _ = conn.send(&message);
//!     }
//! }
//!
//! # async fn run() -> framelink::Result<()> {
//! let server = Server::builder("127.0.0.1:9000")
//!     .connection_config(ConnectionConfig {
//!         protocol: ProtocolKind::LengthField,
//!         ..ConnectionConfig::default()
//!     })
//!     .handler(Arc::new(Echo))
//!     .build()?;
//! server.start().await?;
//! # let _ = FieldMessage::new(1, 1, &b"ping"[..]);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use config::EngineConfig;
pub use error::{EngineError, ErrorKind, Result};
pub use protocol::{
    new_protocol, BinaryMessage, FieldMessage, JsonMessage, Message, Protocol, ProtocolKind,
};
pub use transport::{Client, Connection, Handler, Server};
