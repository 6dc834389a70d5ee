//! # Transport
//!
//! TCP plumbing around the framings in [`crate::protocol`].
//!
//! ## Components
//! - **Connection**: per-socket read/write/idle loops with an idempotent close
//! - **Server**: accept loop with admission control, registry and broadcast
//! - **Client**: dial with retries, async or direct request/response I/O
//! - **Handler**: callbacks, isolated from the loops that invoke them

pub mod client;
pub mod connection;
pub mod handler;
pub mod server;

pub use client::Client;
pub use connection::{Connection, ConnectionIds, ConnectionState};
pub use handler::{Handler, LoggingHandler};
pub use server::{Server, ServerBuilder};
