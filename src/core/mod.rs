//! # Core Components
//!
//! Low-level state shared by the connection loops.
//!
//! ## Components
//! - **MessageBuffer**: owned accumulation buffer with `append`/`consume`
//! - **SendQueue**: bounded outbound queue with a non-blocking push

pub mod buffer;
pub mod queue;

pub use buffer::MessageBuffer;
pub use queue::SendQueue;
