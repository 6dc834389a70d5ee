//! Owned accumulation buffer for partial reads.
//!
//! Bytes read from the socket land in a separate scratch buffer and are copied in
//! with [`MessageBuffer::append`]; parsed frames are released with
//! [`MessageBuffer::consume`]. The scratch buffer is never aliased.

use bytes::{Buf, BytesMut};

use crate::error::{EngineError, Result};
use crate::protocol::Discard;

/// Growable byte buffer that frames are parsed out of
#[derive(Debug, Default)]
pub struct MessageBuffer {
    inner: BytesMut,
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: BytesMut::with_capacity(capacity),
        }
    }

    /// Copy `bytes` onto the end of the buffer
    pub fn append(&mut self, bytes: &[u8]) {
        self.inner.extend_from_slice(bytes);
    }

    /// Drop `n` bytes from the front
    pub fn consume(&mut self, n: usize) -> Result<()> {
        if n > self.inner.len() {
            return Err(EngineError::BufferUnderflow {
                requested: n,
                available: self.inner.len(),
            });
        }
        self.inner.advance(n);
        Ok(())
    }

    /// Apply a framing discard instruction. Returns the number of bytes dropped.
    pub fn discard(&mut self, discard: Discard) -> usize {
        let n = match discard {
            Discard::None => 0,
            Discard::Bytes(n) => n.min(self.inner.len()),
            Discard::All => self.inner.len(),
        };
        self.inner.advance(n);
        n
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.inner
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
