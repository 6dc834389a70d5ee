//! Bounded outbound queue with a non-blocking push.
//!
//! Producers are arbitrary callers of `Connection::send`; the single consumer is the
//! connection's write loop. A full queue is reported immediately as
//! [`EngineError::SendBufferFull`] so callers see backpressure instead of blocking.

use std::sync::RwLock;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{EngineError, Result};

/// Producer side of a connection's outbound queue
#[derive(Debug)]
pub struct SendQueue {
    tx: RwLock<Option<mpsc::Sender<Bytes>>>,
    capacity: usize,
}

/// Create a queue holding at most `capacity` packed frames.
pub fn channel(capacity: usize) -> (SendQueue, mpsc::Receiver<Bytes>) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    (
        SendQueue {
            tx: RwLock::new(Some(tx)),
            capacity,
        },
        rx,
    )
}

impl SendQueue {
    /// Enqueue a frame without waiting.
    pub fn try_push(&self, frame: Bytes) -> Result<()> {
        let guard = self.tx.read().map_err(|_| EngineError::ConnectionClosed)?;
        let tx = guard.as_ref().ok_or(EngineError::ConnectionClosed)?;
        tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EngineError::SendBufferFull,
            mpsc::error::TrySendError::Closed(_) => EngineError::ConnectionClosed,
        })
    }

    /// Stop accepting frames. Frames already queued stay readable by the consumer.
    pub fn close(&self) {
        if let Ok(mut guard) = self.tx.write() {
            guard.take();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.read().map(|g| g.is_none()).unwrap_or(true)
    }

    /// Frames currently waiting
    pub fn len(&self) -> usize {
        self.tx
            .read()
            .ok()
            .and_then(|g| g.as_ref().map(|tx| self.capacity - tx.capacity()))
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
