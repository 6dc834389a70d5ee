//! Caller-supplied callbacks and panic isolation around them.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::connection::Connection;
use crate::error::EngineError;
use crate::protocol::Message;

/// Callbacks invoked by connection loops.
///
/// Calls are synchronous on the loop that produced the event, so a slow callback
/// stalls that connection's I/O. Panics are caught and reported as
/// [`EngineError::HandlerPanic`]; they never take down the loop.
pub trait Handler: Send + Sync + 'static {
    /// Fires once per connection, before any message is delivered.
    fn on_connect(&self, conn: &Arc<Connection>) {
        debug!(conn_id = conn.id(), peer = ?conn.peer_addr(), "Connection opened");
    }

    fn on_message(&self, conn: &Arc<Connection>, message: Message);

    /// Fires exactly once, from whichever caller closed the connection first.
    fn on_close(&self, conn: &Arc<Connection>) {
        debug!(conn_id = conn.id(), "Connection closed");
    }

    /// `conn` is `None` for server-level errors such as admission refusals.
    fn on_error(&self, conn: Option<&Arc<Connection>>, error: &EngineError) {
        warn!(conn_id = conn.map(|c| c.id()), error = %error, "Connection error");
    }
}

/// Handler that only logs; used when the caller supplies none.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

impl Handler for LoggingHandler {
    fn on_connect(&self, conn: &Arc<Connection>) {
        info!(conn_id = conn.id(), peer = ?conn.peer_addr(), "Connected");
    }

    fn on_message(&self, conn: &Arc<Connection>, message: Message) {
        info!(
            conn_id = conn.id(),
            message_type = message.message_type(),
            sequence = message.sequence(),
            len = message.payload_len(),
            "Message received"
        );
    }

    fn on_close(&self, conn: &Arc<Connection>) {
        info!(conn_id = conn.id(), "Disconnected");
    }
}

/// Run a callback, converting a panic into an error.
pub(crate) fn guarded<F: FnOnce()>(callback: &'static str, f: F) -> Result<(), EngineError> {
    catch_unwind(AssertUnwindSafe(f))
        .map_err(|payload| EngineError::HandlerPanic(format!("{callback}: {}", panic_text(&payload))))
}

fn panic_text(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
