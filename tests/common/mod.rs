//! Shared helpers for integration tests

#![allow(dead_code, clippy::unwrap_used)]

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use framelink::config::ConnectionConfig;
use framelink::protocol::ProtocolKind;
use framelink::{Connection, EngineError, Handler, Message};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Handler that records every callback for later assertions
#[derive(Default)]
pub struct Recorder {
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    pub messages: Mutex<Vec<Message>>,
    pub errors: Mutex<Vec<String>>,
    /// Messages of this type make `on_message` panic
    pub panic_on: Option<u32>,
    /// Echo every message back on the same connection
    pub echo: bool,
    /// Block inside `on_close` for this long
    pub close_delay: Option<Duration>,
}

impl Recorder {
    pub fn echo() -> Self {
        Self {
            echo: true,
            ..Self::default()
        }
    }

    pub fn panicking_on(message_type: u32) -> Self {
        Self {
            panic_on: Some(message_type),
            ..Self::default()
        }
    }

    pub fn slow_close(delay: Duration) -> Self {
        Self {
            close_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn message_count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    pub fn count_errors(&self, needle: &str) -> usize {
        self.errors().iter().filter(|e| e.contains(needle)).count()
    }
}

impl Handler for Recorder {
    fn on_connect(&self, _conn: &Arc<Connection>) {
        self.connects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_message(&self, conn: &Arc<Connection>, message: Message) {
        if self.panic_on == Some(message.message_type()) {
            panic!("refusing message type {}", message.message_type());
        }
        if self.echo {
            conn.send(&message).unwrap();
        }
        self.messages.lock().unwrap().push(message);
    }

    fn on_close(&self, _conn: &Arc<Connection>) {
        if let Some(delay) = self.close_delay {
            std::thread::sleep(delay);
        }
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn on_error(&self, _conn: Option<&Arc<Connection>>, error: &EngineError) {
        self.errors.lock().unwrap().push(format!("{error:?}"));
    }
}

/// One scripted outcome of a read
pub enum Step {
    Data(Vec<u8>),
    Fail(io::ErrorKind),
}

/// In-memory stream that plays back a fixed script of reads and can fail
/// writes on demand. Once the script runs out, reads stay pending.
#[derive(Default)]
pub struct ScriptedStream {
    reads: VecDeque<Step>,
    write_failures: VecDeque<io::ErrorKind>,
    always_fail_writes: Option<io::ErrorKind>,
    pub written: Arc<Mutex<Vec<u8>>>,
}

impl ScriptedStream {
    pub fn new(reads: impl IntoIterator<Item = Step>) -> Self {
        Self {
            reads: reads.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn failing_writes(mut self, failures: impl IntoIterator<Item = io::ErrorKind>) -> Self {
        self.write_failures = failures.into_iter().collect();
        self
    }

    pub fn always_failing_writes(mut self, kind: io::ErrorKind) -> Self {
        self.always_fail_writes = Some(kind);
        self
    }
}

impl AsyncRead for ScriptedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.reads.pop_front() {
            Some(Step::Data(chunk)) => {
                let n = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk[..n]);
                if n < chunk.len() {
                    self.reads.push_front(Step::Data(chunk[n..].to_vec()));
                }
                Poll::Ready(Ok(()))
            }
            Some(Step::Fail(kind)) => Poll::Ready(Err(kind.into())),
            None => Poll::Pending,
        }
    }
}

impl AsyncWrite for ScriptedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if let Some(kind) = self.write_failures.pop_front().or(self.always_fail_writes) {
            return Poll::Ready(Err(kind.into()));
        }
        self.written.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Connection settings suited to fast tests: no rate limit, small retries.
pub fn test_config(protocol: ProtocolKind) -> ConnectionConfig {
    let mut config = ConnectionConfig {
        protocol,
        max_message_size: 64 * 1024,
        rate_limit: 0.0,
        ..ConnectionConfig::default()
    };
    config.retry.max_retries = 2;
    config.retry.base_delay = Duration::from_millis(10);
    config.retry.max_delay = Duration::from_millis(50);
    config
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
