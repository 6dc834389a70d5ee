//! Per-socket state machine.
//!
//! A [`Connection`] owns one byte stream and drives up to three loops over it:
//!
//! - **read**: rate limit, read with an idle deadline, accumulate, unpack, dispatch
//! - **write**: drain the bounded outbound queue onto the socket
//! - **idle**: periodically close the connection once it has been silent too long
//!
//! Whichever loop ends first closes the connection; [`Connection::close`] is
//! idempotent and runs `on_close` exactly once. All loops select on one
//! cancellation token and exit promptly once it fires.
//!
//! ## Lifecycle
//! ```text
//! Open ──close()──▶ Closing ──on_close──▶ Closed
//! ```

use std::any::Any;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::handler::{guarded, Handler};
use crate::config::ConnectionConfig;
use crate::core::{queue, MessageBuffer, SendQueue};
use crate::error::{is_transient_io, EngineError, ErrorKind, Result};
use crate::protocol::{Discard, Message, Protocol};
use crate::utils::timeout::RATE_LIMIT_BACKOFF;
use crate::utils::{Backoff, Metrics, MetricsSnapshot, RateLimiter};

type DynRead = Box<dyn AsyncRead + Send + Unpin>;
type DynWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Source of connection ids, shared by whoever creates connections.
///
/// Ids start at 1 and increase monotonically per source. Servers and clients
/// each get their own source unless one is injected.
#[derive(Debug)]
pub struct ConnectionIds {
    next: AtomicU64,
}

impl ConnectionIds {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for ConnectionIds {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Which loops a run drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopSet {
    /// read + write + idle (server side)
    Full,
    /// read + write (client)
    ReadWrite,
    /// write only; the reader stays available for direct receives
    WriteOnly,
}

pub struct Connection {
    id: u64,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    protocol: Arc<dyn Protocol>,
    handler: Arc<dyn Handler>,
    config: Arc<ConnectionConfig>,

    reader: AsyncMutex<Option<DynRead>>,
    writer: AsyncMutex<Option<DynWrite>>,
    outbound: Mutex<Option<mpsc::Receiver<Bytes>>>,
    queue: SendQueue,
    /// Bytes buffered by direct receives
    pending: AsyncMutex<MessageBuffer>,

    cancel: CancellationToken,
    started: AtomicBool,
    closed: AtomicBool,
    idle_fired: AtomicBool,
    state: AtomicU8,

    created: Instant,
    last_active_ms: AtomicU64,
    attrs: DashMap<String, Arc<dyn Any + Send + Sync>>,
    limiter: RateLimiter,
    metrics: Metrics,
    aggregate: Option<Arc<Metrics>>,
}

impl Connection {
    /// Wrap any byte stream, e.g. a `tokio::io::duplex` pipe in tests.
    pub fn new<S>(
        id: u64,
        stream: S,
        protocol: Arc<dyn Protocol>,
        handler: Arc<dyn Handler>,
        config: Arc<ConnectionConfig>,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::build(
            id,
            Box::new(reader),
            Box::new(writer),
            (None, None),
            protocol,
            handler,
            config,
            None,
        )
    }

    /// Wrap a TCP socket, recording its addresses. Counts are mirrored into
    /// `aggregate` when given.
    pub fn from_tcp(
        id: u64,
        stream: TcpStream,
        protocol: Arc<dyn Protocol>,
        handler: Arc<dyn Handler>,
        config: Arc<ConnectionConfig>,
        aggregate: Option<Arc<Metrics>>,
    ) -> Arc<Self> {
        let peer = stream.peer_addr().ok();
        let local = stream.local_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            debug!(conn_id = id, error = %e, "Failed to set TCP_NODELAY");
        }
        let (reader, writer) = stream.into_split();
        Self::build(
            id,
            Box::new(reader),
            Box::new(writer),
            (local, peer),
            protocol,
            handler,
            config,
            aggregate,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        id: u64,
        reader: DynRead,
        writer: DynWrite,
        (local_addr, peer_addr): (Option<SocketAddr>, Option<SocketAddr>),
        protocol: Arc<dyn Protocol>,
        handler: Arc<dyn Handler>,
        config: Arc<ConnectionConfig>,
        aggregate: Option<Arc<Metrics>>,
    ) -> Arc<Self> {
        let (queue, outbound) = queue::channel(config.send_queue_size);
        let limiter = RateLimiter::new(config.rate_limit, config.rate_burst);
        Arc::new(Self {
            id,
            peer_addr,
            local_addr,
            protocol,
            handler,
            reader: AsyncMutex::new(Some(reader)),
            writer: AsyncMutex::new(Some(writer)),
            outbound: Mutex::new(Some(outbound)),
            queue,
            pending: AsyncMutex::new(MessageBuffer::new()),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            idle_fired: AtomicBool::new(false),
            state: AtomicU8::new(0),
            created: Instant::now(),
            last_active_ms: AtomicU64::new(0),
            attrs: DashMap::new(),
            limiter,
            metrics: Metrics::new(),
            aggregate,
            config,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn protocol(&self) -> &Arc<dyn Protocol> {
        &self.protocol
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Frames waiting in the outbound queue
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Instant of the last successful read or write
    pub fn last_active(&self) -> Instant {
        self.created + Duration::from_millis(self.last_active_ms.load(Ordering::Relaxed))
    }

    /// Time since the last successful read or write
    pub fn idle_for(&self) -> Duration {
        self.last_active().elapsed()
    }

    fn touch(&self) {
        let now = self.created.elapsed().as_millis() as u64;
        self.last_active_ms.fetch_max(now, Ordering::Relaxed);
    }

    /// Attach caller-defined metadata.
    pub fn set_attr<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.attrs.insert(key.into(), Arc::new(value));
    }

    /// Read metadata back; `None` if absent or stored with another type.
    pub fn attr<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.attrs.get(key)?.value().clone();
        value.downcast::<T>().ok()
    }

    pub fn remove_attr(&self, key: &str) -> bool {
        self.attrs.remove(key).is_some()
    }

    /// Pack `message` and queue it for the write loop without waiting.
    ///
    /// Fails with `ConnectionClosed` once closed and `SendBufferFull` when the
    /// queue is at capacity.
    pub fn send(&self, message: &Message) -> Result<()> {
        if self.is_closed() {
            return Err(EngineError::ConnectionClosed);
        }
        let frame = self.protocol.pack(message)?;
        self.send_frame(frame)
    }

    /// Queue an already packed frame.
    pub(crate) fn send_frame(&self, frame: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(EngineError::ConnectionClosed);
        }
        self.queue.try_push(frame)
    }

    /// Run the read, write and idle loops until all of them exit.
    pub async fn start(self: &Arc<Self>) {
        self.run(LoopSet::Full).await;
    }

    #[instrument(skip(self), fields(conn_id = self.id, peer = ?self.peer_addr))]
    pub(crate) async fn run(self: &Arc<Self>, loops: LoopSet) {
        if self.is_closed() || self.started.swap(true, Ordering::AcqRel) {
            warn!("Connection already started or closed");
            return;
        }
        self.touch();

        if let Err(panic) = guarded("on_connect", || self.handler.on_connect(self)) {
            self.report(panic);
        }

        let mut tasks = Vec::with_capacity(3);
        if loops != LoopSet::WriteOnly {
            let conn = Arc::clone(self);
            tasks.push(tokio::spawn(async move { conn.read_loop().await }));
        }
        let conn = Arc::clone(self);
        tasks.push(tokio::spawn(async move { conn.write_loop().await }));
        if loops == LoopSet::Full {
            let conn = Arc::clone(self);
            tasks.push(tokio::spawn(async move { conn.idle_loop().await }));
        }

        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                error!(error = %e, "Connection loop aborted");
            }
        }
        self.close();
    }

    /// Tear the connection down. Safe to call any number of times from any task;
    /// only the first call has an effect.
    pub fn close(self: &Arc<Self>) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.state.store(1, Ordering::Release);

        self.cancel.cancel();
        self.queue.close();
        // halves held by a running loop are dropped when that loop exits
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        if let Ok(mut outbound) = self.outbound.lock() {
            outbound.take();
        }

        if let Err(panic) = guarded("on_close", || self.handler.on_close(self)) {
            error!(conn_id = self.id, error = %panic, "Handler panicked in on_close");
        }
        self.state.store(2, Ordering::Release);
        info!(conn_id = self.id, peer = ?self.peer_addr, "Connection closed");
    }

    async fn read_loop(self: &Arc<Self>) {
        let Some(mut reader) = self.reader.lock().await.take() else {
            self.close();
            return;
        };
        let mut scratch = vec![0u8; self.config.read_buffer_size.max(1)];
        let mut buffer = MessageBuffer::with_capacity(self.config.read_buffer_size);
        let mut backoff = Backoff::from_config(&self.config.retry);
        let max = self.protocol.max_frame_len();

        while !self.cancel.is_cancelled() {
            if !self.limiter.try_acquire() {
                if !self.pause(RATE_LIMIT_BACKOFF).await {
                    break;
                }
                continue;
            }

            let n = match self.read_chunk(&mut reader, &mut scratch, &mut backoff).await {
                Ok(n) => n,
                Err(e) => {
                    self.report_exit(e);
                    break;
                }
            };

            buffer.append(&scratch[..n]);
            self.drain(&mut buffer);

            // at most one partial frame may remain
            if buffer.len() > max {
                let size = buffer.len();
                buffer.clear();
                self.record(|m| m.buffer_overflow());
                self.report(EngineError::BufferOverflow { size, max });
            }
        }

        drop(reader);
        self.close();
    }

    /// Dispatch every complete frame in `buffer`.
    fn drain(self: &Arc<Self>, buffer: &mut MessageBuffer) {
        while !buffer.is_empty() && !self.cancel.is_cancelled() {
            let started = Instant::now();
            match self.protocol.unpack(buffer.as_slice()) {
                Ok((message, consumed)) => {
                    if let Err(e) = buffer.consume(consumed) {
                        buffer.clear();
                        self.report(e);
                        return;
                    }
                    self.touch();
                    let elapsed = started.elapsed();
                    self.record(|m| {
                        m.message_received();
                        m.message_latency(elapsed);
                    });
                    self.deliver(message);
                }
                Err(e) if e.is_short_read() => return,
                Err(e) => {
                    let discard = match e.discard {
                        Discard::None => Discard::All,
                        other => other,
                    };
                    let dropped = buffer.discard(discard);
                    debug!(conn_id = self.id, dropped, error = %e.error, "Discarded bytes");
                    self.report(e.error);
                }
            }
        }
    }

    /// Read once into `scratch`, honouring the idle deadline and retrying
    /// transient errors.
    async fn read_chunk(
        self: &Arc<Self>,
        reader: &mut DynRead,
        scratch: &mut [u8],
        backoff: &mut Backoff,
    ) -> Result<usize> {
        loop {
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return Err(EngineError::ConnectionClosed),
                r = tokio::time::timeout(self.config.idle_timeout, reader.read(scratch)) => r,
            };
            match outcome {
                Err(_deadline) => {
                    if self.idle_for() >= self.config.idle_timeout {
                        return Err(EngineError::IdleTimeout);
                    }
                }
                Ok(Ok(0)) => return Err(EngineError::ConnectionClosed),
                Ok(Ok(n)) => {
                    backoff.reset();
                    self.touch();
                    self.record(|m| m.bytes_read(n as u64));
                    return Ok(n);
                }
                Ok(Err(e)) if is_transient_io(&e) => self.retry_after(e, backoff).await?,
                Ok(Err(e)) => return Err(EngineError::Io(e)),
            }
        }
    }

    /// Write a whole frame, retrying transient failures. Used by the write loop
    /// and by direct sends.
    pub(crate) async fn write_frame(self: &Arc<Self>, frame: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(EngineError::ConnectionClosed)?;
        let deadline = self.config.write_timeout;
        let mut backoff = Backoff::from_config(&self.config.retry);
        let mut written = 0;
        let started = Instant::now();

        while written < frame.len() {
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return Err(EngineError::ConnectionClosed),
                r = tokio::time::timeout(deadline, writer.write(&frame[written..])) => r,
            };
            match outcome {
                Ok(Ok(0)) => return Err(EngineError::Io(io::ErrorKind::WriteZero.into())),
                Ok(Ok(n)) => {
                    written += n;
                    backoff.reset();
                }
                Ok(Err(e)) if is_transient_io(&e) => self.retry_after(e, &mut backoff).await?,
                Ok(Err(e)) => return Err(EngineError::Io(e)),
                Err(_deadline) => {
                    match self
                        .retry_after(io::ErrorKind::TimedOut.into(), &mut backoff)
                        .await
                    {
                        Ok(()) => {}
                        Err(EngineError::RetriesExhausted { .. }) => {
                            return Err(EngineError::WriteTimeout)
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        match tokio::time::timeout(deadline, writer.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(EngineError::Io(e)),
            Err(_) => return Err(EngineError::WriteTimeout),
        }

        self.touch();
        let elapsed = started.elapsed();
        self.record(|m| {
            m.message_sent(frame.len() as u64);
            m.message_latency(elapsed);
        });
        Ok(())
    }

    async fn write_loop(self: &Arc<Self>) {
        let outbound = self.outbound.lock().ok().and_then(|mut rx| rx.take());
        let Some(mut outbound) = outbound else {
            self.close();
            return;
        };

        loop {
            if !self.limiter.try_acquire() {
                if !self.pause(RATE_LIMIT_BACKOFF).await {
                    break;
                }
                continue;
            }

            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                frame = outbound.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            if let Err(e) = self.write_frame(&frame).await {
                self.report_exit(e);
                break;
            }
        }

        self.writer.lock().await.take();
        self.close();
    }

    async fn idle_loop(self: &Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.idle_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if self.idle_for() > self.config.idle_timeout {
                        self.report_exit(EngineError::IdleTimeout);
                        break;
                    }
                }
            }
        }
        self.close();
    }

    /// Read one message directly off the socket, bypassing the read loop.
    ///
    /// Only possible while no read loop owns the socket reader. Framing errors
    /// are returned after the offending bytes are discarded.
    pub(crate) async fn receive_direct(self: &Arc<Self>) -> Result<Message> {
        let mut reader_slot = self.reader.lock().await;
        if reader_slot.is_none() {
            return Err(if self.is_closed() {
                EngineError::ConnectionClosed
            } else {
                EngineError::ReaderBusy
            });
        }
        let mut pending = self.pending.lock().await;
        let mut scratch = vec![0u8; self.config.read_buffer_size.max(1)];
        let mut backoff = Backoff::from_config(&self.config.retry);

        loop {
            if !pending.is_empty() {
                match self.protocol.unpack(pending.as_slice()) {
                    Ok((message, consumed)) => {
                        pending.consume(consumed)?;
                        self.touch();
                        self.record(|m| m.message_received());
                        return Ok(message);
                    }
                    Err(e) if e.is_short_read() => {
                        let max = self.protocol.max_frame_len();
                        if pending.len() > max {
                            let size = pending.len();
                            pending.clear();
                            self.record(|m| m.buffer_overflow());
                            return Err(EngineError::BufferOverflow { size, max });
                        }
                    }
                    Err(e) => {
                        pending.discard(match e.discard {
                            Discard::None => Discard::All,
                            other => other,
                        });
                        self.record(|m| {
                            m.error();
                            m.protocol_error();
                        });
                        return Err(e.error);
                    }
                }
            }

            while !self.limiter.try_acquire() {
                if !self.pause(RATE_LIMIT_BACKOFF).await {
                    return Err(EngineError::ConnectionClosed);
                }
            }

            let Some(reader) = reader_slot.as_mut() else {
                return Err(EngineError::ConnectionClosed);
            };
            match self.read_chunk(reader, &mut scratch, &mut backoff).await {
                Ok(n) => pending.append(&scratch[..n]),
                Err(e) => {
                    reader_slot.take();
                    drop(pending);
                    drop(reader_slot);
                    if !self.cancel.is_cancelled() {
                        self.record(|m| m.error());
                    }
                    self.close();
                    return Err(e);
                }
            }
        }
    }

    /// Back off before retrying a transient error. Fails once the retry budget is
    /// spent or the connection is cancelled.
    async fn retry_after(self: &Arc<Self>, error: io::Error, backoff: &mut Backoff) -> Result<()> {
        let Some(delay) = backoff.next_delay() else {
            return Err(EngineError::RetriesExhausted {
                attempts: backoff.attempts(),
                source: error,
            });
        };
        self.record(|m| m.retry());
        warn!(
            conn_id = self.id,
            attempt = backoff.attempts(),
            max = backoff.max_retries(),
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Transient I/O error, retrying"
        );
        self.report(EngineError::Io(error));
        if self.pause(delay).await {
            Ok(())
        } else {
            Err(EngineError::ConnectionClosed)
        }
    }

    /// Sleep unless cancelled first. Returns false on cancellation.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Report the error that ends a loop. Exits caused by our own cancellation
    /// are not errors; an idle timeout is reported once even if two loops see it.
    fn report_exit(self: &Arc<Self>, error: EngineError) {
        if self.cancel.is_cancelled() {
            return;
        }
        if matches!(error, EngineError::IdleTimeout) {
            if self.idle_fired.swap(true, Ordering::AcqRel) {
                return;
            }
            self.record(|m| m.idle_timeout());
            info!(conn_id = self.id, idle_ms = self.idle_for().as_millis() as u64, "Idle timeout");
        }
        self.report(error);
    }

    fn report(self: &Arc<Self>, error: EngineError) {
        self.record(|m| {
            m.error();
            if error.kind() == ErrorKind::Protocol {
                m.protocol_error();
            }
        });
        if let Err(panic) = guarded("on_error", || self.handler.on_error(Some(self), &error)) {
            error!(conn_id = self.id, error = %panic, "Handler panicked in on_error");
        }
    }

    fn deliver(self: &Arc<Self>, message: Message) {
        if let Err(panic) = guarded("on_message", || self.handler.on_message(self, message)) {
            error!(conn_id = self.id, error = %panic, "Handler panicked in on_message");
            self.report(panic);
        }
    }

    fn record(&self, f: impl Fn(&Metrics)) {
        f(&self.metrics);
        if let Some(aggregate) = &self.aggregate {
            f(aggregate);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("protocol", &self.protocol.kind())
            .field("state", &self.state())
            .finish()
    }
}
