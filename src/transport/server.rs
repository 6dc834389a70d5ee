//! TCP server: admission control, connection registry and graceful shutdown.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::connection::{Connection, ConnectionIds};
use super::handler::{guarded, Handler};
use crate::config::{ConnectionConfig, EngineConfig, ServerConfig};
use crate::error::{constants, is_transient_io, EngineError, Result};
use crate::protocol::{new_protocol, Message, Protocol};
use crate::utils::{Backoff, Metrics, MetricsSnapshot, Timer};

/// Builder for [`Server`].
///
/// ```no_run
/// # use std::sync::Arc;
/// # use framelink::transport::{LoggingHandler, Server};
/// # async fn run() -> framelink::error::Result<()> {
/// let server = Server::builder("127.0.0.1:9000")
///     .max_connections(100)
///     .handler(Arc::new(LoggingHandler))
///     .build()?;
/// server.start().await?;
/// # Ok(())
/// # }
/// ```
pub struct ServerBuilder {
    config: ServerConfig,
    connection: ConnectionConfig,
    handler: Option<Arc<dyn Handler>>,
    protocol: Option<Arc<dyn Protocol>>,
    ids: Option<Arc<ConnectionIds>>,
}

impl ServerBuilder {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            config: ServerConfig {
                address: address.into(),
                ..ServerConfig::default()
            },
            connection: ConnectionConfig::default(),
            handler: None,
            protocol: None,
            ids: None,
        }
    }

    /// Start from the `[server]` and `[connection]` sections of a loaded config.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            config: config.server.clone(),
            connection: config.connection.clone(),
            handler: None,
            protocol: None,
            ids: None,
        }
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    pub fn connection_config(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Use this framing instead of the one named by the connection config.
    pub fn protocol(mut self, protocol: Arc<dyn Protocol>) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Share an id source with other servers or clients.
    pub fn ids(mut self, ids: Arc<ConnectionIds>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn build(self) -> Result<Server> {
        let mut errors = self.config.validate();
        errors.extend(self.connection.validate());
        if !errors.is_empty() {
            return Err(EngineError::Config(errors.join("; ")));
        }
        let handler = self
            .handler
            .ok_or_else(|| EngineError::Config(constants::ERR_HANDLER_MISSING.to_string()))?;
        let protocol = self.protocol.unwrap_or_else(|| {
            new_protocol(self.connection.protocol, self.connection.max_message_size)
        });

        Ok(Server {
            inner: Arc::new(Inner {
                limit: Arc::new(Semaphore::new(self.config.max_connections)),
                config: self.config,
                connection: Arc::new(self.connection),
                protocol,
                handler,
                ids: self.ids.unwrap_or_default(),
                connections: DashMap::new(),
                metrics: Arc::new(Metrics::new()),
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
                running: AtomicBool::new(false),
                local_addr: Mutex::new(None),
            }),
            accept_task: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }
}

/// Accepts TCP connections and runs each one until it closes or the server stops.
pub struct Server {
    inner: Arc<Inner>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

struct Inner {
    config: ServerConfig,
    connection: Arc<ConnectionConfig>,
    protocol: Arc<dyn Protocol>,
    handler: Arc<dyn Handler>,
    ids: Arc<ConnectionIds>,
    connections: DashMap<u64, Arc<Connection>>,
    metrics: Arc<Metrics>,
    limit: Arc<Semaphore>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    running: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    pub fn builder(address: impl Into<String>) -> ServerBuilder {
        ServerBuilder::new(address)
    }

    /// Bind the configured address and start accepting in the background.
    pub async fn start(&self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.inner.config.address).await?;
        self.start_with_listener(listener)
    }

    /// Start accepting on an already bound listener.
    pub fn start_with_listener(&self, listener: TcpListener) -> Result<SocketAddr> {
        if self.stopped.load(Ordering::Acquire)
            || self.inner.running.swap(true, Ordering::AcqRel)
        {
            return Err(EngineError::Fatal(constants::ERR_SERVER_RUNNING.to_string()));
        }
        let addr = listener.local_addr()?;
        if let Ok(mut slot) = self.inner.local_addr.lock() {
            *slot = Some(addr);
        }
        info!(
            address = %addr,
            protocol = %self.inner.protocol.kind(),
            max_connections = self.inner.config.max_connections,
            "Server listening"
        );

        let inner = Arc::clone(&self.inner);
        let handle = self
            .inner
            .tracker
            .spawn(async move { inner.accept_loop(listener).await });
        if let Ok(mut slot) = self.accept_task.lock() {
            *slot = Some(handle);
        }
        Ok(addr)
    }

    /// Stop accepting, close every connection and wait for their tasks.
    ///
    /// Every caller, including concurrent ones, returns only once the accept
    /// loop and all connection tasks have finished.
    pub async fn stop(&self) {
        let first = !self.stopped.swap(true, Ordering::AcqRel);
        if first {
            info!("Stopping server");
        }
        let _timer = Timer::start("server_stop");
        self.inner.cancel.cancel();

        let handle = self.accept_task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Accept loop aborted");
            }
        }

        // idempotent; a concurrent caller waits on the same tracker
        self.inner.close_all();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.running.store(false, Ordering::Release);
        if first {
            self.inner.metrics.log_metrics();
            info!("Server stopped");
        }
    }

    /// Queue `message` on every open connection. Returns how many accepted it.
    pub fn broadcast(&self, message: &Message) -> Result<usize> {
        let frame = self.inner.protocol.pack(message)?;
        let mut delivered = 0;
        for entry in self.inner.connections.iter() {
            match entry.value().send_frame(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(conn_id = *entry.key(), error = %e, "Broadcast skipped connection"),
            }
        }
        Ok(delivered)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire) && !self.inner.cancel.is_cancelled()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr.lock().ok().and_then(|addr| *addr)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn connection(&self, id: u64) -> Option<Arc<Connection>> {
        self.inner.connections.get(&id).map(|c| Arc::clone(c.value()))
    }

    pub fn connection_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.inner.connections.iter().map(|c| *c.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Aggregate counters across all connections
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn protocol(&self) -> &Arc<dyn Protocol> {
        &self.inner.protocol
    }
}

impl Inner {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut backoff = Backoff::from_config(&self.config.retry);

        loop {
            let permit = Arc::clone(&self.limit).try_acquire_owned().ok();
            let accepted = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                // a slot freed up while we were full
                _ = self.limit.acquire(), if permit.is_none() => continue,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    backoff.reset();
                    match permit {
                        Some(permit) => self.admit(stream, peer, permit),
                        None => {
                            self.refuse(stream, peer);
                            if !self.pause(self.config.refuse_backoff).await {
                                break;
                            }
                        }
                    }
                }
                Err(e) if is_accept_retryable(&e) => match backoff.next_delay() {
                    Some(delay) => {
                        self.metrics.retry();
                        warn!(
                            attempt = backoff.attempts(),
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Accept failed, retrying"
                        );
                        if !self.pause(delay).await {
                            break;
                        }
                    }
                    None => {
                        self.fail(e);
                        break;
                    }
                },
                Err(e) => {
                    self.fail(e);
                    break;
                }
            }
        }
        debug!("Accept loop exited");
    }

    fn admit(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr, permit: OwnedSemaphorePermit) {
        let id = self.ids.next_id();
        let conn = Connection::from_tcp(
            id,
            stream,
            Arc::clone(&self.protocol),
            Arc::clone(&self.handler),
            Arc::clone(&self.connection),
            Some(Arc::clone(&self.metrics)),
        );
        self.connections.insert(id, Arc::clone(&conn));
        self.metrics.connection_established();
        info!(conn_id = id, peer = %peer, "Connection accepted");

        let inner = Arc::clone(self);
        let task_conn = Arc::clone(&conn);
        self.tracker.spawn(async move {
            task_conn.start().await;
            inner.connections.remove(&id);
            inner.metrics.connection_closed();
            drop(permit);
        });

        // stop() may have swept the registry between accept and insert
        if self.cancel.is_cancelled() {
            conn.close();
        }
    }

    fn refuse(&self, stream: TcpStream, peer: SocketAddr) {
        drop(stream);
        self.metrics.connection_refused();
        warn!(
            peer = %peer,
            max_connections = self.config.max_connections,
            "Connection refused: limit reached"
        );
        self.notify(EngineError::TooManyConnections);
    }

    /// Unrecoverable accept failure: report it and shut the server down.
    fn fail(&self, e: io::Error) {
        error!(error = %e, "Accept loop failed, shutting down");
        self.metrics.error();
        self.notify(EngineError::Fatal(format!("{}: {e}", constants::ERR_ACCEPT_FAILED)));
        self.cancel.cancel();
        self.close_all();
        self.running.store(false, Ordering::Release);
    }

    fn notify(&self, error: EngineError) {
        if let Err(panic) = guarded("on_error", || self.handler.on_error(None, &error)) {
            error!(error = %panic, "Handler panicked in on_error");
        }
    }

    /// Close every registered connection. The closes run on the tracker so
    /// `tracker.wait()` also covers their `on_close` callbacks.
    fn close_all(&self) {
        let open: Vec<Arc<Connection>> =
            self.connections.iter().map(|c| Arc::clone(c.value())).collect();
        for conn in open {
            self.tracker.spawn(async move { conn.close() });
        }
    }

    async fn pause(&self, delay: std::time::Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

fn is_accept_retryable(e: &io::Error) -> bool {
    is_transient_io(e)
        || matches!(
            e.kind(),
            io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoggingHandler;

    #[test]
    fn test_build_requires_handler() {
        let err = Server::builder("127.0.0.1:0").build().err().unwrap();
        assert!(matches!(err, EngineError::Config(msg) if msg == constants::ERR_HANDLER_MISSING));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let err = Server::builder("no-port")
            .handler(Arc::new(LoggingHandler))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let server = Server::builder("127.0.0.1:0")
            .handler(Arc::new(LoggingHandler))
            .build()
            .unwrap();
        let addr = server.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert!(server.is_running());
        assert!(matches!(server.start().await, Err(EngineError::Fatal(_))));
        server.stop().await;
        assert!(!server.is_running());
    }

    #[test]
    fn test_retryable_accept_errors() {
        assert!(is_accept_retryable(&io::ErrorKind::ConnectionAborted.into()));
        assert!(is_accept_retryable(&io::ErrorKind::Interrupted.into()));
        assert!(!is_accept_retryable(&io::ErrorKind::PermissionDenied.into()));
    }
}
