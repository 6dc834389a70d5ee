//! Outbound connection with dial retries and a direct request/response mode.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connection::{Connection, ConnectionIds, LoopSet};
use super::handler::{Handler, LoggingHandler};
use crate::config::{ClientConfig, ConnectionConfig, EngineConfig};
use crate::error::{is_transient_io, EngineError, Result};
use crate::protocol::{new_protocol, Message, Protocol};
use crate::utils::timeout::with_timeout_error;
use crate::utils::{Backoff, MetricsSnapshot};

/// A single managed connection to a server.
///
/// Two modes:
/// - [`connect`](Client::connect) runs read and write loops; inbound messages go
///   to the handler.
/// - [`connect_simple`](Client::connect_simple) runs only the write loop so the
///   caller can pull replies with [`simple_receive`](Client::simple_receive).
pub struct Client {
    config: ClientConfig,
    connection: Arc<ConnectionConfig>,
    protocol: Arc<dyn Protocol>,
    handler: Arc<dyn Handler>,
    ids: Arc<ConnectionIds>,
    conn: Mutex<Option<Arc<Connection>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Client for `address` with default settings and a logging handler.
    pub fn new(address: impl Into<String>) -> Self {
        let config = ClientConfig {
            address: address.into(),
            ..ClientConfig::default()
        };
        let connection = ConnectionConfig::default();
        let protocol = new_protocol(connection.protocol, connection.max_message_size);
        Self::assemble(config, connection, protocol, Arc::new(LoggingHandler))
    }

    /// Client built from the `[client]` and `[connection]` sections of a config.
    pub fn from_config(config: &EngineConfig, handler: Arc<dyn Handler>) -> Result<Self> {
        let mut errors = config.client.validate();
        errors.extend(config.connection.validate());
        if !errors.is_empty() {
            return Err(EngineError::Config(errors.join("; ")));
        }
        let protocol = new_protocol(config.connection.protocol, config.connection.max_message_size);
        Ok(Self::assemble(
            config.client.clone(),
            config.connection.clone(),
            protocol,
            handler,
        ))
    }

    fn assemble(
        config: ClientConfig,
        connection: ConnectionConfig,
        protocol: Arc<dyn Protocol>,
        handler: Arc<dyn Handler>,
    ) -> Self {
        Self {
            config,
            connection: Arc::new(connection),
            protocol,
            handler,
            ids: Arc::new(ConnectionIds::new()),
            conn: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn with_protocol(mut self, protocol: Arc<dyn Protocol>) -> Self {
        self.protocol = protocol;
        self
    }

    /// Replace the connection settings; the framing follows `connection.protocol`.
    pub fn with_connection_config(mut self, connection: ConnectionConfig) -> Self {
        self.protocol = new_protocol(connection.protocol, connection.max_message_size);
        self.connection = Arc::new(connection);
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: std::time::Duration) -> Self {
        self.config.max_retries = max_retries;
        self.config.retry_delay = retry_delay;
        self
    }

    pub fn with_ids(mut self, ids: Arc<ConnectionIds>) -> Self {
        self.ids = ids;
        self
    }

    /// Dial and run read and write loops.
    pub async fn connect(&self) -> Result<()> {
        self.open(LoopSet::ReadWrite).await
    }

    /// Dial and run only the write loop, leaving reads to `simple_receive`.
    pub async fn connect_simple(&self) -> Result<()> {
        self.open(LoopSet::WriteOnly).await
    }

    async fn open(&self, loops: LoopSet) -> Result<()> {
        if self.is_connected() {
            return Err(EngineError::AlreadyConnected);
        }
        let stream = self.dial().await?;

        let conn = {
            let mut slot = self
                .conn
                .lock()
                .map_err(|_| EngineError::Fatal("client state poisoned".to_string()))?;
            if slot.as_ref().is_some_and(|c| !c.is_closed()) {
                return Err(EngineError::AlreadyConnected);
            }
            let conn = Connection::from_tcp(
                self.ids.next_id(),
                stream,
                Arc::clone(&self.protocol),
                Arc::clone(&self.handler),
                Arc::clone(&self.connection),
                None,
            );
            *slot = Some(Arc::clone(&conn));
            conn
        };
        info!(conn_id = conn.id(), address = %self.config.address, "Client connected");

        let runner = Arc::clone(&conn);
        let handle = tokio::spawn(async move { runner.run(loops).await });
        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }
        Ok(())
    }

    /// Dial with a per-attempt timeout, retrying refusals and timeouts.
    async fn dial(&self) -> Result<TcpStream> {
        let max_delay = self.connection.retry.max_delay.max(self.config.retry_delay);
        let mut backoff = Backoff::new(self.config.retry_delay, max_delay, self.config.max_retries, 0.0);

        loop {
            let attempt = with_timeout_error(
                async { TcpStream::connect(&self.config.address).await.map_err(EngineError::Io) },
                self.config.connect_timeout,
                EngineError::ConnectTimeout,
            )
            .await;

            let failure = match attempt {
                Ok(stream) => return Ok(stream),
                Err(EngineError::ConnectTimeout) => io::Error::from(io::ErrorKind::TimedOut),
                Err(EngineError::Io(e)) if is_dial_retryable(&e) => e,
                Err(e) => return Err(e),
            };

            match backoff.next_delay() {
                Some(delay) => {
                    warn!(
                        address = %self.config.address,
                        attempt = backoff.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "Dial failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None if backoff.max_retries() == 0 => {
                    return Err(match failure.kind() {
                        io::ErrorKind::TimedOut => EngineError::ConnectTimeout,
                        _ => EngineError::Io(failure),
                    })
                }
                None => {
                    return Err(EngineError::RetriesExhausted {
                        attempts: backoff.attempts(),
                        source: failure,
                    })
                }
            }
        }
    }

    /// Queue a message for the write loop.
    pub fn send(&self, message: &Message) -> Result<()> {
        self.current()?.send(message)
    }

    /// Write a message straight to the socket, waiting until it is flushed.
    pub async fn simple_send(&self, message: &Message) -> Result<()> {
        let conn = self.current()?;
        let frame = self.protocol.pack(message)?;
        conn.write_frame(&frame).await
    }

    /// Read the next message straight off the socket.
    ///
    /// Only available after [`connect_simple`](Client::connect_simple); with a
    /// read loop running this fails with `ReaderBusy`.
    pub async fn simple_receive(&self) -> Result<Message> {
        self.current()?.receive_direct().await
    }

    /// Close the connection and wait for its loops. Safe to repeat.
    pub async fn close(&self) -> Result<()> {
        let conn = self.conn.lock().ok().and_then(|mut slot| slot.take());
        let Some(conn) = conn else {
            return Ok(());
        };
        conn.close();

        let task = self.task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                debug!(error = %e, "Client connection task aborted");
            }
        }
        info!(conn_id = conn.id(), "Client closed");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connection_handle().is_some_and(|c| !c.is_closed())
    }

    pub fn connection_handle(&self) -> Option<Arc<Connection>> {
        self.conn.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.connection_handle().and_then(|c| c.peer_addr())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.connection_handle().and_then(|c| c.local_addr())
    }

    /// Counters for the current connection; zeros when never connected.
    pub fn stats(&self) -> MetricsSnapshot {
        self.connection_handle()
            .map(|c| c.metrics())
            .unwrap_or_default()
    }

    pub fn address(&self) -> &str {
        &self.config.address
    }

    fn current(&self) -> Result<Arc<Connection>> {
        match self.connection_handle() {
            Some(conn) if !conn.is_closed() => Ok(conn),
            _ => Err(EngineError::NotConnected),
        }
    }
}

impl fmt::Display for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_connected() { "connected" } else { "disconnected" };
        write!(
            f,
            "Client({} via {}, {state})",
            self.config.address,
            self.protocol.kind()
        )
    }
}

fn is_dial_retryable(e: &io::Error) -> bool {
    is_transient_io(e)
        || matches!(
            e.kind(),
            io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
        )
}
