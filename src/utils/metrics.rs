//! Observability and Metrics
//!
//! Atomic counters for connections and servers, exposed as point-in-time
//! snapshots. Every `Connection`, `Server` and `Client` owns its own `Metrics`;
//! there is no process-wide instance.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Metrics collector for one connection or one server
#[derive(Debug)]
pub struct Metrics {
    /// Total connections admitted
    pub connections_total: AtomicU64,
    /// Currently registered connections
    pub connections_active: AtomicU64,
    /// Connections accepted and immediately closed by admission control
    pub connections_refused: AtomicU64,
    /// Total messages sent
    pub messages_sent: AtomicU64,
    /// Total messages received
    pub messages_received: AtomicU64,
    /// Total bytes written to sockets
    pub bytes_sent: AtomicU64,
    /// Total bytes read from sockets
    pub bytes_received: AtomicU64,
    /// Errors of any kind reported to the handler
    pub errors: AtomicU64,
    /// Framing errors (bytes discarded)
    pub protocol_errors: AtomicU64,
    /// Retries after transient I/O errors
    pub retries: AtomicU64,
    /// Accumulation buffer resets
    pub buffer_overflows: AtomicU64,
    /// Connections closed for inactivity
    pub idle_timeouts: AtomicU64,
    /// Time spent on the most recent message (unpack or write), in microseconds
    pub message_latency_us: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connections_refused: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            buffer_overflows: AtomicU64::new(0),
            idle_timeouts: AtomicU64::new(0),
            message_latency_us: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a new connection
    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection closed
    pub fn connection_closed(&self) {
        // never wraps below zero even if a close is recorded twice
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    /// Record a connection refused by admission control
    pub fn connection_refused(&self) {
        self.connections_refused.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a message written, with its framed size
    pub fn message_sent(&self, byte_count: u64) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a message parsed off the wire
    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record raw bytes read from the socket
    pub fn bytes_read(&self, byte_count: u64) {
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn buffer_overflow(&self) {
        self.buffer_overflows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn idle_timeout(&self) {
        self.idle_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Overwrite the latency gauge with the duration of the latest message
    pub fn message_latency(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.message_latency_us.store(micros, Ordering::Relaxed);
    }

    /// Zero every counter. The uptime origin is kept.
    pub fn reset(&self) {
        for counter in [
            &self.connections_total,
            &self.connections_active,
            &self.connections_refused,
            &self.messages_sent,
            &self.messages_received,
            &self.bytes_sent,
            &self.bytes_received,
            &self.errors,
            &self.protocol_errors,
            &self.retries,
            &self.buffer_overflows,
            &self.idle_timeouts,
            &self.message_latency_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_refused: self.connections_refused.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            buffer_overflows: self.buffer_overflows.load(Ordering::Relaxed),
            idle_timeouts: self.idle_timeouts.load(Ordering::Relaxed),
            message_latency_us: self.message_latency_us.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            connections_refused = snapshot.connections_refused,
            messages_sent = snapshot.messages_sent,
            messages_received = snapshot.messages_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            errors = snapshot.errors,
            protocol_errors = snapshot.protocol_errors,
            retries = snapshot.retries,
            buffer_overflows = snapshot.buffer_overflows,
            idle_timeouts = snapshot.idle_timeouts,
            message_latency_us = snapshot.message_latency_us,
            uptime_seconds = snapshot.uptime_seconds,
            "Metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub connections_refused: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: u64,
    pub protocol_errors: u64,
    pub retries: u64,
    pub buffer_overflows: u64,
    pub idle_timeouts: u64,
    pub message_latency_us: u64,
    pub uptime_seconds: u64,
}

impl MetricsSnapshot {
    /// Flatten into a name → value map
    pub fn to_map(&self) -> BTreeMap<&'static str, u64> {
        BTreeMap::from([
            ("connections_total", self.connections_total),
            ("connections_active", self.connections_active),
            ("connections_refused", self.connections_refused),
            ("messages_sent", self.messages_sent),
            ("messages_received", self.messages_received),
            ("bytes_sent", self.bytes_sent),
            ("bytes_received", self.bytes_received),
            ("errors", self.errors),
            ("protocol_errors", self.protocol_errors),
            ("retries", self.retries),
            ("buffer_overflows", self.buffer_overflows),
            ("idle_timeouts", self.idle_timeouts),
            ("message_latency_us", self.message_latency_us),
            ("uptime_seconds", self.uptime_seconds),
        ])
    }
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}
