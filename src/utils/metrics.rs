//! Observability and Metrics
//!
//! This module provides metrics collection for monitoring transport health:
//! admission decisions, per-channel traffic, challenge correlation and
//! protocol violations.
//!
//! Uses atomic counters for thread-safe metrics collection. I/O tasks record
//! into the process-wide instance returned by [`global_metrics`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Metrics collector for transport operations
#[derive(Debug)]
pub struct Metrics {
    /// Outbound connects that succeeded
    pub connections_established: AtomicU64,
    /// Inbound connections admitted
    pub connections_accepted: AtomicU64,
    /// Currently live connections
    pub connections_active: AtomicU64,
    /// Inbound connections refused by admission control
    pub connections_rejected: AtomicU64,
    /// Outbound connects that failed or timed out
    pub connect_failures: AtomicU64,
    /// Frames written to streams
    pub frames_sent: AtomicU64,
    /// Frames decoded from streams
    pub frames_received: AtomicU64,
    /// Payload bytes written to streams
    pub bytes_sent: AtomicU64,
    /// Payload bytes decoded from streams
    pub bytes_received: AtomicU64,
    /// Datagrams transmitted
    pub datagrams_sent: AtomicU64,
    /// Datagrams queued for delivery
    pub datagrams_received: AtomicU64,
    /// Datagrams discarded (oversized, unroutable, send would block)
    pub datagrams_dropped: AtomicU64,
    /// Challenges bound to a live connection
    pub challenges_matched: AtomicU64,
    /// Challenges that matched nothing
    pub challenges_rejected: AtomicU64,
    /// Protocol violations committed by peers
    pub protocol_errors: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_established: AtomicU64::new(0),
            connections_accepted: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            datagrams_sent: AtomicU64::new(0),
            datagrams_received: AtomicU64::new(0),
            datagrams_dropped: AtomicU64::new(0),
            challenges_matched: AtomicU64::new(0),
            challenges_rejected: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a successful outbound connect
    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an admitted inbound connection
    pub fn connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection leaving the live set
    pub fn connection_closed(&self) {
        // Saturate instead of wrapping if a caller double-reports.
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Record an admission rejection
    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed outbound connect
    pub fn connect_failed(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame written to a stream
    pub fn frame_sent(&self, byte_count: u64) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a frame decoded from a stream
    pub fn frame_received(&self, byte_count: u64) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a transmitted datagram
    pub fn datagram_sent(&self) {
        self.datagrams_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a queued datagram
    pub fn datagram_received(&self) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a discarded datagram
    pub fn datagram_dropped(&self) {
        self.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a matched challenge
    pub fn challenge_matched(&self) {
        self.challenges_matched.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an unmatched challenge
    pub fn challenge_rejected(&self) {
        self.challenges_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a protocol error
    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_established: self.connections_established.load(Ordering::Relaxed),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            datagrams_sent: self.datagrams_sent.load(Ordering::Relaxed),
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            datagrams_dropped: self.datagrams_dropped.load(Ordering::Relaxed),
            challenges_matched: self.challenges_matched.load(Ordering::Relaxed),
            challenges_rejected: self.challenges_rejected.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let s = self.snapshot();
        info!(
            connections_established = s.connections_established,
            connections_accepted = s.connections_accepted,
            connections_active = s.connections_active,
            connections_rejected = s.connections_rejected,
            connect_failures = s.connect_failures,
            frames_sent = s.frames_sent,
            frames_received = s.frames_received,
            bytes_sent = s.bytes_sent,
            bytes_received = s.bytes_received,
            datagrams_sent = s.datagrams_sent,
            datagrams_received = s.datagrams_received,
            datagrams_dropped = s.datagrams_dropped,
            challenges_matched = s.challenges_matched,
            challenges_rejected = s.challenges_rejected,
            protocol_errors = s.protocol_errors,
            uptime_seconds = s.uptime_seconds,
            "Transport metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_established: u64,
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connections_rejected: u64,
    pub connect_failures: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    pub datagrams_dropped: u64,
    pub challenges_matched: u64,
    pub challenges_rejected: u64,
    pub protocol_errors: u64,
    pub uptime_seconds: u64,
}

static METRICS: once_cell::sync::Lazy<Metrics> = once_cell::sync::Lazy::new(Metrics::new);

/// Get the global metrics instance
pub fn global_metrics() -> &'static Metrics {
    &METRICS
}
