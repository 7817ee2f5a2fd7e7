//! # Datagram Socket
//!
//! The unreliable channel: one UDP socket shared by many connections (a
//! manager's listening socket, or its client socket). It knows nothing about
//! peers; received packets are queued with their source endpoint and
//! demultiplexed by the connection manager.
//!
//! Sends never wait. A packet the OS cannot take right now is dropped, which
//! is within the contract of an unreliable channel.

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::MAX_DATAGRAM_SIZE;
use crate::error::{Result, TransportError};
use crate::transport::lock;
use crate::utils::metrics::global_metrics;

/// A received datagram and where it came from
pub type ReceivedDatagram = (Bytes, SocketAddr);

struct Inner {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    max_datagram_size: usize,
    runtime: Handle,
    closed: AtomicBool,
    received: Mutex<VecDeque<ReceivedDatagram>>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

/// Connectionless, packet-oriented socket bound to one local port
#[derive(Clone)]
pub struct DatagramSocket {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DatagramSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramSocket")
            .field("local_addr", &self.inner.local_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl DatagramSocket {
    /// Bind on `port` (0 for an ephemeral port), on all interfaces when
    /// `allow_remote` is set and on loopback otherwise.
    pub async fn bind(port: u16, allow_remote: bool) -> Result<Self> {
        let ip = if allow_remote {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        };
        Self::bind_to(SocketAddr::new(ip, port), MAX_DATAGRAM_SIZE).await
    }

    /// Bind to an explicit local address with a custom payload limit
    pub async fn bind_to(addr: SocketAddr, max_datagram_size: usize) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| TransportError::Custom(format!("No tokio runtime: {e}")))?;
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        debug!(local = %local_addr, "Datagram socket bound");

        Ok(Self {
            inner: Arc::new(Inner {
                socket: Arc::new(socket),
                local_addr,
                max_datagram_size: max_datagram_size.clamp(1, MAX_DATAGRAM_SIZE),
                runtime,
                closed: AtomicBool::new(false),
                received: Mutex::new(VecDeque::new()),
                recv_task: Mutex::new(None),
            }),
        })
    }

    /// The actually bound local address
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// The actually bound local port
    pub fn local_port(&self) -> u16 {
        self.inner.local_addr.port()
    }

    /// Largest payload `send` accepts
    pub fn max_datagram_size(&self) -> usize {
        self.inner.max_datagram_size
    }

    /// Announce ourselves to `endpoint` with `initial_payload` and make sure
    /// replies will be received.
    pub fn connect(&self, endpoint: SocketAddr, initial_payload: &[u8]) -> Result<()> {
        self.send(initial_payload, endpoint)?;
        self.start_receiving();
        Ok(())
    }

    /// Start the perpetual receive loop. Calling it again is a no-op.
    pub fn start_receiving(&self) {
        if self.is_closed() {
            return;
        }
        let mut task = lock(&self.inner.recv_task);
        if task.is_some() {
            return;
        }
        *task = Some(self.inner.runtime.spawn(recv_loop(
            Arc::downgrade(&self.inner),
            Arc::clone(&self.inner.socket),
            self.inner.max_datagram_size,
        )));
    }

    /// Whether the receive loop has been started
    pub fn is_receiving(&self) -> bool {
        lock(&self.inner.recv_task).is_some() && !self.is_closed()
    }

    /// Transmit one packet to `endpoint` without waiting
    pub fn send(&self, payload: &[u8], endpoint: SocketAddr) -> Result<()> {
        if payload.is_empty() {
            return Err(TransportError::EmptyFrame);
        }
        if payload.len() > self.inner.max_datagram_size {
            return Err(TransportError::OversizedDatagram(payload.len()));
        }
        if self.is_closed() {
            return Err(TransportError::NotBound);
        }

        match self.inner.socket.try_send_to(payload, endpoint) {
            Ok(_) => {
                global_metrics().datagram_sent();
                trace!(to = %endpoint, bytes = payload.len(), "Datagram sent");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                global_metrics().datagram_dropped();
                trace!(to = %endpoint, "Datagram dropped, socket busy");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Return and clear every datagram received since the last call
    pub fn drain_received(&self) -> Vec<ReceivedDatagram> {
        lock(&self.inner.received).drain(..).collect()
    }

    /// Stop receiving and refuse further sends. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Whether the socket has been closed
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl Inner {
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = lock(&self.recv_task).take() {
            task.abort();
        }
        lock(&self.received).clear();
        debug!(local = %self.local_addr, "Datagram socket closed");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(mut task) = self.recv_task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

async fn recv_loop(inner: Weak<Inner>, socket: Arc<UdpSocket>, max_datagram_size: usize) {
    // One spare byte tells an oversized datagram apart from a full one.
    let mut buf = vec![0u8; max_datagram_size + 1];

    loop {
        let result = socket.recv_from(&mut buf).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };

        match result {
            Ok((n, from)) if n > max_datagram_size => {
                global_metrics().datagram_dropped();
                warn!(from = %from, "Oversized datagram dropped");
            }
            Ok((0, from)) => {
                trace!(from = %from, "Empty datagram ignored");
            }
            Ok((n, from)) => {
                global_metrics().datagram_received();
                lock(&inner.received).push_back((Bytes::copy_from_slice(&buf[..n]), from));
            }
            // ICMP port-unreachable from an earlier send; not fatal.
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                trace!(error = %e, "Ignoring connection reset on datagram socket");
            }
            Err(e) => {
                warn!(local = %inner.local_addr, error = %e, "Datagram receive failed, closing");
                inner.close();
                return;
            }
        }
    }
}
