//! # Listener
//!
//! Perpetually accepts inbound stream connections without blocking anyone.
//!
//! The accept task forwards each accepted stream to a separate handler task
//! over an unbounded channel and immediately re-arms the next accept, so a
//! slow handler never stalls acceptance. A failed accept disposes the
//! listener instead of retrying.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::transport::lock;

struct Inner {
    local_addr: SocketAddr,
    alive: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Accept loop bound to one local stream endpoint
#[derive(Clone)]
pub struct Listener {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.inner.local_addr)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl Listener {
    /// Bind on `port`, start listening and issue the first accept.
    ///
    /// `on_accept` runs on the handler task for every accepted stream, in
    /// accept order.
    #[instrument(skip(on_accept))]
    pub async fn bind<F>(port: u16, allow_remote: bool, on_accept: F) -> Result<Self>
    where
        F: Fn(TcpStream, SocketAddr) + Send + 'static,
    {
        let ip = if allow_remote {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        };
        Self::bind_to(SocketAddr::new(ip, port), on_accept).await
    }

    /// Bind to an explicit local address
    pub async fn bind_to<F>(addr: SocketAddr, on_accept: F) -> Result<Self>
    where
        F: Fn(TcpStream, SocketAddr) + Send + 'static,
    {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "Listening for stream connections");

        let inner = Arc::new(Inner {
            local_addr,
            alive: AtomicBool::new(true),
            tasks: Mutex::new(Vec::with_capacity(2)),
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<(TcpStream, SocketAddr)>();

        let handler = tokio::spawn(async move {
            while let Some((stream, peer)) = rx.recv().await {
                on_accept(stream, peer);
            }
        });
        let acceptor = tokio::spawn(accept_loop(Arc::downgrade(&inner), listener, tx));

        lock(&inner.tasks).extend([acceptor, handler]);

        Ok(Self { inner })
    }

    /// Whether the listening endpoint is still bound
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    /// The bound local address
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Stop accepting and release the endpoint. Idempotent.
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

impl Inner {
    fn dispose(&self) {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        debug!(address = %self.local_addr, "Listener disposed");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

async fn accept_loop(
    inner: Weak<Inner>,
    listener: TcpListener,
    tx: mpsc::UnboundedSender<(TcpStream, SocketAddr)>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "Accepted stream connection");
                if tx.send((stream, peer)).is_err() {
                    // Handler is gone; nobody can take connections any more.
                    if let Some(inner) = inner.upgrade() {
                        inner.dispose();
                    }
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "Accept failed, disposing listener");
                if let Some(inner) = inner.upgrade() {
                    inner.dispose();
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_accepts_every_connection() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let listener = Listener::bind(0, false, move |_stream, peer| {
            assert!(peer.ip().is_loopback());
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

        let mut clients = Vec::new();
        for _ in 0..5 {
            clients.push(TcpStream::connect(listener.local_addr()).await.unwrap());
        }

        for _ in 0..100 {
            if count.load(Ordering::SeqCst) == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 5);
        assert!(listener.is_alive());
    }

    #[tokio::test]
    async fn test_dispose_releases_endpoint() {
        let listener = Listener::bind(0, false, |_, _| {}).await.unwrap();
        let addr = listener.local_addr();
        listener.dispose();
        listener.dispose();
        assert!(!listener.is_alive());

        // The aborted accept task drops the socket on its next poll.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let rebound = Listener::bind_to(addr, |_, _| {}).await;
        assert!(rebound.is_ok());
    }
}
