//! # Framed Stream Socket
//!
//! The reliable channel of one peer connection: an ordered byte stream
//! (normally TCP) carrying `[u16 length][payload]` frames.
//!
//! ## Send pipeline
//! At most one write is in flight per socket. `send` either starts a flush
//! task (when idle) or appends to the FIFO queue; the flush task drains the
//! queue in order before going idle again, so frames leave in call order and
//! never interleave. The writer is taken out of its slot by the flush task and
//! put back before the in-flight flag clears.
//!
//! ## Receive path
//! A read task owns a fixed accumulation buffer sized for one full max-size
//! frame plus one partial one. Each completion appends bytes, then decodes as
//! many whole frames as are present; a trailing partial frame stays in place
//! and is compacted to the front before the next read.
//!
//! ## Disposal
//! A zero-length read, an I/O error, a protocol violation or an explicit
//! [`FramedStreamSocket::dispose`] tears the socket down: both queues are
//! cleared, the read task and any in-flight write are aborted, and the
//! one-shot dispose hook fires. Disposal is
//! idempotent and safe from any thread.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::{BufMut, Bytes, BytesMut};
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, FramedWrite};
use tracing::{debug, error, trace, warn};

use crate::config::RECEIVE_BUFFER_SIZE;
use crate::core::codec::FrameCodec;
use crate::error::{Result, TransportError};
use crate::transport::lock;
use crate::utils::metrics::global_metrics;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, FrameCodec>;
type DisposeHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct SendState {
    queue: VecDeque<Bytes>,
    in_flight: bool,
    flush_task: Option<JoinHandle<()>>,
}

struct Inner {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    codec: FrameCodec,
    runtime: Handle,
    disposed: AtomicBool,
    reader: Mutex<Option<BoxedReader>>,
    writer: Mutex<Option<BoxedWriter>>,
    send: Mutex<SendState>,
    received: Mutex<VecDeque<Bytes>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    on_disposed: Mutex<Option<DisposeHook>>,
}

/// Reliable, ordered, message-framed channel over a byte stream
#[derive(Clone)]
pub struct FramedStreamSocket {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for FramedStreamSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedStreamSocket")
            .field("local_addr", &self.inner.local_addr)
            .field("peer_addr", &self.inner.peer_addr)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl FramedStreamSocket {
    /// Wrap a connected TCP stream. I/O does not begin until [`start`](Self::start).
    pub fn from_tcp(stream: TcpStream, max_frame_size: usize) -> Result<Self> {
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Self::new(reader, writer, local_addr, peer_addr, max_frame_size)
    }

    /// Wrap arbitrary stream halves.
    ///
    /// Must be called from within a tokio runtime; the socket spawns its I/O
    /// tasks on that runtime.
    pub fn new<R, W>(
        reader: R,
        writer: W,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        max_frame_size: usize,
    ) -> Result<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let runtime = Handle::try_current()
            .map_err(|e| TransportError::Custom(format!("No tokio runtime: {e}")))?;
        let codec = FrameCodec::new(max_frame_size);
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);

        Ok(Self {
            inner: Arc::new(Inner {
                local_addr,
                peer_addr,
                codec,
                runtime,
                disposed: AtomicBool::new(false),
                reader: Mutex::new(Some(Box::new(reader))),
                writer: Mutex::new(Some(FramedWrite::new(writer, codec))),
                send: Mutex::new(SendState::default()),
                received: Mutex::new(VecDeque::new()),
                read_task: Mutex::new(None),
                on_disposed: Mutex::new(None),
            }),
        })
    }

    /// Arm the receive loop. Calling it again is a no-op.
    pub fn start(&self) {
        let Some(reader) = lock(&self.inner.reader).take() else {
            return;
        };
        if self.is_disposed() {
            return;
        }

        let task = self.inner.runtime.spawn(read_loop(
            Arc::downgrade(&self.inner),
            reader,
            self.inner.codec,
            self.inner.peer_addr,
        ));

        *lock(&self.inner.read_task) = Some(task);
        // dispose() may have raced in between; it could not see the handle yet.
        if self.is_disposed() {
            if let Some(task) = lock(&self.inner.read_task).take() {
                task.abort();
            }
        }
    }

    /// Queue a frame for sending. Returns immediately.
    ///
    /// Empty payloads and payloads over the frame limit are rejected before
    /// anything is written.
    pub fn send(&self, payload: impl Into<Bytes>) -> Result<()> {
        let payload = payload.into();
        self.inner.codec.check_payload(payload.len())?;

        let mut state = lock(&self.inner.send);
        // dispose() takes this lock after setting the flag.
        if self.is_disposed() {
            return Err(TransportError::ConnectionClosed);
        }
        if state.in_flight {
            state.queue.push_back(payload);
            return Ok(());
        }
        state.in_flight = true;
        // Spawned under the lock so dispose always sees the current handle.
        state.flush_task = Some(
            self.inner
                .runtime
                .spawn(flush(Arc::clone(&self.inner), payload)),
        );
        Ok(())
    }

    /// Return and clear every frame decoded since the last call
    pub fn drain_received(&self) -> Vec<Bytes> {
        lock(&self.inner.received).drain(..).collect()
    }

    /// Register the one-shot dispose notification, replacing any earlier one.
    ///
    /// If the socket is already disposed the hook runs immediately.
    pub fn on_disposed<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *lock(&self.inner.on_disposed) = Some(Box::new(hook));
        if self.is_disposed() {
            let hook = lock(&self.inner.on_disposed).take();
            if let Some(hook) = hook {
                hook();
            }
        }
    }

    /// Tear the socket down. Idempotent.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    /// Whether the socket has been disposed
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Local endpoint of the stream
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Remote endpoint of the stream
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    /// Largest payload `send` accepts
    pub fn max_frame_size(&self) -> usize {
        self.inner.codec.max_frame_size()
    }

    /// Frames waiting behind the in-flight write
    pub fn pending_sends(&self) -> usize {
        lock(&self.inner.send).queue.len()
    }

    /// Whether a flush is currently writing
    pub fn is_send_in_flight(&self) -> bool {
        lock(&self.inner.send).in_flight
    }

    /// Whether two handles wrap the same underlying stream
    pub fn same_socket(&self, other: &FramedStreamSocket) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Inner {
    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let flush_task = {
            let mut state = lock(&self.send);
            state.queue.clear();
            state.flush_task.take()
        };
        // A write stalled behind a peer that stopped reading never completes;
        // aborting drops the checked-out writer and closes our half.
        if let Some(task) = flush_task {
            task.abort();
        }
        lock(&self.received).clear();
        drop(lock(&self.writer).take());
        drop(lock(&self.reader).take());
        if let Some(task) = lock(&self.read_task).take() {
            task.abort();
        }

        debug!(peer = %self.peer_addr, "Stream socket disposed");

        let hook = lock(&self.on_disposed).take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(mut task) = self.read_task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

/// Write `first` and then everything queued behind it, in order.
async fn flush(inner: Arc<Inner>, first: Bytes) {
    let Some(mut writer) = lock(&inner.writer).take() else {
        // Disposed before the flush got going.
        return;
    };

    let mut payload = first;
    loop {
        if inner.disposed.load(Ordering::Acquire) {
            return;
        }

        let len = payload.len();
        if let Err(e) = writer.send(payload).await {
            warn!(peer = %inner.peer_addr, error = %e, "Stream write failed");
            drop(writer);
            inner.dispose();
            return;
        }
        global_metrics().frame_sent(len as u64);
        trace!(peer = %inner.peer_addr, bytes = len, "Frame written");

        let mut state = lock(&inner.send);
        match state.queue.pop_front() {
            Some(next) => payload = next,
            None => {
                // Writer goes back before the flag clears so the next
                // flush always finds it.
                *lock(&inner.writer) = Some(writer);
                state.in_flight = false;
                state.flush_task = None;
                break;
            }
        }
    }

    // A dispose that ran while the writer was checked out could not close it.
    if inner.disposed.load(Ordering::Acquire) {
        drop(lock(&inner.writer).take());
    }
}

async fn read_loop(
    inner: Weak<Inner>,
    mut reader: BoxedReader,
    mut codec: FrameCodec,
    peer: SocketAddr,
) {
    let mut buf = BytesMut::with_capacity(RECEIVE_BUFFER_SIZE);

    loop {
        // Moves any partial frame back to the front of the allocation.
        buf.reserve(RECEIVE_BUFFER_SIZE - buf.len());
        let room = RECEIVE_BUFFER_SIZE - buf.len();

        let read = {
            let mut window = (&mut buf).limit(room);
            reader.read_buf(&mut window).await
        };

        let Some(inner) = inner.upgrade() else {
            return;
        };

        let n = match read {
            Ok(0) => {
                debug!(peer = %peer, "Peer closed stream");
                inner.dispose();
                return;
            }
            Ok(n) => n,
            Err(e) => {
                debug!(peer = %peer, error = %e, "Stream read failed");
                inner.dispose();
                return;
            }
        };
        trace!(peer = %peer, bytes = n, buffered = buf.len(), "Read completion");

        let mut frames = Vec::new();
        let violation = loop {
            match codec.decode(&mut buf) {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break None,
                Err(e) => break Some(e),
            }
        };

        if !frames.is_empty() {
            let metrics = global_metrics();
            for frame in &frames {
                metrics.frame_received(frame.len() as u64);
            }
            lock(&inner.received).extend(frames);
        }

        if let Some(e) = violation {
            error!(peer = %peer, error = %e, "Protocol violation, closing connection");
            global_metrics().protocol_error();
            inner.dispose();
            return;
        }
    }
}
