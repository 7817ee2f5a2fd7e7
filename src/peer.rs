//! # Peer Connections
//!
//! [`PeerConnection`] is the surface callers talk to: one logical relationship
//! with a remote endpoint, made of a reliable framed stream and an optional
//! datagram route. `send(bytes, reliable)` hides which of the two a message
//! travels on.
//!
//! ## Identity
//! - [`ConnectionId`]: process-unique, assigned once, never reused
//! - [`ChallengeToken`]: the 4-byte value a client sends as its first
//!   datagram so the server can bind that datagram source to this connection.
//!   It is the client-side port of the stream, which both ends already know.

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::config::CHALLENGE_LEN;
use crate::error::{constants, Result};
use crate::transport::lock;
use crate::transport::{DatagramSocket, FramedStreamSocket};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Token correlating a datagram source with a stream connection
///
/// The value is the client's TCP port as seen on its own end of the stream.
/// The server derives it from the peer address it observes, so the two agree
/// only when no address translation rewrites that port. Behind a
/// port-rewriting NAT the challenge never matches and the connection keeps
/// using the stream for unreliable messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChallengeToken(u32);

impl ChallengeToken {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    /// Token of an outbound connection, from our end of the stream
    pub fn for_outbound(local: SocketAddr) -> Self {
        Self(u32::from(local.port()))
    }

    /// Token of an inbound connection, from the peer's end of the stream
    pub fn for_inbound(peer: SocketAddr) -> Self {
        Self(u32::from(peer.port()))
    }

    pub fn value(self) -> u32 {
        self.0
    }

    /// Big-endian wire form
    pub fn to_bytes(self) -> [u8; CHALLENGE_LEN] {
        self.0.to_be_bytes()
    }

    /// Parse a challenge datagram; anything but exactly four bytes is not one
    pub fn from_bytes(payload: &[u8]) -> Option<Self> {
        let bytes: [u8; CHALLENGE_LEN] = payload.try_into().ok()?;
        Some(Self(u32::from_be_bytes(bytes)))
    }
}

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Stream established, not yet published in the live set
    Connecting,
    /// Live and usable
    Active,
    /// Stream disposed and removed from the live set
    Closed,
}

/// Which side opened the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We called `connect`
    Outbound,
    /// The listener accepted it
    Inbound,
}

/// One message delivered by `poll_received`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub payload: Bytes,
    /// `true` for stream frames, `false` for datagrams
    pub reliable: bool,
}

/// Everything one connection produced in a single poll
#[derive(Debug, Clone)]
pub struct ReceivedBatch {
    pub connection: Arc<PeerConnection>,
    pub messages: Vec<ReceivedMessage>,
}

#[derive(Debug, Clone)]
struct DatagramRoute {
    socket: DatagramSocket,
    remote: SocketAddr,
}

type Tag = Arc<dyn Any + Send + Sync>;

/// A live peer connection
pub struct PeerConnection {
    id: ConnectionId,
    role: Role,
    token: ChallengeToken,
    stream: FramedStreamSocket,
    created_at: Instant,
    state: Mutex<ConnectionState>,
    route: Mutex<Option<DatagramRoute>>,
    latency: Mutex<Option<Duration>>,
    tag: Mutex<Option<Tag>>,
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("remote", &self.remote_addr())
            .field("state", &self.state())
            .field("datagram_remote", &self.datagram_remote())
            .finish()
    }
}

impl PeerConnection {
    pub(crate) fn new(stream: FramedStreamSocket, role: Role) -> Self {
        let token = match role {
            Role::Outbound => ChallengeToken::for_outbound(stream.local_addr()),
            Role::Inbound => ChallengeToken::for_inbound(stream.peer_addr()),
        };
        Self {
            id: ConnectionId::next(),
            role,
            token,
            stream,
            created_at: Instant::now(),
            state: Mutex::new(ConnectionState::Connecting),
            route: Mutex::new(None),
            latency: Mutex::new(None),
            tag: Mutex::new(None),
        }
    }

    /// Send one message. Unreliable messages go out as datagrams while a
    /// datagram route is bound and over the stream otherwise.
    pub fn send(&self, payload: impl Into<Bytes>, reliable: bool) -> Result<()> {
        let payload = payload.into();
        if !reliable {
            let route = {
                let mut slot = lock(&self.route);
                // A closed socket (listener replaced or shut down) no longer
                // carries the route.
                if slot.as_ref().is_some_and(|r| r.socket.is_closed()) {
                    debug!(connection = %self.id, "Datagram route dropped, socket closed");
                    *slot = None;
                }
                slot.clone()
            };
            if let Some(route) = route {
                return route.socket.send(&payload, route.remote);
            }
            trace!(
                connection = %self.id,
                reason = constants::ERR_NO_DATAGRAM_ROUTE,
                "Unreliable message sent over stream"
            );
        }
        self.stream.send(payload)
    }

    /// Close the connection. Removal from the manager follows from the dispose.
    pub fn disconnect(&self) {
        self.stream.dispose();
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn token(&self) -> ChallengeToken {
        self.token
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// Whether the connection is live and its stream still open
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Active && !self.stream.is_disposed()
    }

    /// Remote stream endpoint
    pub fn remote_addr(&self) -> SocketAddr {
        self.stream.peer_addr()
    }

    /// Local stream endpoint
    pub fn local_addr(&self) -> SocketAddr {
        self.stream.local_addr()
    }

    /// Remote endpoint of the datagram route, while bound to an open socket
    pub fn datagram_remote(&self) -> Option<SocketAddr> {
        lock(&self.route)
            .as_ref()
            .filter(|r| !r.socket.is_closed())
            .map(|r| r.remote)
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Time since the connection was established
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Latest latency estimate, if one was recorded
    pub fn latency(&self) -> Option<Duration> {
        *lock(&self.latency)
    }

    /// Record a round-trip measurement; the estimate is smoothed 7/8 old, 1/8 new.
    pub fn record_latency(&self, sample: Duration) {
        let mut latency = lock(&self.latency);
        *latency = Some(match *latency {
            Some(prev) => (prev * 7 + sample) / 8,
            None => sample,
        });
    }

    /// Attach a caller value, replacing any previous one
    pub fn set_tag<T: Any + Send + Sync>(&self, value: T) {
        *lock(&self.tag) = Some(Arc::new(value));
    }

    /// The attached value, if there is one of type `T`
    pub fn tag<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let tag = lock(&self.tag).clone()?;
        tag.downcast::<T>().ok()
    }

    /// Detach the caller value
    pub fn clear_tag(&self) {
        *lock(&self.tag) = None;
    }

    /// The underlying reliable channel
    pub fn stream(&self) -> &FramedStreamSocket {
        &self.stream
    }

    pub(crate) fn bind_datagram(&self, socket: DatagramSocket, remote: SocketAddr) {
        *lock(&self.route) = Some(DatagramRoute { socket, remote });
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    pub(crate) fn drain_frames(&self) -> Vec<Bytes> {
        self.stream.drain_received()
    }
}
