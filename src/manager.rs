//! # Connection Manager
//!
//! Owns the live set of [`PeerConnection`]s and everything that changes it.
//!
//! ## Lifecycle
//! ```text
//! Connecting ──(published)──> Active ──(stream disposed)──> Closed (removed)
//!      │
//!      └──(connect failed / admission rejected)──> discarded, never published
//! ```
//!
//! A connection leaves the live set only through its stream's dispose hook.
//! Peer close, I/O errors, protocol violations, `disconnect`, and the bulk
//! `disconnect_all` / `remove_where` all end up on that one path.
//!
//! ## Admission
//! Inbound streams are counted against the live connections sharing their
//! remote IP, under the manager lock, at the moment of the decision. With a
//! positive threshold `N`, the `N+1`th concurrent connection from one address
//! is refused: the raw stream is dropped, no record is created and a
//! `Rejected` event is emitted.
//!
//! ## Datagram correlation
//! A client opens its unreliable channel by sending its connection's
//! [`ChallengeToken`](crate::peer::ChallengeToken) as the first datagram. When
//! the server polls, a datagram from an unbound source is treated as a
//! challenge: the token and the source IP must both match an inbound
//! connection, which then routes datagrams to and from that source.
//!
//! ## Notifications
//! Events go out on a `tokio::sync::broadcast` channel. A slow subscriber
//! lags and sees `RecvError::Lagged`; it never holds up other subscribers or
//! the I/O tasks.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::config::TransportConfig;
use crate::error::{constants, Result, TransportError};
use crate::peer::{
    ChallengeToken, ConnectionId, ConnectionState, PeerConnection, ReceivedBatch,
    ReceivedMessage, Role,
};
use crate::transport::lock;
use crate::transport::{DatagramSocket, FramedStreamSocket, Listener};
use crate::utils::metrics::global_metrics;
use crate::utils::timeout::with_timeout;

/// Lifecycle notifications
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// An outbound `connect` succeeded
    Connected(Arc<PeerConnection>),
    /// The listener admitted an inbound connection
    ConnectedFrom(Arc<PeerConnection>),
    /// An outbound `connect` failed; nothing was added
    ConnectFailed {
        host: String,
        port: u16,
        reason: String,
    },
    /// A connection left the live set
    Disconnected {
        id: ConnectionId,
        remote: SocketAddr,
    },
    /// Admission control refused an inbound connection
    Rejected {
        remote: SocketAddr,
        reason: &'static str,
    },
}

struct Shared {
    config: TransportConfig,
    max_duplicate_addresses: AtomicI32,
    allow_remote: AtomicBool,
    live: Mutex<BTreeMap<ConnectionId, Arc<PeerConnection>>>,
    listener: Mutex<Option<Listener>>,
    datagram: Mutex<Option<DatagramSocket>>,
    /// Socket outbound connections send their datagrams from. Independent of
    /// the listening socket so re-listening leaves client routes intact.
    client_datagram: Mutex<Option<DatagramSocket>>,
    events: broadcast::Sender<ConnectionEvent>,
}

/// Owner of all peer connections of one endpoint
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connections", &self.connection_count())
            .field("listen_addr", &self.listen_addr())
            .field("datagram_port", &self.datagram_port())
            .finish()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

impl ConnectionManager {
    pub fn new(config: TransportConfig) -> Self {
        let (events, _) = broadcast::channel(config.server.event_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                max_duplicate_addresses: AtomicI32::new(config.server.max_duplicate_addresses),
                allow_remote: AtomicBool::new(config.server.allow_remote),
                config,
                live: Mutex::new(BTreeMap::new()),
                listener: Mutex::new(None),
                datagram: Mutex::new(None),
                client_datagram: Mutex::new(None),
                events,
            }),
        }
    }

    /// Subscribe to lifecycle notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    /// Current admission threshold; zero or negative means unlimited
    pub fn max_duplicate_addresses(&self) -> i32 {
        self.shared.max_duplicate_addresses.load(Ordering::Relaxed)
    }

    /// Change the admission threshold for future inbound connections
    pub fn set_max_duplicate_addresses(&self, threshold: i32) {
        self.shared
            .max_duplicate_addresses
            .store(threshold, Ordering::Relaxed);
    }

    /// Open an outbound connection.
    ///
    /// Suspends the caller until the stream connects or the configured
    /// connect timeout expires. Failures emit `ConnectFailed` and are also
    /// returned; nothing is added to the live set.
    #[instrument(skip(self))]
    pub async fn connect(&self, host: &str, port: u16) -> Result<Arc<PeerConnection>> {
        let limit = self.shared.config.client.connect_timeout;
        let max_frame = self.shared.config.framing.max_frame_size;

        let attempt = with_timeout(open_stream(host, port), limit)
            .await
            .and_then(|stream| FramedStreamSocket::from_tcp(stream, max_frame));

        let socket = match attempt {
            Ok(socket) => socket,
            Err(e) => {
                global_metrics().connect_failed();
                warn!(host, port, error = %e, "Connect failed");
                self.shared.emit(ConnectionEvent::ConnectFailed {
                    host: host.to_string(),
                    port,
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        let conn = Arc::new(PeerConnection::new(socket, Role::Outbound));
        self.shared.publish(&conn);
        global_metrics().connection_established();
        info!(
            connection = %conn.id(),
            remote = %conn.remote_addr(),
            "Connected"
        );
        self.shared
            .emit(ConnectionEvent::Connected(Arc::clone(&conn)));
        self.shared.activate(&conn);

        if let Some(udp_port) = self.shared.config.client.datagram_port {
            if let Err(e) = self.open_datagram_channel(&conn, udp_port).await {
                warn!(connection = %conn.id(), error = %e, "Datagram channel not opened");
            }
        }

        Ok(conn)
    }

    /// Open the unreliable channel of an outbound connection by sending its
    /// challenge to the server's datagram port.
    pub async fn open_datagram_channel(
        &self,
        conn: &PeerConnection,
        udp_port: u16,
    ) -> Result<()> {
        let server = SocketAddr::new(conn.remote_addr().ip(), udp_port);
        let socket = self.client_datagram(server.ip()).await?;
        socket.connect(server, &conn.token().to_bytes())?;
        conn.bind_datagram(socket, server);
        debug!(
            connection = %conn.id(),
            server = %server,
            token = conn.token().value(),
            "Datagram challenge sent"
        );
        Ok(())
    }

    /// Start (or restart) listening.
    ///
    /// Any previous listener and listening datagram socket are torn down
    /// first; inbound routes bound to the old socket fall back to the stream
    /// until their clients challenge again. Outbound routes are unaffected.
    #[instrument(skip(self))]
    pub async fn listen(&self, tcp_port: u16, udp_port: u16, allow_remote: bool) -> Result<()> {
        let old_listener = lock(&self.shared.listener).take();
        if let Some(old) = old_listener {
            old.dispose();
        }
        let old_datagram = lock(&self.shared.datagram).take();
        if let Some(old) = old_datagram {
            old.close();
        }
        self.shared
            .allow_remote
            .store(allow_remote, Ordering::Relaxed);

        let weak = Arc::downgrade(&self.shared);
        let listener = Listener::bind(tcp_port, allow_remote, move |stream, peer| {
            if let Some(shared) = weak.upgrade() {
                shared.handle_inbound(stream, peer);
            }
        })
        .await?;

        let udp_addr = SocketAddr::new(listener.local_addr().ip(), udp_port);
        let max_datagram = self.shared.config.framing.max_datagram_size;
        let datagram = match DatagramSocket::bind_to(udp_addr, max_datagram).await {
            Ok(datagram) => datagram,
            Err(e) => {
                listener.dispose();
                return Err(e);
            }
        };
        datagram.start_receiving();

        info!(
            tcp = %listener.local_addr(),
            udp = %datagram.local_addr(),
            allow_remote,
            "Listening"
        );
        *lock(&self.shared.listener) = Some(listener);
        *lock(&self.shared.datagram) = Some(datagram);
        Ok(())
    }

    /// Listen on the ports from the server configuration
    pub async fn listen_with_config(&self) -> Result<()> {
        let server = &self.shared.config.server;
        self.listen(server.tcp_port, server.udp_port, server.allow_remote)
            .await
    }

    /// Collect everything that arrived since the last poll.
    ///
    /// Datagrams are serviced first: challenges bind routes, datagrams from
    /// bound sources are delivered as unreliable messages, the rest is
    /// dropped. Then every live connection's decoded frames are collected.
    /// Only connections that produced something appear in the result.
    pub fn poll_received(&self) -> Vec<ReceivedBatch> {
        let live = self.connections();
        let mut batches: BTreeMap<ConnectionId, ReceivedBatch> = BTreeMap::new();

        let mut routes: HashMap<SocketAddr, Arc<PeerConnection>> = live
            .iter()
            .filter_map(|c| c.datagram_remote().map(|remote| (remote, Arc::clone(c))))
            .collect();

        let datagram = lock(&self.shared.datagram).clone();
        if let Some(datagram) = datagram {
            for (payload, from) in datagram.drain_received() {
                if let Some(conn) = routes.get(&from) {
                    push_message(&mut batches, conn, payload, false);
                    continue;
                }
                if let Some(conn) = self.shared.match_challenge(&live, &payload, from, &datagram) {
                    routes.insert(from, conn);
                }
            }
        }

        // Replies to outbound connections; servers never send challenges.
        let client_datagram = lock(&self.shared.client_datagram).clone();
        if let Some(client_datagram) = client_datagram {
            for (payload, from) in client_datagram.drain_received() {
                match routes.get(&from) {
                    Some(conn) => push_message(&mut batches, conn, payload, false),
                    None => {
                        global_metrics().datagram_dropped();
                        debug!(from = %from, "Datagram from unknown server dropped");
                    }
                }
            }
        }

        for conn in &live {
            for frame in conn.drain_frames() {
                push_message(&mut batches, conn, frame, true);
            }
        }

        batches.into_values().collect()
    }

    /// Dispose every live connection
    pub fn disconnect_all(&self) -> usize {
        self.remove_where(|_| true)
    }

    /// Dispose every live connection matching `predicate`.
    ///
    /// Returns how many were disposed. They leave the live set through their
    /// dispose hooks.
    pub fn remove_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&PeerConnection) -> bool,
    {
        let doomed: Vec<Arc<PeerConnection>> = lock(&self.shared.live)
            .values()
            .filter(|c| predicate(c))
            .cloned()
            .collect();

        for conn in &doomed {
            conn.disconnect();
        }
        doomed.len()
    }

    /// Stop listening and drop every connection
    pub fn shutdown(&self) {
        if let Some(listener) = lock(&self.shared.listener).take() {
            listener.dispose();
        }
        if let Some(datagram) = lock(&self.shared.datagram).take() {
            datagram.close();
        }
        if let Some(datagram) = lock(&self.shared.client_datagram).take() {
            datagram.close();
        }
        let closed = self.disconnect_all();
        info!(closed, "Connection manager shut down");
        global_metrics().log_metrics();
    }

    /// Snapshot of the live set, oldest first
    pub fn connections(&self) -> Vec<Arc<PeerConnection>> {
        lock(&self.shared.live).values().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.shared.live).len()
    }

    /// Live connections whose remote IP is `ip`
    pub fn connections_from(&self, ip: IpAddr) -> usize {
        count_from(&lock(&self.shared.live), ip)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<PeerConnection>> {
        lock(&self.shared.live).get(&id).cloned()
    }

    /// Whether a listener is bound and accepting
    pub fn is_listening(&self) -> bool {
        lock(&self.shared.listener)
            .as_ref()
            .is_some_and(Listener::is_alive)
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        lock(&self.shared.listener).as_ref().map(Listener::local_addr)
    }

    /// Local port of the listening datagram socket, once bound
    pub fn datagram_port(&self) -> Option<u16> {
        lock(&self.shared.datagram)
            .as_ref()
            .map(DatagramSocket::local_port)
    }

    /// Local port outbound connections send datagrams from, once bound
    pub fn client_datagram_port(&self) -> Option<u16> {
        lock(&self.shared.client_datagram)
            .as_ref()
            .map(DatagramSocket::local_port)
    }

    /// The datagram socket outbound connections share, bound on first use
    async fn client_datagram(&self, server_ip: IpAddr) -> Result<DatagramSocket> {
        let existing = lock(&self.shared.client_datagram).clone();
        if let Some(existing) = existing {
            if !existing.is_closed() {
                return Ok(existing);
            }
        }

        let local_ip = match (server_ip.is_loopback(), server_ip) {
            (true, IpAddr::V4(_)) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            (true, IpAddr::V6(_)) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            (false, IpAddr::V4(_)) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            (false, IpAddr::V6(_)) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let fresh = DatagramSocket::bind_to(
            SocketAddr::new(local_ip, 0),
            self.shared.config.framing.max_datagram_size,
        )
        .await?;

        let mut slot = lock(&self.shared.client_datagram);
        match slot.as_ref() {
            // Another task bound one while we were binding.
            Some(existing) if !existing.is_closed() => Ok(existing.clone()),
            _ => {
                *slot = Some(fresh.clone());
                Ok(fresh)
            }
        }
    }
}

impl Shared {
    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    /// Insert a freshly wrapped connection into the live set
    fn publish(&self, conn: &Arc<PeerConnection>) {
        let mut live = lock(&self.live);
        insert_live(&mut live, conn);
    }

    /// Hook removal to the stream's disposal and start its I/O
    fn activate(self: &Arc<Self>, conn: &Arc<PeerConnection>) {
        let weak = Arc::downgrade(self);
        let id = conn.id();
        conn.stream().on_disposed(move || {
            if let Some(shared) = weak.upgrade() {
                shared.remove(id);
            }
        });
        conn.stream().start();
    }

    fn remove(&self, id: ConnectionId) {
        let removed = lock(&self.live).remove(&id);
        let Some(conn) = removed else {
            return;
        };
        conn.set_state(ConnectionState::Closed);
        global_metrics().connection_closed();
        info!(
            connection = %id,
            remote = %conn.remote_addr(),
            lifetime_ms = conn.age().as_millis() as u64,
            "Disconnected"
        );
        self.emit(ConnectionEvent::Disconnected {
            id,
            remote: conn.remote_addr(),
        });
    }

    fn handle_inbound(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if !self.allow_remote.load(Ordering::Relaxed) && !peer.ip().is_loopback() {
            self.reject(stream, peer, constants::ERR_REMOTE_NOT_ALLOWED);
            return;
        }

        let threshold = self.max_duplicate_addresses.load(Ordering::Relaxed);
        let max_frame = self.config.framing.max_frame_size;

        let mut live = lock(&self.live);
        if threshold > 0 && count_from(&live, peer.ip()) >= threshold as usize {
            drop(live);
            self.reject(stream, peer, constants::ERR_DUPLICATE_ADDRESS);
            return;
        }

        let socket = match FramedStreamSocket::from_tcp(stream, max_frame) {
            Ok(socket) => socket,
            Err(e) => {
                drop(live);
                warn!(peer = %peer, error = %e, "Could not wrap inbound stream");
                return;
            }
        };
        let conn = Arc::new(PeerConnection::new(socket, Role::Inbound));
        insert_live(&mut live, &conn);
        drop(live);

        global_metrics().connection_accepted();
        info!(
            connection = %conn.id(),
            remote = %peer,
            token = conn.token().value(),
            "Accepted connection"
        );
        self.emit(ConnectionEvent::ConnectedFrom(Arc::clone(&conn)));
        self.activate(&conn);
    }

    fn reject(&self, stream: TcpStream, peer: SocketAddr, reason: &'static str) {
        drop(stream);
        global_metrics().connection_rejected();
        warn!(peer = %peer, reason, "Inbound connection rejected");
        self.emit(ConnectionEvent::Rejected {
            remote: peer,
            reason,
        });
    }

    /// Bind the inbound connection named by a challenge datagram to its source
    fn match_challenge(
        &self,
        live: &[Arc<PeerConnection>],
        payload: &[u8],
        from: SocketAddr,
        datagram: &DatagramSocket,
    ) -> Option<Arc<PeerConnection>> {
        let Some(token) = ChallengeToken::from_bytes(payload) else {
            global_metrics().datagram_dropped();
            warn!(from = %from, bytes = payload.len(), "Datagram from unknown source dropped");
            return None;
        };

        let matched = live.iter().find(|c| {
            c.role() == Role::Inbound && c.token() == token && c.remote_addr().ip() == from.ip()
        });

        match matched {
            Some(conn) => {
                conn.bind_datagram(datagram.clone(), from);
                global_metrics().challenge_matched();
                info!(
                    connection = %conn.id(),
                    datagram_remote = %from,
                    "Datagram channel established"
                );
                Some(Arc::clone(conn))
            }
            None => {
                global_metrics().challenge_rejected();
                warn!(
                    from = %from,
                    token = token.value(),
                    "Challenge matched no connection, dropped"
                );
                None
            }
        }
    }
}

fn insert_live(live: &mut BTreeMap<ConnectionId, Arc<PeerConnection>>, conn: &Arc<PeerConnection>) {
    debug_assert!(
        !live.values().any(|c| c.stream().same_socket(conn.stream())),
        "stream socket already in the live set"
    );
    conn.set_state(ConnectionState::Active);
    live.insert(conn.id(), Arc::clone(conn));
}

fn count_from(live: &BTreeMap<ConnectionId, Arc<PeerConnection>>, ip: IpAddr) -> usize {
    live.values()
        .filter(|c| c.remote_addr().ip() == ip)
        .count()
}

fn push_message(
    batches: &mut BTreeMap<ConnectionId, ReceivedBatch>,
    conn: &Arc<PeerConnection>,
    payload: Bytes,
    reliable: bool,
) {
    batches
        .entry(conn.id())
        .or_insert_with(|| ReceivedBatch {
            connection: Arc::clone(conn),
            messages: Vec::new(),
        })
        .messages
        .push(ReceivedMessage { payload, reliable });
}

async fn open_stream(host: &str, port: u16) -> Result<TcpStream> {
    let addrs = lookup_host((host, port))
        .await
        .map_err(|e| TransportError::AddressResolution(format!("{host}: {e}")))?;

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(address = %addr, error = %e, "Connect attempt failed");
                last_error = Some(e);
            }
        }
    }

    Err(match last_error {
        Some(e) => TransportError::ConnectFailed(e.to_string()),
        None => TransportError::AddressResolution(format!(
            "{host}: {}",
            constants::ERR_NO_ADDRESS
        )),
    })
}
