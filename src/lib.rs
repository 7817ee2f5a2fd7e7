//! # peer-transport
//!
//! Peer-to-peer transport for small real-time applications. Every peer
//! connection pairs a reliable, length-framed stream with an optional
//! unreliable datagram route, and callers pick per message which one to use.
//!
//! ## Layout
//! - [`core`]: the 2-byte big-endian length frame codec
//! - [`transport`]: framed stream socket, datagram socket, listener
//! - [`peer`]: the per-connection facade and its identities
//! - [`manager`]: the live connection set, admission and datagram correlation
//! - [`config`], [`error`], [`utils`]: configuration, errors, logging, metrics
//!
//! ## Example
//! ```no_run
//! use peer_transport::manager::ConnectionManager;
//!
//! # async fn run() -> peer_transport::error::Result<()> {
//! let server = ConnectionManager::default();
//! server.listen(7400, 7401, false).await?;
//!
//! let client = ConnectionManager::default();
//! let conn = client.connect("127.0.0.1", 7400).await?;
//! client.open_datagram_channel(&conn, 7401).await?;
//! conn.send(&b"HELLO"[..], true)?;
//!
//! for batch in server.poll_received() {
//!     for message in batch.messages {
//!         println!("{} sent {:?}", batch.connection.id(), message.payload);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod manager;
pub mod peer;
pub mod transport;
pub mod utils;

pub use error::{Result, TransportError};
pub use manager::{ConnectionEvent, ConnectionManager};
pub use peer::{ConnectionId, PeerConnection, ReceivedBatch, ReceivedMessage};
