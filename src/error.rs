//! # Error Types
//!
//! Error handling for the peer transport.
//!
//! Every fallible operation in the crate returns [`Result`], whose error side is
//! [`TransportError`]. Errors are contained per connection: a fault on one
//! stream disposes that stream and never surfaces through another connection
//! or the manager.
//!
//! ## Error Categories
//! - **Transport faults**: I/O failures, peer resets, graceful closes
//! - **Protocol violations**: zero or oversized declared frame lengths
//! - **Contract violations**: empty or oversized payloads handed to `send`
//! - **Connect failures**: timeouts, unresolvable hosts, refused connections
//! - **Configuration errors**: invalid or unreadable configuration
//!
//! ## Example Usage
//! ```rust
//! use peer_transport::error::{TransportError, Result};
//! use peer_transport::config::MAX_FRAME_SIZE;
//!
//! fn check_payload(payload: &[u8]) -> Result<()> {
//!     if payload.len() > MAX_FRAME_SIZE {
//!         return Err(TransportError::OversizedFrame(payload.len()));
//!     }
//!     Ok(())
//! }
//!
//! assert!(check_payload(&[0u8; 2047]).is_err());
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Connection errors
    pub const ERR_NO_ADDRESS: &str = "Host resolved to no addresses";

    /// Datagram errors
    pub const ERR_NO_DATAGRAM_ROUTE: &str = "Connection has no datagram route";

    /// Admission errors
    pub const ERR_DUPLICATE_ADDRESS: &str = "Too many connections from one address";
    pub const ERR_REMOTE_NOT_ALLOWED: &str = "Remote connections are not allowed";
}

/// TransportError is the primary error type for all transport operations
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Empty payloads cannot be framed")]
    EmptyFrame,

    #[error("Frame too large: {0} bytes")]
    OversizedFrame(usize),

    #[error("Datagram too large: {0} bytes")]
    OversizedDatagram(usize),

    #[error("Invalid frame length declared by peer: {0}")]
    InvalidFrameLength(usize),

    #[error("Connect attempt timed out")]
    ConnectTimeout,

    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Address resolution failed: {0}")]
    AddressResolution(String),

    #[error("Datagram socket is not bound")]
    NotBound,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl TransportError {
    /// Whether this error is fatal to the connection that produced it.
    ///
    /// Contract violations on `send` are reported to the caller and leave the
    /// connection usable; everything the peer or the OS caused is fatal.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            TransportError::EmptyFrame
                | TransportError::OversizedFrame(_)
                | TransportError::OversizedDatagram(_)
        )
    }
}

/// Type alias for Results using TransportError
pub type Result<T> = std::result::Result<T, TransportError>;
