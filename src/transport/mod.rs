//! # Transport Layer
//!
//! The I/O-facing building blocks of a peer connection.
//!
//! ## Components
//! - **Stream**: reliable framed channel over an ordered byte stream
//! - **Datagram**: unreliable, connectionless channel shared per manager
//! - **Listener**: non-blocking accept loop feeding the connection manager
//!
//! Every component here is driven by tokio tasks; none of the public methods
//! block except the binds, which are `async`.

use std::sync::{Mutex, MutexGuard};

pub mod datagram;
pub mod listener;
pub mod stream;

pub use datagram::DatagramSocket;
pub use listener::Listener;
pub use stream::FramedStreamSocket;

/// Lock a mutex, recovering the data if a panicking holder poisoned it.
///
/// Every critical section in the transport leaves its data consistent between
/// statements, so a poisoned lock carries no torn state.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
