//! # Core Framing Components
//!
//! Low-level framing for the reliable channel.
//!
//! ## Components
//! - **Codec**: Tokio codec turning a chunked byte stream into discrete frames
//!
//! ## Wire Format
//! ```text
//! [Length(2, big-endian)] [Payload(N)]
//! ```
//!
//! ## Limits
//! - Maximum payload: 2046 bytes (2048-byte working buffer minus header)
//! - Zero-length frames are rejected on both sides

pub mod codec;

pub use codec::FrameCodec;
