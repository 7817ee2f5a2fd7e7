#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Edge-case tests for the stream and datagram channels
//! Boundary sizes, buffer-filling bursts, disposal races and peer misbehavior

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use peer_transport::config::{MAX_DATAGRAM_SIZE, MAX_FRAME_SIZE};
use peer_transport::error::TransportError;
use peer_transport::transport::{DatagramSocket, FramedStreamSocket};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::UdpSocket;

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn started_socket() -> (FramedStreamSocket, DuplexStream) {
    let (near, far) = tokio::io::duplex(64 * 1024);
    let (r, w) = tokio::io::split(near);
    let socket = FramedStreamSocket::new(r, w, addr(4000), addr(4001), MAX_FRAME_SIZE).unwrap();
    socket.start();
    (socket, far)
}

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = (payload.len() as u16).to_be_bytes().to_vec();
    out.extend_from_slice(payload);
    out
}

async fn drain_until(socket: &FramedStreamSocket, count: usize) -> Vec<Bytes> {
    let mut frames = Vec::new();
    for _ in 0..200 {
        frames.extend(socket.drain_received());
        if frames.len() >= count {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    frames
}

async fn wait_disposed(socket: &FramedStreamSocket) -> bool {
    for _ in 0..200 {
        if socket.is_disposed() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// ============================================================================
// STREAM RECEIVE EDGE CASES
// ============================================================================

#[tokio::test]
async fn test_hello_split_one_one_five() {
    let (socket, mut far) = started_socket();
    let bytes = frame(b"HELLO");
    assert_eq!(bytes, [0x00, 0x05, b'H', b'E', b'L', b'L', b'O']);

    far.write_all(&bytes[..1]).await.unwrap();
    far.write_all(&bytes[1..2]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(socket.drain_received().is_empty());

    far.write_all(&bytes[2..]).await.unwrap();
    let frames = drain_until(&socket, 1).await;
    assert_eq!(frames, vec![Bytes::from_static(b"HELLO")]);
}

#[tokio::test]
async fn test_two_max_frames_in_one_write() {
    let (socket, mut far) = started_socket();
    let mut burst = frame(&[0xAA; MAX_FRAME_SIZE]);
    burst.extend(frame(&[0xBB; MAX_FRAME_SIZE]));
    assert_eq!(burst.len(), 4096);

    far.write_all(&burst).await.unwrap();
    let frames = drain_until(&socket, 2).await;
    assert_eq!(frames.len(), 2);
    assert!(frames[0].iter().all(|b| *b == 0xAA));
    assert!(frames[1].iter().all(|b| *b == 0xBB));
    assert!(!socket.is_disposed());
}

#[tokio::test]
async fn test_many_max_frames_back_to_back() {
    let (socket, mut far) = started_socket();
    let mut burst = Vec::new();
    for i in 0..10u8 {
        burst.extend(frame(&[i; MAX_FRAME_SIZE]));
    }

    far.write_all(&burst).await.unwrap();
    let frames = drain_until(&socket, 10).await;
    assert_eq!(frames.len(), 10);
    for (i, f) in frames.iter().enumerate() {
        assert_eq!(f.len(), MAX_FRAME_SIZE);
        assert_eq!(f[0], i as u8);
    }
}

#[tokio::test]
async fn test_random_chunking_preserves_frames() {
    use rand::Rng;

    let (socket, mut far) = started_socket();
    let payloads: Vec<Vec<u8>> = (0..40u8).map(|i| vec![i; 1 + (i as usize * 37) % 900]).collect();
    let wire: Vec<u8> = payloads.iter().flat_map(|p| frame(p)).collect();

    let chunks: Vec<usize> = {
        let mut rng = rand::rng();
        let mut sizes = Vec::new();
        let mut total = 0;
        while total < wire.len() {
            let n = rng.random_range(1..=300).min(wire.len() - total);
            sizes.push(n);
            total += n;
        }
        sizes
    };

    let mut offset = 0;
    for n in chunks {
        far.write_all(&wire[offset..offset + n]).await.unwrap();
        offset += n;
        tokio::task::yield_now().await;
    }

    let frames = drain_until(&socket, payloads.len()).await;
    assert_eq!(frames.len(), payloads.len());
    for (got, want) in frames.iter().zip(&payloads) {
        assert_eq!(&got[..], &want[..]);
    }
}

#[tokio::test]
async fn test_violation_after_valid_frame_disposes() {
    let (socket, mut far) = started_socket();
    let mut bytes = frame(b"ok");
    bytes.extend_from_slice(&[0x00, 0x00]);

    far.write_all(&bytes).await.unwrap();
    assert!(wait_disposed(&socket).await);
    // Disposal clears the received queue along with everything else.
    assert!(socket.drain_received().is_empty());
}

#[tokio::test]
async fn test_oversized_declaration_disposes() {
    let (socket, mut far) = started_socket();
    far.write_all(&((MAX_FRAME_SIZE + 1) as u16).to_be_bytes())
        .await
        .unwrap();
    assert!(wait_disposed(&socket).await);
}

#[tokio::test]
async fn test_peer_close_mid_frame_disposes() {
    let (socket, mut far) = started_socket();
    far.write_all(&[0x00, 0x10, 1, 2, 3]).await.unwrap();
    drop(far);
    assert!(wait_disposed(&socket).await);
    assert!(socket.drain_received().is_empty());
}

// ============================================================================
// STREAM SEND EDGE CASES
// ============================================================================

#[tokio::test]
async fn test_send_boundaries() {
    let (socket, mut far) = started_socket();

    assert!(matches!(
        socket.send(vec![0u8; MAX_FRAME_SIZE + 1]),
        Err(TransportError::OversizedFrame(n)) if n == MAX_FRAME_SIZE + 1
    ));
    assert!(matches!(
        socket.send(Bytes::new()),
        Err(TransportError::EmptyFrame)
    ));
    assert_eq!(socket.pending_sends(), 0);
    assert!(!socket.is_send_in_flight());

    socket.send(vec![1u8; MAX_FRAME_SIZE]).unwrap();
    let mut header = [0u8; 2];
    far.read_exact(&mut header).await.unwrap();
    assert_eq!(u16::from_be_bytes(header) as usize, MAX_FRAME_SIZE);
}

#[tokio::test]
async fn test_send_after_dispose_is_refused() {
    let (socket, _far) = started_socket();
    socket.dispose();
    assert!(matches!(
        socket.send(&b"late"[..]),
        Err(TransportError::ConnectionClosed)
    ));
}

#[test]
fn test_limit_errors_are_not_fatal() {
    assert!(!TransportError::EmptyFrame.is_fatal());
    assert!(!TransportError::OversizedFrame(4000).is_fatal());
    assert!(TransportError::InvalidFrameLength(0).is_fatal());
    assert!(TransportError::ConnectionClosed.is_fatal());
}

#[tokio::test]
async fn test_writes_never_interleave() {
    let (socket, mut far) = started_socket();
    let payloads: Vec<Vec<u8>> = (0..50u8).map(|i| vec![i; 100 + i as usize]).collect();
    for p in &payloads {
        socket.send(p.clone()).unwrap();
    }

    for p in &payloads {
        let mut header = [0u8; 2];
        far.read_exact(&mut header).await.unwrap();
        let len = u16::from_be_bytes(header) as usize;
        assert_eq!(len, p.len());
        let mut body = vec![0u8; len];
        far.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, p);
    }
}

// ============================================================================
// DISPOSAL
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_dispose_fires_hook_once() {
    let (socket, far) = started_socket();
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    socket.on_disposed(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let s = socket.clone();
        tasks.push(tokio::spawn(async move { s.dispose() }));
    }
    drop(far);
    for t in tasks {
        t.await.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(socket.is_disposed());
}

#[tokio::test]
async fn test_dispose_during_stalled_write_releases_stream() {
    // A tiny pipe the far end never reads: the max-size frame cannot finish.
    let (near, mut far) = tokio::io::duplex(16);
    let (r, w) = tokio::io::split(near);
    let socket = FramedStreamSocket::new(r, w, addr(4000), addr(4001), MAX_FRAME_SIZE).unwrap();
    socket.start();

    socket.send(vec![7u8; MAX_FRAME_SIZE]).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(socket.is_send_in_flight());

    socket.dispose();
    drop(socket);
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Once both halves are gone the far end sees a broken pipe.
    let result = far.write_all(b"x").await;
    assert!(result.is_err(), "stream still held open after dispose");
}

#[tokio::test]
async fn test_dispose_during_stalled_write_fires_hook() {
    let (near, _far) = tokio::io::duplex(16);
    let (r, w) = tokio::io::split(near);
    let socket = FramedStreamSocket::new(r, w, addr(4000), addr(4001), MAX_FRAME_SIZE).unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    socket.on_disposed(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    socket.send(vec![1u8; MAX_FRAME_SIZE]).unwrap();
    socket.send(vec![2u8; MAX_FRAME_SIZE]).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    socket.dispose();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(socket.pending_sends(), 0);
    assert!(matches!(
        socket.send(&b"late"[..]),
        Err(TransportError::ConnectionClosed)
    ));
}

// ============================================================================
// DATAGRAM EDGE CASES
// ============================================================================

#[tokio::test]
async fn test_oversized_datagram_dropped_on_receive() {
    let socket = DatagramSocket::bind(0, false).await.unwrap();
    socket.start_receiving();
    let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    raw.send_to(&[0u8; MAX_DATAGRAM_SIZE + 1], socket.local_addr())
        .await
        .unwrap();
    raw.send_to(&[7u8; MAX_DATAGRAM_SIZE], socket.local_addr())
        .await
        .unwrap();

    let mut got = Vec::new();
    for _ in 0..100 {
        got.extend(socket.drain_received());
        if !got.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    got.extend(socket.drain_received());

    assert_eq!(got.len(), 1);
    assert_eq!(got[0].0.len(), MAX_DATAGRAM_SIZE);
    assert_eq!(got[0].1, raw.local_addr().unwrap());
    assert!(!socket.is_closed());
}

#[tokio::test]
async fn test_start_receiving_twice_is_harmless() {
    let socket = DatagramSocket::bind(0, false).await.unwrap();
    socket.start_receiving();
    socket.start_receiving();
    assert!(socket.is_receiving());

    let peer = DatagramSocket::bind(0, false).await.unwrap();
    peer.send(b"once", socket.local_addr()).unwrap();

    let mut got = Vec::new();
    for _ in 0..100 {
        got.extend(socket.drain_received());
        if !got.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(got.len(), 1);
}
