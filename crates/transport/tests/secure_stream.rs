//! Integration tests for the encrypted message stream.
//!
//! These tests cover:
//! - Handshake, echo and end-of-stream behaviour
//! - Large transfers under backpressure
//! - Keep-alive, timeout, flush and destroy
//! - Precomputed handshakes and the IK pattern
//! - The unordered side channel and content size hints

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use protocol::{FrameParser, HandshakeResult, KeyPair, Pattern, ProtocolError, StreamHandshake};
use tokio::io::{duplex, AsyncWriteExt};
use tokio::time::timeout;
use transport::memory::raw_pair;
use transport::{SecureStream, StartOptions, StreamInfo, StreamObserver, StreamOptions};

const WAIT: Duration = Duration::from_secs(10);

fn connected_pair(initiator: StreamOptions, responder: StreamOptions) -> (SecureStream, SecureStream) {
    let (a, b) = duplex(64 * 1024);
    (
        SecureStream::new(true, a, initiator).unwrap(),
        SecureStream::new(false, b, responder).unwrap(),
    )
}

fn default_pair() -> (SecureStream, SecureStream) {
    connected_pair(StreamOptions::default(), StreamOptions::default())
}

async fn recv(stream: &SecureStream) -> Bytes {
    timeout(WAIT, stream.recv())
        .await
        .expect("timed out")
        .unwrap()
        .expect("stream ended")
}

/// Runs a handshake in memory and returns both results.
fn precompute(initiator: KeyPair, responder: KeyPair) -> (HandshakeResult, HandshakeResult) {
    let mut ends = [
        StreamHandshake::new(true, initiator, None, Pattern::XX, None).unwrap(),
        StreamHandshake::new(false, responder, None, Pattern::XX, None).unwrap(),
    ];
    let mut results: [Option<HandshakeResult>; 2] = [None, None];
    let mut parser = FrameParser::new();

    let step = ends[0].start().unwrap();
    results[0] = step.complete;
    let mut wire = step.reply;
    let mut receiver = 1;
    while let Some(frame) = wire.take() {
        let message = parser.push(Bytes::from(frame)).unwrap().remove(0);
        let step = ends[receiver].recv(&message).unwrap();
        if step.complete.is_some() {
            results[receiver] = step.complete;
        }
        wire = step.reply;
        receiver = 1 - receiver;
    }
    let [a, b] = results;
    (a.unwrap(), b.unwrap())
}

/// Sends `total` bytes in 64 KiB messages, respecting backpressure.
async fn transfer(total: usize) {
    const CHUNK: usize = 64 * 1024;
    let (a, b) = default_pair();

    let reader = tokio::spawn(async move {
        let mut received = 0usize;
        let mut index = 0usize;
        while let Some(message) = b.recv().await.unwrap() {
            assert_eq!(message.len(), CHUNK);
            assert!(message.iter().all(|byte| *byte == (index % 251) as u8));
            received += message.len();
            index += 1;
        }
        received
    });

    for index in 0..total / CHUNK {
        if !a.write(vec![(index % 251) as u8; CHUNK]).unwrap() {
            assert!(a.drained().await);
        }
    }
    a.end();
    assert_eq!(reader.await.unwrap(), total);
}

// =============================================================================
// Connection Tests
// =============================================================================

#[tokio::test]
async fn test_echo() {
    let (a, b) = default_pair();
    a.write(&b"ping"[..]).unwrap();
    let ping = recv(&b).await;
    assert_eq!(ping, &b"ping"[..]);

    b.write(Bytes::from(format!("echo: {}", String::from_utf8_lossy(&ping))))
        .unwrap();
    assert_eq!(recv(&a).await, &b"echo: ping"[..]);

    assert!(a.is_connected());
    assert!(a.is_initiator());
    assert!(!b.is_initiator());
    assert_eq!(a.remote_public_key(), Some(b.public_key()));
    assert_eq!(b.remote_public_key(), Some(a.public_key()));
}

#[tokio::test]
async fn test_empty_message_delivered_without_keep_alive() {
    let (a, b) = default_pair();
    a.write(Bytes::new()).unwrap();
    a.write(&b"after"[..]).unwrap();
    assert!(recv(&b).await.is_empty());
    assert_eq!(recv(&b).await, &b"after"[..]);
}

#[tokio::test]
async fn test_end_on_both_sides_closes_cleanly() {
    let (a, b) = default_pair();
    a.write(&b"last words"[..]).unwrap();
    a.end();
    assert_eq!(recv(&b).await, &b"last words"[..]);
    assert_eq!(timeout(WAIT, b.recv()).await.unwrap().unwrap(), None);

    b.end();
    assert_eq!(timeout(WAIT, a.recv()).await.unwrap().unwrap(), None);
    timeout(WAIT, a.closed()).await.unwrap().unwrap();
    timeout(WAIT, b.closed()).await.unwrap().unwrap();

    assert_eq!(a.raw_bytes_written(), b.raw_bytes_read());
    assert_eq!(b.raw_bytes_written(), a.raw_bytes_read());
    assert!(a.raw_bytes_written() > 0);
    assert!(a.write(&b"late"[..]).is_err());
}

#[tokio::test]
async fn test_transfer_16_mib() {
    transfer(16 * 1024 * 1024).await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "slow: moves a gibibyte through the cipher"]
async fn test_transfer_1_gib() {
    transfer(1024 * 1024 * 1024).await;
}

#[tokio::test]
async fn test_garbage_fails_handshake() {
    let (raw, mut other) = duplex(128 * 1024);
    let stream = SecureStream::new(false, raw, StreamOptions::default()).unwrap();

    let _ = other.write_all(&[0xFF; 64 * 1024]).await;

    let result = timeout(WAIT, stream.closed()).await.unwrap();
    assert!(matches!(result, Err(ProtocolError::HandshakeFailed(_))));
    assert!(!stream.opened().await);
}

#[tokio::test]
async fn test_peer_gone_before_handshake() {
    let (raw, other) = duplex(1024);
    let stream = SecureStream::new(true, raw, StreamOptions::default()).unwrap();
    drop(other);

    let result = timeout(WAIT, stream.closed()).await.unwrap();
    assert!(result.is_err());
}

#[tokio::test]
async fn test_ik_pattern_with_known_responder() {
    let responder_keys = KeyPair::generate();
    let responder_public = *responder_keys.public_key();
    let (a, b) = connected_pair(
        StreamOptions {
            pattern: Pattern::IK,
            remote_public_key: Some(responder_public),
            ..StreamOptions::default()
        },
        StreamOptions {
            pattern: Pattern::IK,
            key_pair: Some(responder_keys),
            ..StreamOptions::default()
        },
    );

    assert!(timeout(WAIT, a.opened()).await.unwrap());
    assert!(timeout(WAIT, b.opened()).await.unwrap());
    assert_eq!(b.public_key(), responder_public);
    assert_eq!(b.remote_public_key(), Some(a.public_key()));
    assert_eq!(a.handshake_hash(), b.handshake_hash());
}

#[tokio::test]
async fn test_precomputed_handshake() {
    let (a_keys, b_keys) = (KeyPair::generate(), KeyPair::generate());
    let (a_result, b_result) = precompute(a_keys.clone(), b_keys.clone());
    assert_eq!(a_result.hash, b_result.hash);

    let (a_raw, b_raw) = duplex(64 * 1024);
    let a = SecureStream::unstarted(
        true,
        StreamOptions {
            key_pair: Some(a_keys),
            ..StreamOptions::default()
        },
    );
    let b = SecureStream::unstarted(
        false,
        StreamOptions {
            key_pair: Some(b_keys),
            ..StreamOptions::default()
        },
    );
    a.write(&b"queued before start"[..]).unwrap();

    a.start(
        a_raw,
        StartOptions {
            handshake: Some(a_result.clone()),
            ..StartOptions::default()
        },
    )
    .unwrap();
    b.start(
        b_raw,
        StartOptions {
            handshake: Some(b_result),
            ..StartOptions::default()
        },
    )
    .unwrap();

    assert_eq!(recv(&b).await, &b"queued before start"[..]);
    assert_eq!(a.handshake_hash(), Some(a_result.hash));
    assert_eq!(a.remote_public_key(), a_result.remote_public_key);
}

#[tokio::test]
async fn test_stream_id_mismatch_destroys() {
    let (a_keys, b_keys) = (KeyPair::generate(), KeyPair::generate());
    let (a_result, mut b_result) = precompute(a_keys, b_keys);
    b_result.hash[0] ^= 0xff;

    let (a_raw, b_raw) = duplex(64 * 1024);
    let a = SecureStream::unstarted(true, StreamOptions::default());
    let b = SecureStream::unstarted(false, StreamOptions::default());
    a.start(
        a_raw,
        StartOptions {
            handshake: Some(a_result),
            ..StartOptions::default()
        },
    )
    .unwrap();
    b.start(
        b_raw,
        StartOptions {
            handshake: Some(b_result),
            ..StartOptions::default()
        },
    )
    .unwrap();

    assert!(!timeout(WAIT, b.opened()).await.unwrap());
    let result = timeout(WAIT, b.closed()).await.unwrap();
    assert!(matches!(result, Err(ProtocolError::InvalidHeader(_))));
    assert!(matches!(b.error(), Some(ProtocolError::InvalidHeader(_))));
    assert!(b.is_destroyed());
}

#[tokio::test]
async fn test_observer_sees_lifecycle() {
    #[derive(Default)]
    struct Counter {
        handshakes: AtomicUsize,
        connects: AtomicUsize,
        closes: AtomicUsize,
    }

    impl StreamObserver for Counter {
        fn on_handshake(&self, _info: &StreamInfo) {
            self.handshakes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_connect(&self, info: &StreamInfo) {
            assert!(info.handshake_hash.is_some());
            self.connects.fetch_add(1, Ordering::SeqCst);
        }

        fn on_close(&self, _error: Option<&ProtocolError>) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    let counter = Arc::new(Counter::default());
    let observer: Arc<dyn StreamObserver> = counter.clone();
    let (a, _b) = connected_pair(
        StreamOptions {
            observer: Some(observer),
            ..StreamOptions::default()
        },
        StreamOptions::default(),
    );
    assert!(timeout(WAIT, a.opened()).await.unwrap());
    a.destroy(None);
    let _ = timeout(WAIT, a.closed()).await.unwrap();

    assert_eq!(counter.handshakes.load(Ordering::SeqCst), 1);
    assert_eq!(counter.connects.load(Ordering::SeqCst), 1);
    assert_eq!(counter.closes.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Timer Tests
// =============================================================================

#[tokio::test]
async fn test_keep_alive_prevents_timeout() {
    let options = || StreamOptions {
        keep_alive: Duration::from_millis(20),
        timeout: Duration::from_millis(200),
        ..StreamOptions::default()
    };
    let (a, b) = connected_pair(options(), options());
    assert!(timeout(WAIT, a.opened()).await.unwrap());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(a.is_connected());
    assert!(b.is_connected());

    // Keep-alives are never surfaced as messages.
    a.write(&b"still here"[..]).unwrap();
    assert_eq!(recv(&b).await, &b"still here"[..]);
}

#[tokio::test]
async fn test_inactivity_timeout() {
    let (a, b) = connected_pair(
        StreamOptions::default(),
        StreamOptions {
            timeout: Duration::from_millis(100),
            ..StreamOptions::default()
        },
    );
    assert!(timeout(WAIT, a.opened()).await.unwrap());

    let result = timeout(WAIT, b.closed()).await.unwrap();
    assert!(matches!(result, Err(ProtocolError::Timeout(_))));
    assert!(matches!(b.error(), Some(ProtocolError::Timeout(_))));
}

#[tokio::test]
async fn test_timeout_set_after_connect() {
    let (a, b) = default_pair();
    assert!(timeout(WAIT, b.opened()).await.unwrap());
    b.set_timeout(Duration::from_millis(50));
    a.set_keep_alive(Duration::ZERO);

    let result = timeout(WAIT, b.closed()).await.unwrap();
    assert!(matches!(result, Err(ProtocolError::Timeout(_))));
}

// =============================================================================
// Flush and Destroy Tests
// =============================================================================

#[tokio::test]
async fn test_flush_waits_for_connection() {
    let (a, b) = default_pair();
    a.write(&b"flushed"[..]).unwrap();
    assert!(timeout(WAIT, a.flush()).await.unwrap());
    assert!(a.is_connected());
    assert_eq!(recv(&b).await, &b"flushed"[..]);
}

#[tokio::test]
async fn test_flush_after_destroy_is_false() {
    let (a, _b) = default_pair();
    a.destroy(None);
    assert!(!a.flush().await);
}

#[tokio::test]
async fn test_destroy_with_error() {
    let (a, b) = default_pair();
    assert!(timeout(WAIT, a.opened()).await.unwrap());

    a.destroy(Some(ProtocolError::Handler("shutting down".into())));
    let result = timeout(WAIT, a.closed()).await.unwrap();
    assert!(matches!(result, Err(ProtocolError::Handler(msg)) if msg == "shutting down"));
    assert!(a.is_destroyed());
    assert!(a.write(&b"nope"[..]).is_err());

    // The peer sees the transport go away.
    assert!(!matches!(timeout(WAIT, b.recv()).await.unwrap(), Ok(Some(_))));
}

#[tokio::test]
async fn test_destroy_is_idempotent() {
    let (a, _b) = default_pair();
    a.destroy(Some(ProtocolError::Handler("first".into())));
    a.destroy(Some(ProtocolError::Handler("second".into())));
    let result = timeout(WAIT, a.closed()).await.unwrap();
    assert!(matches!(result, Err(ProtocolError::Handler(msg)) if msg == "first"));
}

// =============================================================================
// Unordered Messages and Content Hints
// =============================================================================

#[tokio::test]
async fn test_unordered_messages() {
    let (a_raw, b_raw) = raw_pair(64 * 1024);
    let a = SecureStream::new(true, a_raw, StreamOptions::default()).unwrap();
    let b = SecureStream::new(false, b_raw, StreamOptions::default()).unwrap();

    assert!(!a.try_send_unordered(b"too early").unwrap());
    assert!(timeout(WAIT, a.opened()).await.unwrap());
    assert!(timeout(WAIT, b.opened()).await.unwrap());

    assert!(a.send_unordered(b"first").await.unwrap());
    assert!(a.try_send_unordered(b"second").unwrap());
    let first = timeout(WAIT, b.recv_unordered()).await.unwrap().unwrap();
    let second = timeout(WAIT, b.recv_unordered()).await.unwrap().unwrap();
    let mut got = vec![first, second];
    got.sort();
    assert_eq!(got, vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]);

    // Ordered messages are unaffected.
    b.write(&b"ordered"[..]).unwrap();
    assert_eq!(recv(&a).await, &b"ordered"[..]);
}

#[tokio::test]
async fn test_unordered_without_datagram_support() {
    let (a, b) = default_pair();
    assert!(timeout(WAIT, a.opened()).await.unwrap());
    assert!(timeout(WAIT, b.opened()).await.unwrap());
    assert!(!a.try_send_unordered(b"nowhere").unwrap());
    assert!(!a.send_unordered(b"nowhere").await.unwrap());
}

#[tokio::test]
async fn test_content_size_hints() {
    let (a_raw, b_raw) = raw_pair(64 * 1024);
    let (b_raw, hints) = b_raw.with_content_hint();
    let a = SecureStream::new(true, a_raw, StreamOptions::default()).unwrap();
    let b = SecureStream::new(false, b_raw, StreamOptions::default()).unwrap();

    a.write(vec![7u8; 1000]).unwrap();
    assert_eq!(recv(&b).await.len(), 1000);

    let values = hints.values();
    assert!(!values.is_empty());
    assert_eq!(values.last(), Some(&0));
}
