//! Integration tests for the connection manager lifecycle.
//!
//! # Purpose
//!
//! These tests exercise the `ConnectionManager` through its *public* API in
//! the same way a presentation layer uses it, over real loopback TCP
//! sockets.  They verify:
//!
//! - The happy inbound path: `start()` → peer connects → `Connected` +
//!   `PeerIdentified` → byte round trips → peer closes → `Idle`.
//! - The error paths: outbound refusal falls back to `Idle` with a
//!   `TransientError`; a bind conflict does the same for `start()`.
//! - The preemption rules: a second `connect_to` supersedes the in-flight
//!   attempt, and preempting an established session closes its socket (the
//!   old peer observes EOF) without leaking an `Idle` transition.
//! - Idempotency: repeated `stop()` produces no notification beyond the
//!   first `Idle` transition.
//! - Write fidelity: queued payloads — including the empty payload — appear
//!   on the peer side in order, byte for byte.
//!
//! # Port allocation
//!
//! Each test that needs a listen port binds port 0 first to let the OS pick
//! a free one, then releases it before handing the port to the manager.
//! The tiny reuse window is acceptable for tests.
//!
//! # Timeouts
//!
//! Every await on the notification channel is bounded by a 5-second
//! timeout so a regression hangs the single test, not the whole suite.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use peerlink_core::{ConnectionManager, ConnectionState, LinkConfig, Notification, PeerAddress};

const WAIT: Duration = Duration::from_secs(5);

/// Binds port 0 to obtain an OS-assigned free port, then releases it.
async fn free_port() -> u16 {
    let probe = TcpListener::bind("127.0.0.1:0").await.expect("probe bind");
    let port = probe.local_addr().expect("probe addr").port();
    drop(probe);
    port
}

/// A manager configured to listen on `127.0.0.1:port`.
fn manager_on(port: u16) -> (ConnectionManager, UnboundedReceiver<Notification>) {
    let mut config = LinkConfig::default();
    config.network.bind_address = "127.0.0.1".to_string();
    config.network.listen_port = port;
    ConnectionManager::new(config)
}

/// Receives the next notification, bounded by the suite timeout.
async fn next_note(rx: &mut UnboundedReceiver<Notification>) -> Notification {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a notification")
        .expect("notification channel closed")
}

/// Skips notifications until `pred` matches one, returning it.
async fn note_matching(
    rx: &mut UnboundedReceiver<Notification>,
    pred: impl Fn(&Notification) -> bool,
) -> Notification {
    loop {
        let note = next_note(rx).await;
        if pred(&note) {
            return note;
        }
    }
}

/// Drives a manager into the `Connected` state via an inbound loopback
/// connection and returns the raw peer socket.
async fn establish_inbound(
    mgr: &ConnectionManager,
    rx: &mut UnboundedReceiver<Notification>,
    port: u16,
) -> TcpStream {
    mgr.start().await;
    assert_eq!(
        next_note(rx).await,
        Notification::StateChanged(ConnectionState::Listening)
    );

    let peer = TcpStream::connect(("127.0.0.1", port))
        .await
        .expect("peer connect");

    assert_eq!(
        next_note(rx).await,
        Notification::StateChanged(ConnectionState::Connected)
    );
    assert!(matches!(next_note(rx).await, Notification::PeerIdentified(_)));
    assert_eq!(mgr.state(), ConnectionState::Connected);
    peer
}

// ── Inbound lifecycle ─────────────────────────────────────────────────────────

/// The full happy-path scenario: listen, accept, identify, round-trip
/// bytes both ways, then peer-initiated close drives the link back to
/// `Idle` exactly once.
#[tokio::test]
async fn test_inbound_lifecycle_connect_exchange_and_peer_close() {
    // Arrange
    let port = free_port().await;
    let (mgr, mut rx) = manager_on(port);
    let mut peer = establish_inbound(&mgr, &mut rx, port).await;

    // Act / Assert — outbound: the peer observes exactly the queued bytes
    mgr.write(b"hello".to_vec()).await;
    assert_eq!(
        note_matching(&mut rx, |n| matches!(n, Notification::BytesSent(_))).await,
        Notification::BytesSent(b"hello".to_vec())
    );
    let mut buf = [0u8; 5];
    timeout(WAIT, peer.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .expect("peer read");
    assert_eq!(&buf, b"hello");

    // Act / Assert — inbound: bytes from the peer surface as a notification
    peer.write_all(b"hi back").await.expect("peer write");
    assert_eq!(
        note_matching(&mut rx, |n| matches!(n, Notification::BytesReceived(_))).await,
        Notification::BytesReceived(b"hi back".to_vec())
    );

    // Act — peer hangs up
    drop(peer);

    // Assert — exactly one transition back to Idle, and nothing after it
    assert_eq!(
        note_matching(&mut rx, |n| matches!(n, Notification::StateChanged(_))).await,
        Notification::StateChanged(ConnectionState::Idle)
    );
    assert_eq!(mgr.state(), ConnectionState::Idle);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        rx.try_recv().is_err(),
        "peer loss must be reported exactly once"
    );
}

/// After a session ends the manager is reusable: a second listen/accept
/// cycle works on the same instance.
#[tokio::test]
async fn test_manager_is_reusable_across_sessions() {
    let port = free_port().await;
    let (mgr, mut rx) = manager_on(port);

    // First cycle
    let peer = establish_inbound(&mgr, &mut rx, port).await;
    drop(peer);
    assert_eq!(
        note_matching(&mut rx, |n| matches!(n, Notification::StateChanged(_))).await,
        Notification::StateChanged(ConnectionState::Idle)
    );

    // Second cycle on the very same manager
    let peer = establish_inbound(&mgr, &mut rx, port).await;
    drop(peer);
    assert_eq!(
        note_matching(&mut rx, |n| matches!(n, Notification::StateChanged(_))).await,
        Notification::StateChanged(ConnectionState::Idle)
    );
}

// ── Outbound failure ──────────────────────────────────────────────────────────

/// A refused outbound attempt falls back to `Idle` with a `TransientError`;
/// no session is ever created.
#[tokio::test]
async fn test_outbound_refusal_returns_to_idle_with_transient_error() {
    // Arrange — a port with nothing listening behind it
    let port = free_port().await;
    let (mgr, mut rx) = manager_on(0);

    // Act
    mgr.connect_to(PeerAddress::new(format!("127.0.0.1:{port}"))).await;

    // Assert
    assert_eq!(
        next_note(&mut rx).await,
        Notification::StateChanged(ConnectionState::Connecting)
    );
    assert_eq!(
        next_note(&mut rx).await,
        Notification::StateChanged(ConnectionState::Idle)
    );
    assert!(matches!(
        next_note(&mut rx).await,
        Notification::TransientError(_)
    ));
    assert_eq!(mgr.state(), ConnectionState::Idle);
    assert_eq!(mgr.peer().await, None, "no session was ever created");
}

/// An unresolvable address token surfaces the resolution failure as a
/// `TransientError` and falls back to `Idle`.
#[tokio::test]
async fn test_unresolvable_address_reports_transient_error() {
    let (mgr, mut rx) = manager_on(0);

    mgr.connect_to(PeerAddress::from("no-such-host.invalid:1")).await;

    assert_eq!(
        next_note(&mut rx).await,
        Notification::StateChanged(ConnectionState::Connecting)
    );
    assert_eq!(
        next_note(&mut rx).await,
        Notification::StateChanged(ConnectionState::Idle)
    );
    assert!(matches!(
        next_note(&mut rx).await,
        Notification::TransientError(_)
    ));
}

/// A bind conflict on `start()` is a listen failure: back to `Idle` with a
/// `TransientError`.
#[tokio::test]
async fn test_listen_bind_conflict_returns_to_idle_with_transient_error() {
    // Arrange — occupy the port the manager wants
    let occupant = TcpListener::bind("127.0.0.1:0").await.expect("occupant bind");
    let port = occupant.local_addr().expect("occupant addr").port();
    let (mgr, mut rx) = manager_on(port);

    // Act
    mgr.start().await;

    // Assert
    assert_eq!(
        next_note(&mut rx).await,
        Notification::StateChanged(ConnectionState::Listening)
    );
    assert_eq!(
        next_note(&mut rx).await,
        Notification::StateChanged(ConnectionState::Idle)
    );
    assert!(matches!(
        next_note(&mut rx).await,
        Notification::TransientError(msg) if msg.contains("bind")
    ));
    drop(occupant);
}

// ── Preemption and superseded workers ─────────────────────────────────────────

/// A second `connect_to` while `Connecting` supersedes the first attempt:
/// only the second target's outcome determines the final state.
#[tokio::test]
async fn test_second_connect_supersedes_inflight_attempt() {
    // Arrange — a live listener for the second target
    let target = TcpListener::bind("127.0.0.1:0").await.expect("target bind");
    let target_port = target.local_addr().expect("target addr").port();
    let accept_task = tokio::spawn(async move { target.accept().await });
    let (mgr, mut rx) = manager_on(0);

    // Act — first attempt goes to an unroutable TEST-NET-3 address, the
    // second to the live listener before the first can possibly resolve
    mgr.connect_to(PeerAddress::from("203.0.113.1:9")).await;
    mgr.connect_to(PeerAddress::new(format!("127.0.0.1:{target_port}"))).await;

    // Assert — the link ends up connected to the second target
    let identified = note_matching(&mut rx, |n| {
        matches!(n, Notification::PeerIdentified(_))
    })
    .await;
    if let Notification::PeerIdentified(peer) = identified {
        assert!(
            peer.as_str().ends_with(&format!(":{target_port}")),
            "connected peer must be the second target, got {peer}"
        );
    }
    assert_eq!(mgr.state(), ConnectionState::Connected);
    accept_task.await.expect("accept task").expect("accept");
}

/// `connect_to` while `Connected` closes the prior session before the new
/// attempt: the old peer observes EOF, no stray `Idle` transition appears,
/// and the new session becomes the active one.
#[tokio::test]
async fn test_connect_while_connected_closes_prior_session() {
    // Arrange — established inbound session with peer A
    let port = free_port().await;
    let (mgr, mut rx) = manager_on(port);
    let mut peer_a = establish_inbound(&mgr, &mut rx, port).await;

    let target = TcpListener::bind("127.0.0.1:0").await.expect("target bind");
    let target_port = target.local_addr().expect("target addr").port();
    let accept_task = tokio::spawn(async move { target.accept().await });

    // Act — preempt the session with an outbound attempt to peer B
    mgr.connect_to(PeerAddress::new(format!("127.0.0.1:{target_port}"))).await;

    // Assert — peer A's socket is closed by the preemption
    let mut buf = [0u8; 1];
    let n = timeout(WAIT, peer_a.read(&mut buf))
        .await
        .expect("read timed out")
        .expect("peer A read");
    assert_eq!(n, 0, "prior session must be closed (EOF) on preemption");

    // Assert — the transition sequence never dips through Idle
    assert_eq!(
        next_note(&mut rx).await,
        Notification::StateChanged(ConnectionState::Connecting)
    );
    assert_eq!(
        next_note(&mut rx).await,
        Notification::StateChanged(ConnectionState::Connected)
    );
    assert!(matches!(next_note(&mut rx).await, Notification::PeerIdentified(_)));
    assert_eq!(mgr.state(), ConnectionState::Connected);
    accept_task.await.expect("accept task").expect("accept");
}

// ── stop() semantics ──────────────────────────────────────────────────────────

/// `stop()` from `Connected` closes the session (peer observes EOF) and is
/// idempotent afterwards.
#[tokio::test]
async fn test_stop_closes_session_and_is_idempotent() {
    // Arrange
    let port = free_port().await;
    let (mgr, mut rx) = manager_on(port);
    let mut peer = establish_inbound(&mgr, &mut rx, port).await;

    // Act
    mgr.stop().await;
    mgr.stop().await;
    mgr.stop().await;

    // Assert — one Idle transition, then silence
    assert_eq!(
        next_note(&mut rx).await,
        Notification::StateChanged(ConnectionState::Idle)
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err(), "repeated stop must be silent");

    // Assert — the peer observes the close
    let mut buf = [0u8; 1];
    let n = timeout(WAIT, peer.read(&mut buf))
        .await
        .expect("read timed out")
        .expect("peer read");
    assert_eq!(n, 0);
}

/// Cancelling an in-flight listen with `stop()` releases the port: a fresh
/// listener can bind it immediately.
#[tokio::test]
async fn test_stop_while_listening_releases_the_endpoint() {
    // Arrange
    let port = free_port().await;
    let (mgr, mut rx) = manager_on(port);
    mgr.start().await;
    assert_eq!(
        next_note(&mut rx).await,
        Notification::StateChanged(ConnectionState::Listening)
    );

    // Act
    mgr.stop().await;
    assert_eq!(
        next_note(&mut rx).await,
        Notification::StateChanged(ConnectionState::Idle)
    );

    // Assert — the listening endpoint was closed; rebinding may need a few
    // retries while the cancelled worker finishes dropping the listener.
    let mut rebound = false;
    for _ in 0..50 {
        if TcpListener::bind(("127.0.0.1", port)).await.is_ok() {
            rebound = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(rebound, "cancelled listen must release the port");
}

// ── Write fidelity ────────────────────────────────────────────────────────────

/// Queued payloads — including an empty one — arrive on the peer side in
/// order, byte for byte, and each is confirmed by a `BytesSent` in the same
/// order.
#[tokio::test]
async fn test_writes_preserve_order_and_content_including_empty_payload() {
    // Arrange
    let port = free_port().await;
    let (mgr, mut rx) = manager_on(port);
    let mut peer = establish_inbound(&mgr, &mut rx, port).await;

    // Act
    mgr.write(Vec::new()).await;
    mgr.write(b"abc".to_vec()).await;
    mgr.write(b"defg".to_vec()).await;

    // Assert — BytesSent confirmations in enqueue order
    for expected in [&b""[..], &b"abc"[..], &b"defg"[..]] {
        assert_eq!(
            note_matching(&mut rx, |n| matches!(n, Notification::BytesSent(_))).await,
            Notification::BytesSent(expected.to_vec())
        );
    }

    // Assert — the peer observes exactly the concatenation, in order
    let mut buf = [0u8; 7];
    timeout(WAIT, peer.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .expect("peer read");
    assert_eq!(&buf, b"abcdefg");
}

/// A large payload survives the queue and the stream intact.
#[tokio::test]
async fn test_large_payload_round_trips_intact() {
    // Arrange — 1 MiB of a repeating pattern
    let port = free_port().await;
    let (mgr, mut rx) = manager_on(port);
    let mut peer = establish_inbound(&mgr, &mut rx, port).await;
    let payload: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();

    // Act
    mgr.write(payload.clone()).await;

    // Assert
    let mut received = vec![0u8; payload.len()];
    timeout(WAIT, peer.read_exact(&mut received))
        .await
        .expect("read timed out")
        .expect("peer read");
    assert_eq!(received, payload);
    assert_eq!(
        note_matching(&mut rx, |n| matches!(n, Notification::BytesSent(_))).await,
        Notification::BytesSent(payload)
    );
}

/// Peer-initiated closure with writes still queued drives the manager to
/// `Idle` exactly once; later writes report `TransientError` instead of a
/// second `Idle`.
#[tokio::test]
async fn test_peer_close_under_pending_writes_reports_idle_once() {
    // Arrange
    let port = free_port().await;
    let (mgr, mut rx) = manager_on(port);
    let peer = establish_inbound(&mgr, &mut rx, port).await;

    // Act — close the peer and immediately race writes against the loss
    drop(peer);
    for _ in 0..5 {
        mgr.write(b"doomed".to_vec()).await;
    }

    // Assert — exactly one Idle transition among everything emitted
    assert_eq!(
        note_matching(&mut rx, |n| matches!(n, Notification::StateChanged(_))).await,
        Notification::StateChanged(ConnectionState::Idle)
    );
    assert_eq!(mgr.state(), ConnectionState::Idle);

    // A write after the loss is a caller error: TransientError, not Idle.
    mgr.write(b"too late".to_vec()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Ok(note) = rx.try_recv() {
        assert!(
            !matches!(note, Notification::StateChanged(_)),
            "peer loss must produce exactly one state change, got extra {note:?}"
        );
    }
}
