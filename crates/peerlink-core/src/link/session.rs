//! The transport session wrapper and the session worker loops.
//!
//! [`TransportSession`] is a thin wrapper over one established TCP stream:
//! no buffering, no framing — payload boundaries are whatever the transport
//! delivers.  The session worker splits it into owned halves and runs two
//! independent tasks over them:
//!
//! - the **read loop** surfaces every successful read as an `Inbound` event
//!   and reports peer loss on end-of-stream or a fatal read error;
//! - the **write loop** drains the outbound FIFO, writing each payload in
//!   full before reporting it `Sent`; a write failure is peer loss exactly
//!   like a read failure.
//!
//! A slow or absent peer therefore never blocks queued writes beyond the
//! in-flight `write_all`, and vice versa.  Both loops carry the generation
//! of the worker that established the session, so reports from a retired
//! session are discarded by the state machine.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::domain::PeerIdentity;
use crate::link::manager::{deliver, LinkError, LinkEvent, Shared};

/// Size of the per-read scratch buffer.
const READ_BUFFER_SIZE: usize = 4096;

/// One established bidirectional byte-stream endpoint.
///
/// Created by a successful connect or accept attempt and owned by the
/// session worker for its lifetime.  At most one exists at a time.
/// Dropping the session (or either split half) closes the underlying
/// stream, which makes any in-flight read or write on it fail promptly —
/// that is the close operation.
#[derive(Debug)]
pub struct TransportSession {
    stream: TcpStream,
}

impl TransportSession {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Human-readable identity of the remote endpoint, captured at
    /// establishment time.  Falls back to a placeholder when the socket can
    /// no longer report its peer.
    pub fn peer_identity(&self) -> PeerIdentity {
        match self.stream.peer_addr() {
            Ok(addr) => PeerIdentity::new(addr.to_string()),
            Err(_) => PeerIdentity::new("unknown peer"),
        }
    }

    /// Splits the session into independently owned read and write halves so
    /// the two session loops can run without shared ownership.
    pub(crate) fn into_split(self) -> (OwnedReadHalf, OwnedWriteHalf) {
        self.stream.into_split()
    }
}

/// Blocking read loop of the session worker.
///
/// Each successful read of one or more bytes becomes an `Inbound` event.
/// `Ok(0)` means the peer closed the stream; that and any read error end
/// the loop with a single `PeerLost` report (the generation check absorbs
/// the duplicate if the write loop fails concurrently).
pub(crate) async fn read_loop(
    shared: Arc<Shared>,
    generation: u64,
    mut read_half: OwnedReadHalf,
    mut cancel: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        tokio::select! {
            _ = cancel.changed() => {
                debug!("session read loop cancelled");
                return;
            }
            result = read_half.read(&mut buf) => match result {
                Ok(0) => {
                    // End of stream: the peer hung up.
                    deliver(&shared, generation, LinkEvent::PeerLost(None)).await;
                    return;
                }
                Ok(n) => {
                    deliver(&shared, generation, LinkEvent::Inbound(buf[..n].to_vec())).await;
                }
                Err(e) => {
                    deliver(
                        &shared,
                        generation,
                        LinkEvent::PeerLost(Some(LinkError::Session(e))),
                    )
                    .await;
                    return;
                }
            }
        }
    }
}

/// Write loop of the session worker: drains the outbound FIFO.
///
/// Each dequeued payload is written in full (`write_all`) before the next
/// is taken, preserving enqueue order on the wire.  The loop ends when the
/// queue's sender is dropped (the manager retired the session), on
/// cancellation, or on a write failure.
pub(crate) async fn write_loop(
    shared: Arc<Shared>,
    generation: u64,
    mut write_half: OwnedWriteHalf,
    mut outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = cancel.changed() => {
                debug!("session write loop cancelled");
                return;
            }
            item = outbound_rx.recv() => {
                let Some(payload) = item else {
                    // Queue closed: the session was retired by the manager.
                    return;
                };
                match write_half.write_all(&payload).await {
                    Ok(()) => {
                        deliver(&shared, generation, LinkEvent::Sent(payload)).await;
                    }
                    Err(e) => {
                        deliver(
                            &shared,
                            generation,
                            LinkEvent::PeerLost(Some(LinkError::Session(e))),
                        )
                        .await;
                        return;
                    }
                }
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
