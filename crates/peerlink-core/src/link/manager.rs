//! The connection lifecycle state machine.
//!
//! [`ConnectionManager`] holds the current [`ConnectionState`], starts and
//! retires workers, and relays lifecycle/data events to the caller.
//!
//! # Transition serialization
//!
//! Every transition runs under one `tokio::sync::Mutex<Core>`, so no two
//! transitions are ever applied concurrently.  The current state is mirrored
//! into an `AtomicU8` so [`ConnectionManager::state`] is a lock-free snapshot
//! read — callers must tolerate it going stale immediately.
//!
//! # Generation discipline
//!
//! Every worker spawn is tagged with a monotonically increasing generation.
//! Retiring the active worker (on `stop()`, on a preempting `connect_to()`,
//! or when the worker itself reports a terminal result) advances the
//! counter, so a superseded worker's late success or failure arrives with a
//! stale tag and is discarded without touching state or emitting
//! notifications.  This is what keeps a stale accept/connect result from
//! corrupting a newer, already-established session.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::domain::{ConnectionState, Notification, PeerAddress, PeerIdentity};
use crate::link::session::{self, TransportSession};
use crate::link::workers;

/// Error type for link operations.  Instances are rendered into
/// [`Notification::TransientError`] payloads; nothing here is fatal to the
/// manager, which always degrades to `Idle` and stays reusable.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The listening endpoint could not be bound.
    #[error("failed to bind listener on {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    /// The peer address token could not be resolved to a reachable endpoint.
    #[error("could not resolve peer address {address}: {source}")]
    Resolve {
        address: PeerAddress,
        #[source]
        source: std::io::Error,
    },
    /// The outbound connect attempt was refused, timed out, or was
    /// otherwise unreachable.
    #[error("connect to {address} failed: {source}")]
    ConnectFailed {
        address: PeerAddress,
        #[source]
        source: std::io::Error,
    },
    /// Accepting the inbound connection failed.
    #[error("accept failed: {0}")]
    AcceptFailed(#[source] std::io::Error),
    /// I/O failure on an established session (read or write path).
    #[error("session I/O error: {0}")]
    Session(#[source] std::io::Error),
}

/// Result posted by a worker back into the state machine, tagged with the
/// worker's generation by the caller of [`deliver`].
#[derive(Debug)]
pub(crate) enum LinkEvent {
    /// A connect or accept attempt produced a live session.
    Established(TransportSession),
    /// A connect or accept attempt failed (never sent on cancellation —
    /// cancelled workers terminate silently).
    AttemptFailed(LinkError),
    /// The session worker read bytes from the peer.
    Inbound(Vec<u8>),
    /// The session worker finished transmitting one queued payload.
    Sent(Vec<u8>),
    /// The peer closed the stream (`None`) or a fatal session I/O error
    /// occurred (`Some`).
    PeerLost(Option<LinkError>),
}

/// Mutable core guarded by the transition lock.
struct Core {
    /// Tag of the currently active worker; advanced on every retirement.
    generation: u64,
    /// Cancel signal for the active worker (and its session tasks).
    cancel_tx: Option<watch::Sender<bool>>,
    /// Producer side of the outbound FIFO queue; present only while
    /// `Connected`.  Dropping it ends the session write loop.
    outbound_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    /// Identity of the connected peer; cleared on disconnect.
    peer: Option<PeerIdentity>,
}

impl Core {
    /// Cancels whichever worker is active, discards the outbound queue and
    /// peer identity, and advances the generation so any in-flight result
    /// from the retired worker is discarded on arrival.
    fn retire_active(&mut self) -> u64 {
        if let Some(cancel) = self.cancel_tx.take() {
            // Firing the watch (and dropping the sender) unblocks the
            // worker's select!, which drops the socket it was blocked on.
            let _ = cancel.send(true);
        }
        self.outbound_tx = None;
        self.peer = None;
        self.generation += 1;
        self.generation
    }

    /// Arms a fresh cancel channel for the worker about to be spawned.
    fn arm_cancel(&mut self) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        self.cancel_tx = Some(tx);
        rx
    }
}

/// State shared between the public handle, the workers, and the session
/// tasks.
pub(crate) struct Shared {
    config: LinkConfig,
    /// Mirror of the current state for lock-free snapshot reads.
    state: AtomicU8,
    notify_tx: mpsc::UnboundedSender<Notification>,
    core: Mutex<Core>,
}

impl Shared {
    /// Applies a state transition and emits `StateChanged` when the value
    /// actually changed.  Callers must hold the core lock.
    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.swap(next as u8, Ordering::AcqRel);
        if prev != next as u8 {
            self.notify(Notification::StateChanged(next));
        }
    }

    fn notify(&self, notification: Notification) {
        // A dropped receiver means the owning caller is shutting down;
        // there is nobody left to notify.
        let _ = self.notify_tx.send(notification);
    }
}

/// Posts a worker event into the state machine.
///
/// Locks the core, discards the event if its generation has been
/// superseded, and otherwise applies the transition and emits the matching
/// notifications.  All notification sends happen under the lock, which is
/// what preserves per-generation ordering.
pub(crate) fn deliver<'a>(
    shared: &'a Arc<Shared>,
    generation: u64,
    event: LinkEvent,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
    Box::pin(deliver_inner(shared, generation, event))
}

async fn deliver_inner(shared: &Arc<Shared>, generation: u64, event: LinkEvent) {
    let mut core = shared.core.lock().await;

    if generation != core.generation {
        debug!(
            generation,
            current = core.generation,
            "discarding result from superseded worker"
        );
        return;
    }

    match event {
        LinkEvent::Established(transport) => {
            let peer = transport.peer_identity();

            // Session tasks share the attempt's cancel channel so a later
            // stop()/connect_to() tears them down too.
            let cancel = match core.cancel_tx.as_ref() {
                Some(tx) => tx.subscribe(),
                None => return,
            };

            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            core.outbound_tx = Some(outbound_tx);
            core.peer = Some(peer.clone());

            let (read_half, write_half) = transport.into_split();
            tokio::spawn(session::read_loop(
                Arc::clone(shared),
                generation,
                read_half,
                cancel.clone(),
            ));
            tokio::spawn(session::write_loop(
                Arc::clone(shared),
                generation,
                write_half,
                outbound_rx,
                cancel,
            ));

            info!(%peer, "session established");
            shared.set_state(ConnectionState::Connected);
            shared.notify(Notification::PeerIdentified(peer));
        }

        LinkEvent::AttemptFailed(err) => {
            warn!("connection attempt failed: {err}");
            core.retire_active();
            shared.set_state(ConnectionState::Idle);
            shared.notify(Notification::TransientError(err.to_string()));
        }

        LinkEvent::Inbound(bytes) => {
            shared.notify(Notification::BytesReceived(bytes));
        }

        LinkEvent::Sent(bytes) => {
            shared.notify(Notification::BytesSent(bytes));
        }

        LinkEvent::PeerLost(err) => {
            match err {
                Some(e) => warn!("peer lost: {e}"),
                None => info!("peer closed the stream"),
            }
            // The generation bump absorbs the duplicate report when the
            // read and write paths fail concurrently.
            core.retire_active();
            shared.set_state(ConnectionState::Idle);
        }
    }
}

/// Owns the lifecycle of a single peer-to-peer byte-stream link.
///
/// Exactly one of {accept worker, connect worker, session worker} is active
/// at any time.  The caller drives the link through the methods below and
/// consumes [`Notification`]s from the receiver returned by [`new`].
///
/// All methods complete promptly: the blocking socket work runs on spawned
/// tasks, never on the caller.  Construct one manager per owning component;
/// there is no global instance.
///
/// [`new`]: ConnectionManager::new
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Creates a new manager in the `Idle` state and returns it together
    /// with the notification receiver.
    pub fn new(config: LinkConfig) -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            config,
            state: AtomicU8::new(ConnectionState::Idle as u8),
            notify_tx,
            core: Mutex::new(Core {
                generation: 0,
                cancel_tx: None,
                outbound_tx: None,
                peer: None,
            }),
        });
        (Self { shared }, notify_rx)
    }

    /// Snapshot of the current state.
    ///
    /// Not synchronized with subsequent transitions: the value may be stale
    /// by the time the caller acts on it.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_raw(self.shared.state.load(Ordering::Acquire))
    }

    /// Identity of the currently connected peer, if any.
    pub async fn peer(&self) -> Option<PeerIdentity> {
        self.shared.core.lock().await.peer.clone()
    }

    /// Begins listening for one inbound connection.
    ///
    /// Idempotent when already listening, connecting, or connected: only an
    /// `Idle` manager starts an accept worker.  The accept is single-shot —
    /// after the accepted session ends, call `start()` again to resume
    /// listening.
    pub async fn start(&self) {
        let mut core = self.shared.core.lock().await;

        let current = self.state();
        if current != ConnectionState::Idle {
            debug!(state = %current, "start() ignored: link is not idle");
            return;
        }

        let generation = core.retire_active();
        let cancel = core.arm_cancel();
        let bind_addr = self.shared.config.listen_addr();
        info!(%bind_addr, "listening for an inbound peer");
        self.shared.set_state(ConnectionState::Listening);

        tokio::spawn(workers::accept_worker(
            Arc::clone(&self.shared),
            generation,
            bind_addr,
            cancel,
        ));
    }

    /// Starts one outbound connection attempt to `address`.
    ///
    /// Always preempts whatever is in flight: a running accept or connect
    /// worker is cancelled and an established session is closed before the
    /// new attempt is spawned.  Resolution and connect failures are
    /// log-only; they surface to the caller as a `TransientError`
    /// notification and a fall back to `Idle`.  Retry policy belongs to the
    /// caller.
    pub async fn connect_to(&self, address: PeerAddress) {
        let mut core = self.shared.core.lock().await;

        let generation = core.retire_active();
        let cancel = core.arm_cancel();
        info!(%address, "connecting to peer");
        self.shared.set_state(ConnectionState::Connecting);

        tokio::spawn(workers::connect_worker(
            Arc::clone(&self.shared),
            generation,
            address,
            cancel,
        ));
    }

    /// Queues `payload` for in-order transmission to the connected peer.
    ///
    /// Never blocks: the payload lands on the outbound FIFO and the session
    /// worker drains it.  Valid only while `Connected` — the caller is
    /// expected to have checked [`state`](ConnectionManager::state) first.
    /// When no session is active the payload is **dropped** (never queued
    /// for a later connection) and one `TransientError` is emitted.
    pub async fn write(&self, payload: Vec<u8>) {
        let core = self.shared.core.lock().await;

        match core.outbound_tx {
            Some(ref tx) => {
                // Send fails only if the write loop already exited; the
                // imminent PeerLost transition covers that case.
                let _ = tx.send(payload);
            }
            None => {
                warn!(
                    len = payload.len(),
                    "write() while not connected; payload dropped"
                );
                self.shared
                    .notify(Notification::TransientError("not connected".to_string()));
            }
        }
    }

    /// Returns the link to `Idle` from any state, cancelling the active
    /// worker and closing any open session.
    ///
    /// Safe to call repeatedly: when already idle with no worker, nothing
    /// happens and no notification is emitted.
    pub async fn stop(&self) {
        let mut core = self.shared.core.lock().await;

        if self.state() == ConnectionState::Idle && core.cancel_tx.is_none() {
            return;
        }

        core.retire_active();
        info!("link stopped");
        self.shared.set_state(ConnectionState::Idle);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
