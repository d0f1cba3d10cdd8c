//! Connect and accept workers.
//!
//! Each worker performs exactly one blocking socket operation on its own
//! task and posts the outcome back into the state machine via
//! [`deliver`](super::manager::deliver), tagged with the generation it was
//! spawned under.
//!
//! # Cancellation
//!
//! There is no hard kill.  The worker races its socket future against the
//! `watch` cancel signal; when the signal wins, the `select!` drops the
//! in-progress connect future or the listener, which closes the underlying
//! resource.  A cancelled worker terminates silently — the generation bump
//! performed by the canceller already discards any result it could have
//! produced.

use std::sync::Arc;

use tokio::net::{self, TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::domain::PeerAddress;
use crate::link::manager::{deliver, LinkError, LinkEvent, Shared};
use crate::link::session::TransportSession;

/// Attempts one outbound connection to `address`.
///
/// Resolves the address token, then performs a single `TcpStream::connect`.
/// Blocks (on its own task) until success, refusal/timeout, or
/// cancellation.  Never retries — retry policy belongs to the caller.
pub(crate) async fn connect_worker(
    shared: Arc<Shared>,
    generation: u64,
    address: PeerAddress,
    mut cancel: watch::Receiver<bool>,
) {
    let attempt = async {
        let mut resolved = net::lookup_host(address.as_str())
            .await
            .map_err(|source| LinkError::Resolve {
                address: address.clone(),
                source,
            })?;

        let target = resolved.next().ok_or_else(|| LinkError::Resolve {
            address: address.clone(),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "address token resolved to no usable endpoint",
            ),
        })?;

        let stream = TcpStream::connect(target)
            .await
            .map_err(|source| LinkError::ConnectFailed {
                address: address.clone(),
                source,
            })?;

        Ok::<TransportSession, LinkError>(TransportSession::new(stream))
    };

    tokio::select! {
        _ = cancel.changed() => {
            debug!(%address, "outbound attempt cancelled");
        }
        outcome = attempt => match outcome {
            Ok(transport) => {
                deliver(&shared, generation, LinkEvent::Established(transport)).await;
            }
            Err(err) => {
                deliver(&shared, generation, LinkEvent::AttemptFailed(err)).await;
            }
        }
    }
}

/// Listens on `bind_addr` until exactly one inbound connection arrives.
///
/// Single-shot: the listening endpoint is dropped (closed) when the worker
/// returns, whether a peer was accepted or not.  The manager must call
/// `start()` again to resume listening.  Cancellation is a non-error,
/// silent termination.
pub(crate) async fn accept_worker(
    shared: Arc<Shared>,
    generation: u64,
    bind_addr: String,
    mut cancel: watch::Receiver<bool>,
) {
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(source) => {
            deliver(
                &shared,
                generation,
                LinkEvent::AttemptFailed(LinkError::BindFailed {
                    addr: bind_addr,
                    source,
                }),
            )
            .await;
            return;
        }
    };

    tokio::select! {
        _ = cancel.changed() => {
            debug!(%bind_addr, "listen cancelled; closing endpoint");
        }
        result = listener.accept() => match result {
            Ok((stream, peer_addr)) => {
                info!(%peer_addr, "inbound connection accepted");
                deliver(
                    &shared,
                    generation,
                    LinkEvent::Established(TransportSession::new(stream)),
                )
                .await;
            }
            Err(source) => {
                deliver(
                    &shared,
                    generation,
                    LinkEvent::AttemptFailed(LinkError::AcceptFailed(source)),
                )
                .await;
            }
        }
    }
}
