//! # peerlink-core
//!
//! Connection-management core for a single peer-to-peer byte-stream link.
//!
//! One [`ConnectionManager`] owns the whole lifecycle: an outbound connect
//! attempt, an inbound listen/accept, or an established duplex session —
//! exactly one of those at a time.  The caller issues commands
//! (`start`, `connect_to`, `write`, `stop`) and consumes asynchronous
//! [`Notification`]s on the channel returned by the constructor.
//!
//! # Architecture overview
//!
//! - **`domain`** – The data model: [`ConnectionState`], [`PeerAddress`],
//!   [`PeerIdentity`], and the [`Notification`] events the core emits.
//!
//! - **`config`** – TOML-backed [`LinkConfig`] (bind address, listen port,
//!   log level) with platform config-dir resolution.
//!
//! - **`link`** – The machinery: the manager/state machine, the connect and
//!   accept workers, and the session worker that drives an established
//!   [`TransportSession`](link::session::TransportSession).
//!
//! The crate has no UI, no discovery, and no wire protocol: payloads are
//! opaque byte sequences, and the peer address is an already-validated
//! token handed in by the caller.

pub mod config;
pub mod domain;
pub mod link;

// Re-export the most-used types at the crate root so callers can write
// `peerlink_core::ConnectionManager` instead of the full module path.
pub use config::{load_config, save_config, ConfigError, LinkConfig, NetworkConfig};
pub use domain::{ConnectionState, Notification, PeerAddress, PeerIdentity};
pub use link::manager::{ConnectionManager, LinkError};
