//! Data model for the link core: connection states, peer naming, and the
//! notification events emitted to the caller.

use std::fmt;

/// Lifecycle state of the link.
///
/// Exactly one value holds at any instant; all transitions are serialized
/// by the [`ConnectionManager`](crate::link::manager::ConnectionManager).
/// The discriminant is `repr(u8)` so the manager can mirror the current
/// state into an atomic and serve snapshot reads without a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// No worker is active.  Both the initial and the at-rest state; the
    /// machine is reusable across repeated connect/listen cycles.
    Idle = 0,
    /// An accept worker is blocked waiting for one inbound connection.
    Listening = 1,
    /// A connect worker is attempting one outbound connection.
    Connecting = 2,
    /// A session worker owns an established duplex session.
    Connected = 3,
}

impl ConnectionState {
    /// Reconstructs a state from its `repr(u8)` discriminant.
    ///
    /// Only values previously produced by `as u8` on this enum are ever
    /// stored, so anything else maps to `Idle`.
    pub(crate) fn from_raw(raw: u8) -> Self {
        match raw {
            1 => ConnectionState::Listening,
            2 => ConnectionState::Connecting,
            3 => ConnectionState::Connected,
            _ => ConnectionState::Idle,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Listening => "listening",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Opaque identifier for a remote endpoint, supplied by the caller.
///
/// The core treats it as an already-validated `"host:port"` token and only
/// hands it to the resolver at connect time; it is never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

/// Human-readable name of the connected peer, captured when the session is
/// established and cleared on disconnect.  Used only in notification
/// payloads and log lines.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Asynchronous events the core emits to its caller.
///
/// Delivered on the channel returned by
/// [`ConnectionManager::new`](crate::link::manager::ConnectionManager::new).
/// Notifications produced by one worker generation arrive in the order they
/// were produced; once a newer generation supersedes an older one, the old
/// generation's remaining results are discarded rather than reordered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// The link moved to a new [`ConnectionState`].
    StateChanged(ConnectionState),
    /// A session was established with the named peer.  Always follows the
    /// `StateChanged(Connected)` for the same session.
    PeerIdentified(PeerIdentity),
    /// Bytes arrived from the peer.  Boundaries are transport-defined.
    BytesReceived(Vec<u8>),
    /// A queued payload was fully transmitted to the peer.
    BytesSent(Vec<u8>),
    /// A recoverable failure: connect refused, resolution failed, listen
    /// bind failed, or a `write()` issued while not connected.
    TransientError(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
