//! Link machinery: the state machine and the workers it coordinates.
//!
//! # Sub-modules
//!
//! - **`manager`** – The [`ConnectionManager`](manager::ConnectionManager)
//!   state machine.  Serializes all transitions, enforces the
//!   one-active-worker rule via a generation counter, and relays worker
//!   results to the caller as [`Notification`](crate::domain::Notification)s.
//!
//! - **`workers`** – The connect worker (one outbound TCP attempt, no
//!   retry) and the accept worker (single-shot listen/accept).  Both are
//!   cancellable by resource closure: a `watch` signal makes the worker
//!   abandon the socket future it is blocked on, which drops and closes
//!   the underlying resource.
//!
//! - **`session`** – The [`TransportSession`](session::TransportSession)
//!   wrapper and the session worker's independent read and write loops.

pub mod manager;
pub mod session;
pub(crate) mod workers;
