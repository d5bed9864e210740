//! The `Poller` contract: the service loop's view of a non-blocking
//! socket multiplexer.
//!
//! Concrete adapters (the reference one being `relay-net-tcp`) own the
//! actual sockets and run whatever tasks or threads they need to drive
//! them; they report back by pushing [`PollerEvent`]s onto a service's
//! message queue, tagged [`POLLER_EVENT_TAG`], the same queue
//! cross-service messages travel over. That keeps the service loop
//! itself out of the business of polling a reactor: it only touches
//! this trait for the data-plane operations a handler can trigger
//! mid-tick (queue a send, close a session), and otherwise just reacts
//! to whatever events the queue hands it.
//!
//! Splitting the contract this way — events flow in over the MPSC,
//! commands flow out through a small `Send + Sync` trait object — is
//! what lets the loop stay single-threaded and synchronous while the
//! poller underneath is free to be whatever the adapter needs (a Tokio
//! task pair, an io_uring ring, anything).

use std::net::SocketAddr;

use bytes::Bytes;

use crate::error::CoreError;
use crate::ids::SessionId;
use crate::session::CloseReason;

/// The envelope tag poller adapters push events under.
pub const POLLER_EVENT_TAG: &str = "poller_event";

/// One readiness/lifecycle event a poller adapter reports. `relay-net-tcp`
/// is the one concrete source of these; the loop interprets them
/// uniformly regardless of which adapter produced them.
#[derive(Clone, Debug)]
pub enum PollerEvent {
    Accepted {
        listener_id: u32,
        session_id: SessionId,
        peer_addr: SocketAddr,
    },
    Connected {
        session_id: SessionId,
        peer_addr: SocketAddr,
    },
    ConnectFailed {
        session_id: SessionId,
    },
    Readable {
        session_id: SessionId,
        bytes: Bytes,
    },
    Closed {
        session_id: SessionId,
        reason: CloseReason,
    },
}

/// The data-plane surface of a poller, as seen by the owning service
/// loop and by handler code via the session it's dispatching for.
/// `listen`/`connect` are deliberately absent: opening a listener or an
/// outbound connection is a setup-time operation performed by whatever
/// assembles the service (see `relay-hosting`), not a per-tick one, and
/// keeping it off this trait keeps `dyn Poller` object-safe without an
/// async-trait dependency on the hot path.
pub trait Poller: Send + Sync {
    /// Queues `bytes` for send on `session_id`. Returns `WouldBlock` once
    /// the adapter's own backlog is full, `NotFound` if the session is
    /// unknown or already closed.
    fn send(&self, session_id: SessionId, bytes: Bytes) -> Result<(), CoreError>;

    /// Starts closing `session_id`. Idempotent on an already-closed or
    /// unknown session.
    fn close(&self, session_id: SessionId);

    fn is_open(&self, session_id: SessionId) -> bool;
}
