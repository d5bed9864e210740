//! Object lifetime, timer, queue, session, component, codec, and packet
//! contracts shared by every service built on top of this crate.
//!
//! Nothing here drives an actual event loop or owns a socket — see
//! `relay-service` for the loop that ties these pieces together and
//! `relay-net-tcp` for the concrete `Poller`. This crate is the
//! substrate the rest of the workspace is built from.

pub mod codec;
pub mod component;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod ids;
pub mod object;
pub mod packet;
pub mod poller;
pub mod queue;
pub mod session;
pub mod time;
pub mod variant;

pub use error::{CoreError, ErrorKind, Result};
pub use ids::{ServiceId, SessionId, TimerId};
pub use object::{AutoReleasePool, Object};
pub use packet::{Packet, PacketFlags};
pub use poller::{Poller, PollerEvent, POLLER_EVENT_TAG};
pub use variant::Variant;
