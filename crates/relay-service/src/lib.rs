//! The service loop runtime built on top of `relay-core`'s substrate:
//! component lifecycle, packet dispatch, timers, and the message queue
//! driven by one thread per service.
//!
//! A service is assembled with [`builder::ServiceBuilder`] and run to
//! completion with [`runtime::Service::run`]; other threads (and, later,
//! `relay-hosting`'s manager) interact with a running service only
//! through the cheap, `Clone` [`runtime::ServiceHandle`] it hands back.

pub mod builder;
pub mod lookup;
pub mod runtime;
pub mod state;

pub use builder::ServiceBuilder;
pub use lookup::ComponentLookup;
pub use runtime::{FfiCloseRequest, FfiSendRequest, Service, ServiceHandle, FFI_CLOSE_TAG, FFI_SEND_TAG};
pub use state::{ServiceState, ServiceStateCell};
