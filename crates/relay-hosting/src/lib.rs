//! Hosts more than one `relay-service` service in a single process: a
//! name- and id-keyed directory of running services plus a bounded
//! graceful-shutdown coordinator for stopping the whole fleet together.
//!
//! Cross-service messaging needs nothing of its own here — once a
//! caller has a [`manager::ServiceManager`] handle to the target
//! service (via [`manager::ServiceManager::get_by_id`] or
//! [`manager::ServiceManager::get_by_name`]), posting to it is just
//! `handle.post_message(envelope)`, the same [`relay_service::ServiceHandle`]
//! API any other thread uses.

pub mod manager;
pub mod shutdown;

pub use manager::ServiceManager;
pub use shutdown::{GracefulShutdownCoordinator, ShutdownRecord, ShutdownReport, ShutdownStatus};
