//! Coordinated shutdown across every service a [`crate::manager::ServiceManager`]
//! is hosting.
//!
//! The host this is adapted from drives shutdown as a future: it
//! triggers every target, then races each target's "closed" future
//! against a deadline timer, force-closing whichever ones lose that
//! race. `relay-service` has no futures anywhere in its loop — a
//! service is a plain OS thread running to completion — so there is
//! nothing to race. The wait phase here polls `ServiceHandle::state`
//! instead, on a short fixed interval, bounded by the same deadline.
//! The other asymmetry worth naming: the original can *force* a stuck
//! target closed because closing is just resolving a future it already
//! owns. A stuck `std::thread` cannot be force-terminated at all from
//! the outside in safe Rust, so a service that blows through its
//! deadline here is reported as timed out and its `JoinHandle` is
//! dropped (which detaches the thread) rather than joined — the
//! coordinator gives up waiting on it, it does not kill it.

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use relay_core::ids::ServiceId;
use relay_service::{ServiceHandle, ServiceState};

use crate::manager::ServiceManager;

/// How a single service's shutdown resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownStatus {
    /// Reached `Stopped` within the deadline.
    Completed,
    /// The deadline elapsed first; the service's thread was abandoned
    /// rather than joined.
    TimedOut,
}

/// One service's outcome, returned as part of a [`ShutdownReport`].
#[derive(Clone, Debug)]
pub struct ShutdownRecord {
    pub id: ServiceId,
    pub name: String,
    pub status: ShutdownStatus,
    pub elapsed: Duration,
}

/// The outcome of a [`GracefulShutdownCoordinator::shutdown`] call.
#[derive(Clone, Debug, Default)]
pub struct ShutdownReport {
    pub records: Vec<ShutdownRecord>,
}

impl ShutdownReport {
    pub fn all_completed(&self) -> bool {
        self.records.iter().all(|r| r.status == ShutdownStatus::Completed)
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Drives every service in a [`ServiceManager`] through a bounded
/// graceful stop: request, then wait, one service at a time, each
/// bounded by the same overall deadline.
pub struct GracefulShutdownCoordinator {
    targets: Vec<(ServiceHandle, JoinHandle<()>)>,
}

impl GracefulShutdownCoordinator {
    /// Takes ownership of every service currently registered in
    /// `manager`, leaving it empty. Services created after this call
    /// returns are not part of this shutdown.
    pub fn drain_from(manager: &ServiceManager) -> Self {
        Self {
            targets: manager.drain(),
        }
    }

    /// Requests every target stop, then waits for each in turn (service
    /// threads run independently, so one service being slow to stop
    /// does not delay another from being observed as stopped) bounded
    /// by `deadline` measured from the moment this call starts, not per
    /// service.
    pub fn shutdown(self, deadline: Duration) -> ShutdownReport {
        let deadline_at = Instant::now() + deadline;

        for (handle, _) in &self.targets {
            tracing::info!(id = %handle.id(), service = handle.name(), "requesting service stop");
            handle.request_stop();
        }

        let mut records = Vec::with_capacity(self.targets.len());
        for (handle, join) in self.targets {
            let start = Instant::now();
            let mut status = ShutdownStatus::TimedOut;
            loop {
                if handle.state() == ServiceState::Stopped {
                    status = ShutdownStatus::Completed;
                    break;
                }
                if Instant::now() >= deadline_at {
                    break;
                }
                let remaining = deadline_at.saturating_duration_since(Instant::now());
                std::thread::sleep(POLL_INTERVAL.min(remaining.max(Duration::from_millis(1))));
            }

            match status {
                ShutdownStatus::Completed => {
                    // The loop thread has already returned from `run`
                    // by the time `state()` observes `Stopped`, so this
                    // join is immediate.
                    let _ = join.join();
                }
                ShutdownStatus::TimedOut => {
                    tracing::warn!(
                        id = %handle.id(),
                        service = handle.name(),
                        "service did not stop within the shutdown deadline; abandoning its thread"
                    );
                    drop(join);
                }
            }

            records.push(ShutdownRecord {
                id: handle.id(),
                name: handle.name().to_string(),
                status,
                elapsed: start.elapsed(),
            });
        }

        ShutdownReport { records }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::component::Component;
    use relay_core::config::{ConfigTree, ConfigValue};
    use relay_core::config::ServiceConfig;
    use relay_core::error::CoreError;
    use relay_core::poller::Poller as PollerTrait;
    use relay_service::ServiceBuilder;
    use std::sync::Arc;

    struct NullPoller;
    impl PollerTrait for NullPoller {
        fn send(&self, _session_id: relay_core::ids::SessionId, _bytes: bytes::Bytes) -> Result<(), CoreError> {
            Ok(())
        }
        fn close(&self, _session_id: relay_core::ids::SessionId) {}
        fn is_open(&self, _session_id: relay_core::ids::SessionId) -> bool {
            false
        }
    }

    fn config(name: &str) -> ServiceConfig {
        let tree = ConfigTree::new()
            .with("name", ConfigValue::String(name.into()))
            .with("fps", ConfigValue::Int(200))
            .with("frameDrainCap", ConfigValue::Int(64));
        ServiceConfig::from_tree(&tree).unwrap()
    }

    #[test]
    fn a_responsive_service_reports_completed_well_within_deadline() {
        let manager = ServiceManager::new();
        let (handle, service) = ServiceBuilder::new(config("quick"), Arc::new(NullPoller)).build();
        let id = handle.id();
        manager.create(handle, service).unwrap();

        let report = GracefulShutdownCoordinator::drain_from(&manager).shutdown(Duration::from_secs(2));

        assert!(report.all_completed());
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].id, id);
        assert_eq!(report.records[0].status, ShutdownStatus::Completed);
        assert!(manager.is_empty());
    }

    #[test]
    fn a_service_stuck_past_its_deadline_is_reported_timed_out() {
        struct Stuck;
        impl Component for Stuck {
            fn name(&self) -> &str {
                "stuck"
            }
            fn on_stop(&self) -> Result<(), CoreError> {
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            }
        }

        let manager = ServiceManager::new();
        let mut builder = ServiceBuilder::new(config("stuck"), Arc::new(NullPoller));
        builder.register_component(Arc::new(Stuck)).unwrap();
        let (handle, service) = builder.build();
        manager.create(handle, service).unwrap();

        let report = GracefulShutdownCoordinator::drain_from(&manager).shutdown(Duration::from_millis(10));

        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].status, ShutdownStatus::TimedOut);
    }
}
