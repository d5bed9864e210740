//! Monotonic time, decoupled from the wall clock so timers never observe
//! a clock step.

use std::time::{Duration, Instant};

/// A point on a monotonic timeline. Only differences between two
/// `MonotonicTimePoint`s are meaningful; the absolute value carries no
/// calendar meaning.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MonotonicTimePoint(Instant);

impl MonotonicTimePoint {
    pub fn duration_since(&self, earlier: MonotonicTimePoint) -> Duration {
        self.0.saturating_duration_since(earlier.0)
    }

    pub fn checked_add(&self, delta: Duration) -> Option<MonotonicTimePoint> {
        self.0.checked_add(delta).map(MonotonicTimePoint)
    }
}

/// A source of monotonic time. Abstracted behind a trait so timer-wheel
/// tests can drive a fake clock deterministically instead of racing the
/// real one.
pub trait MonotonicClock: Send + Sync {
    fn now(&self) -> MonotonicTimePoint;
}

/// The default clock, backed by `std::time::Instant`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemMonotonicClock;

impl MonotonicClock for SystemMonotonicClock {
    fn now(&self) -> MonotonicTimePoint {
        MonotonicTimePoint(Instant::now())
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod test_util {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// A clock whose `now()` only advances when told to, for deterministic
    /// timer-wheel tests.
    #[derive(Default)]
    pub struct FakeClock {
        base: LazyBase,
        elapsed_nanos: AtomicU64,
    }

    // `Instant` has no const constructor we can stash in a `Default` impl
    // without calling `Instant::now()` at an unpredictable time, so the
    // base instant is captured lazily on first use.
    #[derive(Default)]
    struct LazyBase(std::sync::OnceLock<Instant>);

    impl FakeClock {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn advance(&self, delta: Duration) {
            self.elapsed_nanos
                .fetch_add(delta.as_nanos() as u64, Ordering::SeqCst);
        }
    }

    impl MonotonicClock for FakeClock {
        fn now(&self) -> MonotonicTimePoint {
            let base = *self.base.0.get_or_init(Instant::now);
            let elapsed = self.elapsed_nanos.load(Ordering::SeqCst);
            MonotonicTimePoint(base + Duration::from_nanos(elapsed))
        }
    }
}
