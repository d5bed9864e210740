//! Newtype identifiers. Kept as distinct types rather than bare integers
//! so a `ServiceId` can never be passed where a `SessionId` is expected.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! sequential_id {
    ($name:ident, $counter:ident) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u64);

        static $counter: AtomicU64 = AtomicU64::new(1);

        impl $name {
            /// Allocates the next value from this type's process-wide
            /// counter. Never returns zero; zero is reserved as "no id".
            pub fn next() -> Self {
                Self($counter.fetch_add(1, Ordering::Relaxed))
            }

            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn as_raw(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

sequential_id!(ServiceId, SERVICE_ID_COUNTER);
sequential_id!(SessionId, SESSION_ID_COUNTER);
sequential_id!(TimerId, TIMER_ID_COUNTER);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_and_monotonic_within_type() {
        let a = ServiceId::next();
        let b = ServiceId::next();
        assert_ne!(a, b);
        assert!(b.as_raw() > a.as_raw());
    }

    #[test]
    fn from_raw_round_trips() {
        let id = TimerId::from_raw(42);
        assert_eq!(id.as_raw(), 42);
    }
}
