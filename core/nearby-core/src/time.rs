// Copyright Nearby Connections Contributors
// SPDX-License-Identifier: Apache-2.0

//! A thin clock abstraction so components that reason about keep-alive
//! timeouts, handshake deadlines and upgrade close-delays can be tested
//! without sleeping real wall-clock time.

use std::time::{Duration, Instant};

/// A monotonic point in time, opaque except for the ability to measure the
/// [`Duration`] elapsed since another `Timestamp`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(Instant);

impl Timestamp {
    /// Returns the duration elapsed between an earlier timestamp and this one.
    ///
    /// Returns `Duration::ZERO` if `earlier` is actually later than `self`,
    /// rather than panicking — callers compute this across async
    /// suspension points where strict ordering isn't guaranteed.
    pub fn saturating_duration_since(self, earlier: Timestamp) -> Duration {
        self.0.saturating_duration_since(earlier.0)
    }

    /// Returns a new timestamp `duration` after this one.
    pub fn checked_add(self, duration: Duration) -> Option<Timestamp> {
        self.0.checked_add(duration).map(Timestamp)
    }
}

/// A source of [`Timestamp`]s, abstracted so tests can substitute a fake
/// clock instead of `Instant::now()`.
pub trait Clock: Send + Sync {
    /// Returns the current timestamp.
    fn now(&self) -> Timestamp;
}

/// The default [`Clock`], backed by [`Instant::now`].
#[derive(Clone, Copy, Debug, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Timestamp {
        Timestamp(Instant::now())
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// A clock that only advances when told to, for deterministic timeout tests.
    #[derive(Clone)]
    pub struct FakeClock {
        inner: Arc<Mutex<Instant>>,
    }

    impl FakeClock {
        pub fn new() -> Self {
            Self {
                inner: Arc::new(Mutex::new(Instant::now())),
            }
        }

        pub fn advance(&self, by: Duration) {
            let mut guard = self.inner.lock().unwrap();
            *guard += by;
        }
    }

    impl Default for FakeClock {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> Timestamp {
            Timestamp(*self.inner.lock().unwrap())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_since_saturates_instead_of_panicking() {
        let clock = MonotonicClock;
        let earlier = clock.now();
        let later = earlier.checked_add(Duration::from_secs(5)).unwrap();
        assert_eq!(earlier.saturating_duration_since(later), Duration::ZERO);
        assert_eq!(
            later.saturating_duration_since(earlier),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn fake_clock_only_moves_when_advanced() {
        let clock = testing::FakeClock::new();
        let t0 = clock.now();
        assert_eq!(clock.now(), t0);
        clock.advance(Duration::from_secs(1));
        assert!(clock.now() > t0);
    }
}
