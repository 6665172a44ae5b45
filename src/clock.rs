use chrono::{DateTime, Utc};

/// A source of wall-clock time, injectable so tests can fix `now()`.
///
/// The store only ever calls `now()` to stamp `created_at`/`delivered_at`
/// and to derive `ttl`; it never sleeps or polls a clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The default clock used outside of tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test-only clock implementations, exposed publicly behind the
/// `test-util` feature so both this crate's own tests and an external
/// integration test binary can fix time deterministically.
#[cfg(feature = "test-util")]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// A clock that always returns the same fixed instant, for exercising
    /// the TTL law (P5) without relying on wall-clock timing.
    pub struct FixedClock(Mutex<DateTime<Utc>>);

    impl FixedClock {
        pub fn new(at: DateTime<Utc>) -> Self {
            Self(Mutex::new(at))
        }

        pub fn advance(&self, by: chrono::Duration) {
            let mut guard = self.0.lock().unwrap();
            *guard += by;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }
}
