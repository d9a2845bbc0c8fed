//! Clock abstraction for testable time-dependent behavior.
//!
//! Every component that needs wall-clock time (retention sweeps, inactivity
//! alarms, token expiry checks, retry timeouts) takes a `Clock` rather than
//! calling `Utc::now()` directly, so tests can substitute a fixed or
//! manually-advanced clock.

use chrono::{DateTime, Utc};

/// Abstracts wall-clock time so components can be driven deterministically in tests.
///
/// # Examples
///
/// ```
/// use pubsub_core::clock::{Clock, SystemClock};
///
/// let clock = SystemClock;
/// let now = clock.now();
/// assert!(now.timestamp() > 0);
/// ```
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;

    /// Returns the current time as unix seconds.
    ///
    /// Default implementation derived from [`Clock::now`].
    fn unix_seconds(&self) -> i64 {
        self.now().timestamp()
    }
}

/// A `Clock` backed by the operating system's real time source.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A `Clock` with a manually-controlled time, for deterministic tests.
///
/// # Examples
///
/// ```
/// use chrono::Utc;
/// use pubsub_core::clock::{Clock, FixedClock};
///
/// let clock = FixedClock::new(Utc::now());
/// let t0 = clock.now();
/// clock.advance(chrono::Duration::seconds(5));
/// assert!(clock.now() > t0);
/// ```
#[derive(Debug)]
pub struct FixedClock {
    inner: std::sync::Mutex<DateTime<Utc>>,
}

impl FixedClock {
    /// Creates a clock fixed at `time`.
    #[must_use]
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            inner: std::sync::Mutex::new(time),
        }
    }

    /// Advances the clock by `duration`.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn advance(&self, duration: chrono::Duration) {
        let mut guard = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard += duration;
    }

    /// Sets the clock to an absolute time.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn set(&self, time: DateTime<Utc>) {
        let mut guard = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = time;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
