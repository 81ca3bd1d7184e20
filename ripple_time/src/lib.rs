//! Abstract time handling so that tests can control "now" instead of reading the system clock.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use std::{
    fmt::Display,
    ops::{Add, Sub},
    time::Duration,
};

/// An instant in time, with millisecond precision guarantees.
///
/// Internally this is a UTC datetime, but only the millisecond timestamp is
/// considered canonical: round-trips through [`Time::timestamp_millis`] are
/// exact, anything finer is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(DateTime<Utc>);

impl Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl Time {
    /// Create a [`Time`] from a timestamp in milliseconds since the Unix epoch.
    ///
    /// # Panics
    ///
    /// Panics if the timestamp is outside the range representable by a datetime.
    pub fn from_timestamp_millis(ms: i64) -> Self {
        Self(
            Utc.timestamp_millis_opt(ms)
                .single()
                .expect("timestamp in representable range"),
        )
    }

    /// Create a [`Time`] from an explicit UTC datetime.
    pub fn from_date_time(time: DateTime<Utc>) -> Self {
        Self(time)
    }

    /// Milliseconds since the Unix epoch.
    pub fn timestamp_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// The underlying datetime.
    pub fn date_time(&self) -> DateTime<Utc> {
        self.0
    }
}

impl Add<Duration> for Time {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0 + chrono::Duration::from_std(rhs).expect("duration in range"))
    }
}

impl Sub<Duration> for Time {
    type Output = Self;

    fn sub(self, rhs: Duration) -> Self::Output {
        Self(self.0 - chrono::Duration::from_std(rhs).expect("duration in range"))
    }
}

/// A source of wall-clock time.
///
/// Production code uses [`SystemProvider`]; tests inject a [`MockProvider`]
/// so that clock-dependent behavior is deterministic.
pub trait TimeProvider: std::fmt::Debug + Send + Sync + 'static {
    /// Returns the current [`Time`].
    fn now(&self) -> Time;
}

/// A [`TimeProvider`] that reads the system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider;

impl SystemProvider {
    /// Create a new system clock provider.
    pub fn new() -> Self {
        Self
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> Time {
        Time(Utc::now())
    }
}

/// A [`TimeProvider`] that returns a value explicitly set by tests.
#[derive(Debug)]
pub struct MockProvider {
    now: RwLock<Time>,
}

impl MockProvider {
    /// Create a mock provider frozen at the given instant.
    pub fn new(now: Time) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    /// Set the provider to the given instant.
    pub fn set(&self, time: Time) {
        *self.now.write() = time
    }

    /// Advance the provider by `duration`, returning the new instant.
    pub fn inc(&self, duration: Duration) -> Time {
        let mut now = self.now.write();
        *now = *now + duration;
        *now
    }
}

impl TimeProvider for MockProvider {
    fn now(&self) -> Time {
        *self.now.read()
    }
}

impl<T: TimeProvider> TimeProvider for std::sync::Arc<T> {
    fn now(&self) -> Time {
        (**self).now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_round_trip() {
        let time = Time::from_timestamp_millis(1695312);
        assert_eq!(time.timestamp_millis(), 1695312);

        let time = Time::from_timestamp_millis(0);
        assert_eq!(time.timestamp_millis(), 0);
    }

    #[test]
    fn ordering() {
        let t0 = Time::from_timestamp_millis(100);
        let t1 = Time::from_timestamp_millis(101);
        assert!(t0 < t1);
        assert_eq!(t0, Time::from_timestamp_millis(100));
    }

    #[test]
    fn arithmetic() {
        let t0 = Time::from_timestamp_millis(100);
        assert_eq!(
            t0 + Duration::from_millis(400),
            Time::from_timestamp_millis(500)
        );
        assert_eq!(
            t0 - Duration::from_millis(50),
            Time::from_timestamp_millis(50)
        );
    }

    #[test]
    fn system_provider_moves_forward() {
        let provider = SystemProvider::new();
        let a = provider.now();
        let b = provider.now();
        assert!(a <= b);
        assert!(a.timestamp_millis() > 0);
    }

    #[test]
    fn mock_provider_is_settable() {
        let provider = MockProvider::new(Time::from_timestamp_millis(100));
        assert_eq!(provider.now(), Time::from_timestamp_millis(100));

        provider.set(Time::from_timestamp_millis(500));
        assert_eq!(provider.now(), Time::from_timestamp_millis(500));

        let advanced = provider.inc(Duration::from_millis(10));
        assert_eq!(advanced, Time::from_timestamp_millis(510));
        assert_eq!(provider.now(), Time::from_timestamp_millis(510));
    }
}
