//! Time source used for cache dates, expiry checks and call durations.
//!
//! Stored timestamps are unix milliseconds; an expiry of `0` marks an entry
//! as invalidated.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use time::OffsetDateTime;

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/// Wall clock in UTC.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Clock that only moves when told to. Used to drive expiry deterministically.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self::at_millis(unix_millis(start))
    }

    pub fn at_millis(millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(millis),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(duration_millis(by), Ordering::SeqCst);
    }

    pub fn set(&self, at: OffsetDateTime) {
        self.millis.store(unix_millis(at), Ordering::SeqCst);
    }

    pub fn millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        from_unix_millis(self.millis())
    }
}

pub fn unix_millis(at: OffsetDateTime) -> i64 {
    i64::try_from(at.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

/// Converts unix milliseconds back into a date, saturating to the epoch when out of range.
pub fn from_unix_millis(millis: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

pub fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Time elapsed between two instants, clamped to zero when `to` precedes `from`.
pub fn elapsed(from: OffsetDateTime, to: OffsetDateTime) -> Duration {
    Duration::try_from(to - from).unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn manual_clock_only_moves_when_advanced() {
        let clock = ManualClock::at_millis(1_000);
        assert_eq!(unix_millis(clock.now()), 1_000);

        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.millis(), 6_000);

        clock.set(datetime!(2024-01-01 00:00 UTC));
        assert_eq!(clock.now(), datetime!(2024-01-01 00:00 UTC));
    }

    #[test]
    fn millis_conversion_is_reversible() {
        let at = datetime!(2023-06-15 12:30:45.123 UTC);
        assert_eq!(from_unix_millis(unix_millis(at)), at);
        assert_eq!(from_unix_millis(0), OffsetDateTime::UNIX_EPOCH);
    }

    #[test]
    fn elapsed_never_goes_negative() {
        let earlier = from_unix_millis(1_000);
        let later = from_unix_millis(3_500);
        assert_eq!(elapsed(earlier, later), Duration::from_millis(2_500));
        assert_eq!(elapsed(later, earlier), Duration::ZERO);
    }
}
