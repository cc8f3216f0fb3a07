//! Time source and merchant-local calendar math.
//!
//! The limiter and the detector never call `Utc::now()` directly; they take a
//! [`Clock`] so tests can drive time deterministically. Calendar helpers
//! translate an instant into a merchant's local day/week boundaries using the
//! merchant's fixed UTC offset (minutes); the platform models timezones as
//! fixed offsets from a curated table, so no DST arithmetic is needed here.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Datelike, FixedOffset, LocalResult, NaiveTime, Offset, TimeDelta, Timelike, Utc};

/// Supplies wall-clock time to the admission path.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Deterministic clock for tests, stored as epoch milliseconds.
///
/// `advance` is atomic so concurrent test threads observe a consistent,
/// monotonically moving time.
#[derive(Debug)]
pub struct ManualClock {
    epoch_ms: AtomicI64,
}

impl ManualClock {
    /// Creates a clock pinned to the given instant.
    #[must_use]
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            epoch_ms: AtomicI64::new(at.timestamp_millis()),
        }
    }

    /// Moves the clock forward by the given number of seconds.
    pub fn advance_secs(&self, secs: i64) {
        self.epoch_ms.fetch_add(secs.saturating_mul(1000), Ordering::SeqCst);
    }

    /// Moves the clock forward by the given number of milliseconds.
    pub fn advance_ms(&self, ms: i64) {
        self.epoch_ms.fetch_add(ms, Ordering::SeqCst);
    }

    /// Pins the clock to a new instant.
    pub fn set(&self, at: DateTime<Utc>) {
        self.epoch_ms.store(at.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let ms = self.epoch_ms.load(Ordering::SeqCst);
        DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
    }
}

/// Resolves a fixed offset from merchant-configured minutes east of UTC.
///
/// Offsets are validated at configuration-save time; an out-of-range value
/// that somehow reaches here falls back to UTC rather than skewing counts.
#[must_use]
fn fixed_offset(offset_minutes: i32) -> FixedOffset {
    FixedOffset::east_opt(offset_minutes.saturating_mul(60)).unwrap_or_else(|| Utc.fix())
}

fn to_utc(naive: chrono::NaiveDateTime, offset: FixedOffset, fallback: DateTime<Utc>) -> DateTime<Utc> {
    match naive.and_local_timezone(offset) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        // Fixed offsets never produce ambiguous or missing local times.
        _ => fallback,
    }
}

/// Start of the merchant-local day containing `at`, as a UTC instant.
#[must_use]
pub fn local_day_start(at: DateTime<Utc>, offset_minutes: i32) -> DateTime<Utc> {
    let offset = fixed_offset(offset_minutes);
    let local = at.with_timezone(&offset);
    to_utc(local.date_naive().and_time(NaiveTime::MIN), offset, at)
}

/// Start of the merchant-local week (Monday 00:00) containing `at`.
#[must_use]
pub fn local_week_start(at: DateTime<Utc>, offset_minutes: i32) -> DateTime<Utc> {
    let offset = fixed_offset(offset_minutes);
    let local = at.with_timezone(&offset);
    let day_start = local.date_naive().and_time(NaiveTime::MIN);
    let days_from_monday = i64::from(local.weekday().num_days_from_monday());
    to_utc(day_start - TimeDelta::days(days_from_monday), offset, at)
}

/// Merchant-local hour of day (0..=23) for `at`.
#[must_use]
pub fn local_hour(at: DateTime<Utc>, offset_minutes: i32) -> u32 {
    at.with_timezone(&fixed_offset(offset_minutes)).hour()
}

/// Merchant-local weekday (0 = Sunday .. 6 = Saturday) for `at`.
#[must_use]
pub fn local_weekday(at: DateTime<Utc>, offset_minutes: i32) -> u8 {
    let wd = at
        .with_timezone(&fixed_offset(offset_minutes))
        .weekday()
        .num_days_from_sunday();
    // num_days_from_sunday is always 0..=6
    wd as u8
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(at(2024, 6, 1, 12, 0, 0));
        assert_eq!(clock.now(), at(2024, 6, 1, 12, 0, 0));
        clock.advance_secs(90);
        assert_eq!(clock.now(), at(2024, 6, 1, 12, 1, 30));
    }

    #[test]
    fn test_local_day_start_utc() {
        let now = at(2024, 6, 5, 15, 30, 0);
        assert_eq!(local_day_start(now, 0), at(2024, 6, 5, 0, 0, 0));
    }

    #[test]
    fn test_local_day_start_with_offset() {
        // 01:00 UTC on June 5 is 04:00 local at UTC+3, so the local day
        // started at 00:00 local = 21:00 UTC the previous day.
        let now = at(2024, 6, 5, 1, 0, 0);
        assert_eq!(local_day_start(now, 180), at(2024, 6, 4, 21, 0, 0));
    }

    #[test]
    fn test_local_week_start_is_monday() {
        // 2024-06-05 is a Wednesday; the week started Monday 2024-06-03.
        let now = at(2024, 6, 5, 15, 0, 0);
        assert_eq!(local_week_start(now, 0), at(2024, 6, 3, 0, 0, 0));
    }

    #[test]
    fn test_local_week_start_sunday_belongs_to_previous_monday() {
        // 2024-06-09 is a Sunday; ISO weeks start Monday, so the week
        // started on 2024-06-03, not 2024-06-09.
        let now = at(2024, 6, 9, 10, 0, 0);
        assert_eq!(local_week_start(now, 0), at(2024, 6, 3, 0, 0, 0));
    }

    #[test]
    fn test_local_hour_with_offset() {
        let now = at(2024, 6, 5, 23, 30, 0);
        assert_eq!(local_hour(now, 0), 23);
        // UTC+3: 02:30 local, inside the night window.
        assert_eq!(local_hour(now, 180), 2);
    }

    #[test]
    fn test_local_weekday_numbering() {
        // 2024-06-02 is a Sunday.
        assert_eq!(local_weekday(at(2024, 6, 2, 12, 0, 0), 0), 0);
        // 2024-06-08 is a Saturday.
        assert_eq!(local_weekday(at(2024, 6, 8, 12, 0, 0), 0), 6);
    }

    #[test]
    fn test_invalid_offset_falls_back_to_utc() {
        let now = at(2024, 6, 5, 15, 30, 0);
        assert_eq!(local_day_start(now, 100_000), local_day_start(now, 0));
    }
}
