// libs/appointment-cell/src/services/calendar.rs
//
// Time and calendar primitives: half-open intervals, overlap, and
// clinic-timezone weekday / time-of-day extraction.

use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntervalError {
    #[error("end ({end}) must be after start ({start})")]
    EndNotAfterStart {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("duration must be positive, got {0} minutes")]
    NonPositiveDuration(i64),
}

/// A half-open time range `[start, end)`. Construction rejects `end <= start`,
/// so every value in circulation is well formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawInterval")]
pub struct Interval {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RawInterval {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TryFrom<RawInterval> for Interval {
    type Error = IntervalError;

    fn try_from(raw: RawInterval) -> Result<Self, Self::Error> {
        Interval::new(raw.start, raw.end)
    }
}

impl Interval {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, IntervalError> {
        if end <= start {
            return Err(IntervalError::EndNotAfterStart { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn from_duration(start: DateTime<Utc>, minutes: i64) -> Result<Self, IntervalError> {
        if minutes <= 0 {
            return Err(IntervalError::NonPositiveDuration(minutes));
        }
        Self::new(start, start + Duration::minutes(minutes))
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// Half-open overlap: touching endpoints (`a.end == b.start`) do not overlap.
pub fn overlaps(a: &Interval, b: &Interval) -> bool {
    a.start < b.end && b.start < a.end
}

pub fn weekday(timestamp: DateTime<Utc>, timezone: Tz) -> Weekday {
    timestamp.with_timezone(&timezone).weekday()
}

/// Offset of the local wall-clock time from local midnight, to the nanosecond.
pub fn time_of_day(timestamp: DateTime<Utc>, timezone: Tz) -> Duration {
    since_midnight(timestamp.with_timezone(&timezone).time())
}

pub fn since_midnight(time: NaiveTime) -> Duration {
    Duration::seconds(i64::from(time.num_seconds_from_midnight()))
        + Duration::nanoseconds(i64::from(time.nanosecond()))
}

pub fn full_day() -> Duration {
    Duration::days(1)
}

pub fn local_date(timestamp: DateTime<Utc>, timezone: Tz) -> NaiveDate {
    timestamp.with_timezone(&timezone).date_naive()
}

/// An interval projected onto one local calendar day of the clinic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalDaySpan {
    pub weekday: Weekday,
    /// Offset of the start from local midnight.
    pub start: Duration,
    /// Exclusive; a full day when the interval ends exactly at the next midnight.
    pub end: Duration,
    /// False when the interval runs past the end of its start day.
    pub within_single_day: bool,
}

/// The clinic's configured timezone, used for every wall-clock decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClinicCalendar {
    timezone: Tz,
}

impl ClinicCalendar {
    pub fn new(timezone: Tz) -> Self {
        Self { timezone }
    }

    pub fn from_name(name: &str) -> Result<Self, String> {
        name.parse::<Tz>()
            .map(Self::new)
            .map_err(|e| format!("invalid clinic timezone '{}': {}", name, e))
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn weekday(&self, timestamp: DateTime<Utc>) -> Weekday {
        weekday(timestamp, self.timezone)
    }

    pub fn time_of_day(&self, timestamp: DateTime<Utc>) -> Duration {
        time_of_day(timestamp, self.timezone)
    }

    pub fn local_date(&self, timestamp: DateTime<Utc>) -> NaiveDate {
        local_date(timestamp, self.timezone)
    }

    pub fn day_span(&self, interval: &Interval) -> LocalDaySpan {
        let start_date = self.local_date(interval.start());
        let end_date = self.local_date(interval.end());
        let start = self.time_of_day(interval.start());
        let raw_end = self.time_of_day(interval.end());

        let ends_at_next_midnight =
            raw_end.is_zero() && start_date.succ_opt() == Some(end_date);

        let (end, within_single_day) = if end_date == start_date {
            (raw_end, true)
        } else {
            (full_day(), ends_at_next_midnight)
        };

        LocalDaySpan {
            weekday: self.weekday(interval.start()),
            start,
            end,
            within_single_day,
        }
    }
}

impl Default for ClinicCalendar {
    fn default() -> Self {
        Self::new(Tz::UTC)
    }
}

/// Source of "now" for timestamps written by the state machine.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock pinned to one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock {
    now: DateTime<Utc>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, h, m, 0).unwrap()
    }

    fn iv(sh: u32, sm: u32, eh: u32, em: u32) -> Interval {
        Interval::new(at(sh, sm), at(eh, em)).unwrap()
    }

    #[test]
    fn rejects_empty_and_inverted_intervals() {
        assert!(Interval::new(at(9, 0), at(9, 0)).is_err());
        assert!(Interval::new(at(10, 0), at(9, 0)).is_err());
        assert_eq!(
            Interval::from_duration(at(9, 0), 0),
            Err(IntervalError::NonPositiveDuration(0))
        );
    }

    #[test]
    fn back_to_back_intervals_do_not_overlap() {
        let a = iv(9, 0, 9, 30);
        let b = iv(9, 30, 10, 0);
        assert!(!overlaps(&a, &b));
        assert!(!overlaps(&b, &a));
    }

    #[test]
    fn overlap_is_symmetric() {
        let cases = [
            (iv(9, 0, 9, 30), iv(9, 15, 9, 45)),
            (iv(9, 0, 12, 0), iv(10, 0, 10, 30)),
            (iv(9, 0, 9, 30), iv(11, 0, 11, 30)),
            (iv(8, 0, 9, 0), iv(9, 0, 10, 0)),
            (iv(9, 0, 10, 0), iv(9, 0, 10, 0)),
        ];
        for (a, b) in cases {
            assert_eq!(overlaps(&a, &b), overlaps(&b, &a), "{} vs {}", a, b);
        }
        assert!(overlaps(&cases[0].0, &cases[0].1));
        assert!(overlaps(&cases[1].0, &cases[1].1));
        assert!(!overlaps(&cases[2].0, &cases[2].1));
        assert!(overlaps(&cases[4].0, &cases[4].1));
    }

    #[test]
    fn weekday_and_time_of_day_follow_clinic_timezone() {
        // 2024-06-02 23:30 UTC is Monday 01:30 in Madrid (UTC+2 in summer).
        let ts = Utc.with_ymd_and_hms(2024, 6, 2, 23, 30, 0).unwrap();
        let madrid = ClinicCalendar::from_name("Europe/Madrid").unwrap();

        assert_eq!(weekday(ts, Tz::UTC), Weekday::Sun);
        assert_eq!(madrid.weekday(ts), Weekday::Mon);
        assert_eq!(madrid.time_of_day(ts), Duration::minutes(90));
    }

    #[test]
    fn day_span_handles_midnight_end_and_overnight_intervals() {
        let calendar = ClinicCalendar::default();
        let until_midnight = Interval::new(
            at(23, 0),
            Utc.with_ymd_and_hms(2024, 6, 4, 0, 0, 0).unwrap(),
        )
        .unwrap();
        let span = calendar.day_span(&until_midnight);
        assert_eq!(span.end, full_day());
        assert!(span.within_single_day);

        let past_midnight = Interval::new(
            at(23, 0),
            Utc.with_ymd_and_hms(2024, 6, 4, 0, 0, 30).unwrap(),
        )
        .unwrap();
        assert!(!calendar.day_span(&past_midnight).within_single_day);

        let overnight = Interval::new(
            at(23, 0),
            Utc.with_ymd_and_hms(2024, 6, 4, 1, 0, 0).unwrap(),
        )
        .unwrap();
        assert!(!calendar.day_span(&overnight).within_single_day);
    }

    #[test]
    fn time_of_day_keeps_seconds_and_fractions() {
        let ts = Utc.with_ymd_and_hms(2024, 6, 3, 12, 0, 45).unwrap() + Duration::milliseconds(250);
        assert_eq!(
            time_of_day(ts, Tz::UTC),
            Duration::hours(12) + Duration::seconds(45) + Duration::milliseconds(250)
        );
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        assert!(ClinicCalendar::from_name("Mars/Olympus").is_err());
    }

    #[test]
    fn interval_deserialization_validates_order() {
        let ok: Result<Interval, _> = serde_json::from_str(
            r#"{"start":"2024-06-03T09:00:00Z","end":"2024-06-03T09:30:00Z"}"#,
        );
        assert!(ok.is_ok());

        let bad: Result<Interval, _> = serde_json::from_str(
            r#"{"start":"2024-06-03T09:30:00Z","end":"2024-06-03T09:00:00Z"}"#,
        );
        assert!(bad.is_err());
    }
}
