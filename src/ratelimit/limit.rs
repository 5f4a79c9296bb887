//! Quota values supplied on every limiter call.

use std::fmt;
use std::time::Duration;

/// Common periods a [`Limit`] is expressed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeWindow {
    /// Per-second rate limiting
    Second,
    /// Per-minute rate limiting
    Minute,
    /// Per-hour rate limiting
    Hour,
    /// Per-day rate limiting
    Day,
}

impl TimeWindow {
    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        match self {
            TimeWindow::Second => Duration::from_secs(1),
            TimeWindow::Minute => Duration::from_secs(60),
            TimeWindow::Hour => Duration::from_secs(3600),
            TimeWindow::Day => Duration::from_secs(86400),
        }
    }
}

/// A rate limit: `rate` units per `period`, with up to `burst` units
/// grantable at once when fully replenished.
///
/// Limits are plain values. They are passed with every call and never
/// persisted, so two callers may apply different limits to the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Limit {
    /// Units replenished per period. Must be positive.
    pub rate: i64,
    /// Length of the replenishment period. Must be non-zero.
    pub period: Duration,
    /// Maximum units grantable instantaneously. Must not be negative.
    pub burst: i64,
}

impl Limit {
    /// Create a limit over an arbitrary period.
    pub fn new(rate: i64, period: Duration, burst: i64) -> Self {
        Self {
            rate,
            period,
            burst,
        }
    }

    /// Create a limit over one of the common windows.
    pub fn per_window(window: TimeWindow, rate: i64, burst: i64) -> Self {
        Self::new(rate, window.duration(), burst)
    }

    /// `rate` requests per second with the given burst.
    pub fn per_second(rate: i64, burst: i64) -> Self {
        Self::per_window(TimeWindow::Second, rate, burst)
    }

    /// `rate` requests per minute with the given burst.
    pub fn per_minute(rate: i64, burst: i64) -> Self {
        Self::per_window(TimeWindow::Minute, rate, burst)
    }

    /// `rate` requests per hour with the given burst.
    pub fn per_hour(rate: i64, burst: i64) -> Self {
        Self::per_window(TimeWindow::Hour, rate, burst)
    }

    /// `rate` requests per day with the given burst.
    pub fn per_day(rate: i64, burst: i64) -> Self {
        Self::per_window(TimeWindow::Day, rate, burst)
    }

    /// Whether this is the all-zero limit.
    pub fn is_zero(&self) -> bool {
        *self == Limit::default()
    }

    /// Time cost of a single unit, in seconds.
    pub fn emission_interval(&self) -> f64 {
        self.period.as_secs_f64() / self.rate as f64
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} req/", self.rate)?;
        match self.period {
            p if p == TimeWindow::Second.duration() => f.write_str("s")?,
            p if p == TimeWindow::Minute.duration() => f.write_str("m")?,
            p if p == TimeWindow::Hour.duration() => f.write_str("h")?,
            p => write!(f, "{:?}", p)?,
        }
        write!(f, " (burst {})", self.burst)
    }
}
