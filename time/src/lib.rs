//! The time model shared by the runtime and the store.
//!
//! All instants are measured in 100-nanosecond ticks (hectonanoseconds,
//! "hns") since the Unix epoch. [`Time`] is an absolute instant,
//! [`TimeSpan`] a signed difference, and the interval types describe
//! bounded or unbounded windows over either. [`TickCalibration`] maps a
//! high-resolution monotonic counter onto absolute time, and [`Clock`]
//! maps absolute time onto the virtual time of a running pipeline.

pub mod calibration;
pub mod clock;
pub mod interval;

pub use calibration::TickCalibration;
pub use clock::Clock;
pub use interval::{IntervalEndpoint, RelativeTimeInterval, TimeInterval};

use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Ticks per second (one tick is 100 ns).
pub const TICKS_PER_SECOND: i64 = 10_000_000;
/// Ticks per millisecond.
pub const TICKS_PER_MILLISECOND: i64 = 10_000;
/// Ticks per microsecond.
pub const TICKS_PER_MICROSECOND: i64 = 10;

/// An absolute instant in 100 ns ticks since the Unix epoch.
///
/// `Time::MIN` and `Time::MAX` are distinguished unbounded values;
/// arithmetic saturates at them rather than wrapping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Time {
    ticks: i64,
}

impl Time {
    /// The earliest representable instant.
    pub const MIN: Time = Time { ticks: i64::MIN };
    /// The latest representable instant.
    pub const MAX: Time = Time { ticks: i64::MAX };

    /// Creates a time from raw ticks.
    pub const fn from_ticks(ticks: i64) -> Time {
        Time { ticks }
    }

    /// The raw tick count.
    pub const fn ticks(self) -> i64 {
        self.ticks
    }

    /// The current wall-clock instant.
    pub fn now() -> Time {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Time { ticks: duration_to_ticks(since_epoch) }
    }

    /// True for the distinguished unbounded endpoints.
    pub const fn is_unbounded(self) -> bool {
        self.ticks == i64::MIN || self.ticks == i64::MAX
    }

    /// Elapsed span from `earlier` to `self`.
    pub fn since(self, earlier: Time) -> TimeSpan {
        self - earlier
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Time::MIN => f.write_str("-inf"),
            Time::MAX => f.write_str("+inf"),
            Time { ticks } => write!(f, "{ticks}hns"),
        }
    }
}

impl Add<TimeSpan> for Time {
    type Output = Time;
    fn add(self, span: TimeSpan) -> Time {
        if self.is_unbounded() {
            return self;
        }
        Time { ticks: self.ticks.saturating_add(span.ticks) }
    }
}

impl AddAssign<TimeSpan> for Time {
    fn add_assign(&mut self, span: TimeSpan) {
        *self = *self + span;
    }
}

impl Sub<TimeSpan> for Time {
    type Output = Time;
    fn sub(self, span: TimeSpan) -> Time {
        if self.is_unbounded() {
            return self;
        }
        Time { ticks: self.ticks.saturating_sub(span.ticks) }
    }
}

impl SubAssign<TimeSpan> for Time {
    fn sub_assign(&mut self, span: TimeSpan) {
        *self = *self - span;
    }
}

impl Sub<Time> for Time {
    type Output = TimeSpan;
    fn sub(self, other: Time) -> TimeSpan {
        TimeSpan { ticks: self.ticks.saturating_sub(other.ticks) }
    }
}

/// A signed difference between instants, in 100 ns ticks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeSpan {
    ticks: i64,
}

impl TimeSpan {
    /// The most negative span.
    pub const MIN: TimeSpan = TimeSpan { ticks: i64::MIN };
    /// The zero span.
    pub const ZERO: TimeSpan = TimeSpan { ticks: 0 };
    /// The most positive span; also the span of any unbounded interval.
    pub const MAX: TimeSpan = TimeSpan { ticks: i64::MAX };

    /// Creates a span from raw ticks.
    pub const fn from_ticks(ticks: i64) -> TimeSpan {
        TimeSpan { ticks }
    }

    /// Creates a span of whole seconds.
    pub const fn from_seconds(seconds: i64) -> TimeSpan {
        TimeSpan { ticks: seconds * TICKS_PER_SECOND }
    }

    /// Creates a span of whole milliseconds.
    pub const fn from_millis(millis: i64) -> TimeSpan {
        TimeSpan { ticks: millis * TICKS_PER_MILLISECOND }
    }

    /// Creates a span of whole microseconds.
    pub const fn from_micros(micros: i64) -> TimeSpan {
        TimeSpan { ticks: micros * TICKS_PER_MICROSECOND }
    }

    /// The raw tick count.
    pub const fn ticks(self) -> i64 {
        self.ticks
    }

    /// The magnitude of this span.
    pub const fn abs(self) -> TimeSpan {
        TimeSpan { ticks: self.ticks.saturating_abs() }
    }

    /// True if this span is negative.
    pub const fn is_negative(self) -> bool {
        self.ticks < 0
    }

    /// This span as a `Duration`, or `None` if negative.
    pub fn to_duration(self) -> Option<Duration> {
        if self.ticks < 0 {
            return None;
        }
        Some(Duration::from_nanos(self.ticks as u64 * 100))
    }
}

impl fmt::Display for TimeSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}hns", self.ticks)
    }
}

impl Add for TimeSpan {
    type Output = TimeSpan;
    fn add(self, other: TimeSpan) -> TimeSpan {
        TimeSpan { ticks: self.ticks.saturating_add(other.ticks) }
    }
}

impl Sub for TimeSpan {
    type Output = TimeSpan;
    fn sub(self, other: TimeSpan) -> TimeSpan {
        TimeSpan { ticks: self.ticks.saturating_sub(other.ticks) }
    }
}

impl Neg for TimeSpan {
    type Output = TimeSpan;
    fn neg(self) -> TimeSpan {
        TimeSpan { ticks: self.ticks.checked_neg().unwrap_or(i64::MAX) }
    }
}

/// Converts a non-negative duration to ticks, saturating.
pub fn duration_to_ticks(duration: Duration) -> i64 {
    (duration.as_nanos() / 100).min(i64::MAX as u128) as i64
}

/// Ticks elapsed on the process-wide monotonic counter.
///
/// The counter starts near zero at first use and never regresses; it is
/// the input side of [`TickCalibration`].
pub fn monotonic_ticks() -> i64 {
    use std::sync::OnceLock;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = *EPOCH.get_or_init(Instant::now);
    duration_to_ticks(epoch.elapsed())
}

/// The header fields of a message minus its payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Identity of the emitter (stream) that produced the message.
    pub source_id: u32,
    /// Per-source strictly monotonic counter.
    pub sequence_id: u64,
    /// Virtual time of the message at its true origin.
    pub originating_time: Time,
    /// Virtual time at which this emitter posted the message.
    pub creation_time: Time,
}

impl Envelope {
    /// Creates an envelope; `creation_time` must not precede
    /// `originating_time`.
    pub fn new(source_id: u32, sequence_id: u64, originating_time: Time, creation_time: Time) -> Envelope {
        debug_assert!(creation_time >= originating_time);
        Envelope { source_id, sequence_id, originating_time, creation_time }
    }

    /// Delivery latency accumulated so far.
    pub fn latency(&self) -> TimeSpan {
        self.creation_time - self.originating_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturating_arithmetic_at_extremes() {
        assert_eq!(Time::MAX + TimeSpan::from_seconds(1), Time::MAX);
        assert_eq!(Time::MIN - TimeSpan::from_seconds(1), Time::MIN);
        let t = Time::from_ticks(100);
        assert_eq!((t + TimeSpan::from_ticks(50)).ticks(), 150);
        assert_eq!((t - Time::from_ticks(30)).ticks(), 70);
    }

    #[test]
    fn span_conversions() {
        assert_eq!(TimeSpan::from_millis(1).ticks(), 10_000);
        assert_eq!(TimeSpan::from_seconds(1).ticks(), 10_000_000);
        assert_eq!(TimeSpan::from_millis(2).to_duration(), Some(Duration::from_millis(2)));
        assert_eq!(TimeSpan::from_ticks(-1).to_duration(), None);
    }

    #[test]
    fn monotonic_counter_never_regresses() {
        let a = monotonic_ticks();
        let b = monotonic_ticks();
        assert!(b >= a);
    }

    #[test]
    fn envelope_latency() {
        let envelope = Envelope::new(
            1,
            7,
            Time::from_ticks(1_000),
            Time::from_ticks(1_500),
        );
        assert_eq!(envelope.latency(), TimeSpan::from_ticks(500));
    }
}
