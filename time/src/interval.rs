//! Absolute and relative time intervals with endpoint openness.

use serde::{Deserialize, Serialize};

use crate::{Time, TimeSpan};

/// One end of an interval: a point, whether the interval is bounded on
/// this side, and whether the point itself is included.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalEndpoint {
    /// The endpoint instant; `Time::MIN`/`Time::MAX` when unbounded.
    pub point: Time,
    /// False if the interval extends without limit on this side.
    pub bounded: bool,
    /// True if the point itself belongs to the interval.
    pub inclusive: bool,
}

impl IntervalEndpoint {
    /// A bounded endpoint that includes its point.
    pub const fn inclusive(point: Time) -> Self {
        IntervalEndpoint { point, bounded: true, inclusive: true }
    }

    /// A bounded endpoint that excludes its point.
    pub const fn exclusive(point: Time) -> Self {
        IntervalEndpoint { point, bounded: true, inclusive: false }
    }

    /// The unbounded left endpoint.
    pub const fn unbounded_left() -> Self {
        IntervalEndpoint { point: Time::MIN, bounded: false, inclusive: false }
    }

    /// The unbounded right endpoint.
    pub const fn unbounded_right() -> Self {
        IntervalEndpoint { point: Time::MAX, bounded: false, inclusive: false }
    }
}

/// An ordered pair of endpoints over absolute time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeInterval {
    left: IntervalEndpoint,
    right: IntervalEndpoint,
    empty: bool,
}

impl TimeInterval {
    /// The distinguished empty interval, containing no instants.
    pub const EMPTY: TimeInterval = TimeInterval {
        left: IntervalEndpoint::inclusive(Time::MAX),
        right: IntervalEndpoint::inclusive(Time::MIN),
        empty: true,
    };

    /// The interval covering all of time.
    pub const fn infinite() -> TimeInterval {
        TimeInterval {
            left: IntervalEndpoint::unbounded_left(),
            right: IntervalEndpoint::unbounded_right(),
            empty: false,
        }
    }

    /// An interval from explicit endpoints.
    pub const fn new(left: IntervalEndpoint, right: IntervalEndpoint) -> TimeInterval {
        TimeInterval { left, right, empty: false }
    }

    /// The closed interval `[left, right]`.
    pub const fn closed(left: Time, right: Time) -> TimeInterval {
        TimeInterval::new(IntervalEndpoint::inclusive(left), IntervalEndpoint::inclusive(right))
    }

    /// The left-closed, right-open interval `[left, right)`.
    pub const fn half_open(left: Time, right: Time) -> TimeInterval {
        TimeInterval::new(IntervalEndpoint::inclusive(left), IntervalEndpoint::exclusive(right))
    }

    /// The left endpoint.
    pub fn left(&self) -> IntervalEndpoint {
        self.left
    }

    /// The right endpoint.
    pub fn right(&self) -> IntervalEndpoint {
        self.right
    }

    /// True only for [`TimeInterval::EMPTY`].
    pub fn is_empty(&self) -> bool {
        self.empty
    }

    /// True iff the right endpoint precedes the left.
    pub fn is_negative(&self) -> bool {
        !self.empty && self.right.point < self.left.point
    }

    /// The covered span; `TimeSpan::MAX` when either side is unbounded,
    /// zero when empty.
    pub fn span(&self) -> TimeSpan {
        if self.empty {
            return TimeSpan::ZERO;
        }
        if !self.left.bounded || !self.right.bounded {
            return TimeSpan::MAX;
        }
        self.right.point - self.left.point
    }

    /// Whether `time` lies inside the interval.
    pub fn contains(&self, time: Time) -> bool {
        if self.empty {
            return false;
        }
        let after_left = if !self.left.bounded {
            true
        } else if self.left.inclusive {
            time >= self.left.point
        } else {
            time > self.left.point
        };
        let before_right = if !self.right.bounded {
            true
        } else if self.right.inclusive {
            time <= self.right.point
        } else {
            time < self.right.point
        };
        after_left && before_right
    }
}

/// An interval of offsets around an origin instant, used to describe
/// interpolator windows (e.g. "up to 5 ms either side").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelativeTimeInterval {
    /// Left offset; ignored when `left_bounded` is false.
    pub left: TimeSpan,
    /// False if the window extends into the unbounded past.
    pub left_bounded: bool,
    /// Whether the left offset itself is included.
    pub left_inclusive: bool,
    /// Right offset; ignored when `right_bounded` is false.
    pub right: TimeSpan,
    /// False if the window extends into the unbounded future.
    pub right_bounded: bool,
    /// Whether the right offset itself is included.
    pub right_inclusive: bool,
}

impl RelativeTimeInterval {
    /// The window covering all offsets.
    pub const fn infinite() -> Self {
        RelativeTimeInterval {
            left: TimeSpan::MIN,
            left_bounded: false,
            left_inclusive: false,
            right: TimeSpan::MAX,
            right_bounded: false,
            right_inclusive: false,
        }
    }

    /// The window `(-inf, 0]`: everything at or before the origin.
    pub const fn past() -> Self {
        RelativeTimeInterval {
            left: TimeSpan::MIN,
            left_bounded: false,
            left_inclusive: false,
            right: TimeSpan::ZERO,
            right_bounded: true,
            right_inclusive: true,
        }
    }

    /// The window `[0, +inf)`: everything at or after the origin.
    pub const fn future() -> Self {
        RelativeTimeInterval {
            left: TimeSpan::ZERO,
            left_bounded: true,
            left_inclusive: true,
            right: TimeSpan::MAX,
            right_bounded: false,
            right_inclusive: false,
        }
    }

    /// The closed window `[left, right]`.
    pub const fn closed(left: TimeSpan, right: TimeSpan) -> Self {
        RelativeTimeInterval {
            left,
            left_bounded: true,
            left_inclusive: true,
            right,
            right_bounded: true,
            right_inclusive: true,
        }
    }

    /// The zero-width window `[0, 0]`: exact matches only.
    pub const fn zero() -> Self {
        Self::closed(TimeSpan::ZERO, TimeSpan::ZERO)
    }

    /// The symmetric closed window `[-tolerance, tolerance]`.
    pub const fn within(tolerance: TimeSpan) -> Self {
        Self::closed(TimeSpan::from_ticks(-tolerance.ticks()), tolerance)
    }

    /// Anchors the window at `origin`, producing an absolute interval.
    pub fn at(&self, origin: Time) -> TimeInterval {
        let left = if self.left_bounded {
            IntervalEndpoint { point: origin + self.left, bounded: true, inclusive: self.left_inclusive }
        } else {
            IntervalEndpoint::unbounded_left()
        };
        let right = if self.right_bounded {
            IntervalEndpoint { point: origin + self.right, bounded: true, inclusive: self.right_inclusive }
        } else {
            IntervalEndpoint::unbounded_right()
        };
        TimeInterval::new(left, right)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_interval_is_distinguished() {
        assert!(TimeInterval::EMPTY.is_empty());
        assert!(!TimeInterval::EMPTY.contains(Time::from_ticks(0)));
        assert_eq!(TimeInterval::EMPTY.span(), TimeSpan::ZERO);
        assert!(!TimeInterval::EMPTY.is_negative());
    }

    #[test]
    fn unbounded_span_is_max() {
        assert_eq!(TimeInterval::infinite().span(), TimeSpan::MAX);
        let half = TimeInterval::new(
            IntervalEndpoint::inclusive(Time::from_ticks(10)),
            IntervalEndpoint::unbounded_right(),
        );
        assert_eq!(half.span(), TimeSpan::MAX);
    }

    #[test]
    fn negative_iff_right_precedes_left() {
        let backwards = TimeInterval::closed(Time::from_ticks(10), Time::from_ticks(5));
        assert!(backwards.is_negative());
        assert!(!TimeInterval::closed(Time::from_ticks(5), Time::from_ticks(10)).is_negative());
    }

    #[test]
    fn endpoint_openness_respected() {
        let interval = TimeInterval::half_open(Time::from_ticks(10), Time::from_ticks(20));
        assert!(interval.contains(Time::from_ticks(10)));
        assert!(interval.contains(Time::from_ticks(19)));
        assert!(!interval.contains(Time::from_ticks(20)));
    }

    #[test]
    fn relative_window_anchors() {
        let window = RelativeTimeInterval::within(TimeSpan::from_millis(5));
        let anchored = window.at(Time::from_ticks(100_000));
        assert!(anchored.contains(Time::from_ticks(100_000 - 50_000)));
        assert!(anchored.contains(Time::from_ticks(100_000 + 50_000)));
        assert!(!anchored.contains(Time::from_ticks(100_000 + 50_001)));

        let past = RelativeTimeInterval::past().at(Time::from_ticks(1_000));
        assert!(past.contains(Time::from_ticks(1_000)));
        assert!(past.contains(Time::MIN + TimeSpan::from_ticks(1)));
        assert!(!past.contains(Time::from_ticks(1_001)));
    }
}
