//! Time-aligned value selection over buffered stream windows.
//!
//! An [`Interpolator`] is a pure decision: given a query time, an
//! ordered window of buffered messages, and (if known) the time at which
//! the stream closed, produce a value, declare that none will ever
//! exist, or ask the caller to wait for more data.
//!
//! Two fidelities exist. `Available` answers from best current
//! knowledge and never waits, so results can differ between live runs.
//! `Reproducible` waits whenever a better candidate could still arrive
//! (the window's right edge reaches past the known data and the stream
//! is not closed), which makes fusion deterministic across replays
//! regardless of arrival order.

use std::collections::VecDeque;

use tempo_time::{RelativeTimeInterval, Time, TimeSpan};

use crate::error::Error;
use crate::message::Message;

/// Outcome of one interpolation query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InterpolationResult<T> {
    /// A value was produced; messages at or before `obsolete_time` are no
    /// longer needed for later (non-decreasing) queries.
    Created {
        /// The selected or synthesized value.
        value: T,
        /// Greatest buffered time that may now be pruned.
        obsolete_time: Time,
    },
    /// No value exists for this query, and none ever will.
    DoesNotExist {
        /// Greatest buffered time that may now be pruned.
        obsolete_time: Time,
    },
    /// A better answer may still arrive; buffer the query.
    InsufficientData,
}

/// Whether an interpolator may answer from partial knowledge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fidelity {
    /// Best knowledge now; never waits, not replay-deterministic.
    Available,
    /// Waits until the answer cannot change; replay-deterministic.
    Reproducible,
}

/// Values that can be linearly interpolated between two anchors.
pub trait Lerp: Clone {
    /// The value at `ratio` of the way from `a` to `b`.
    fn lerp(a: &Self, b: &Self, ratio: f64) -> Self;
}

impl Lerp for f64 {
    fn lerp(a: &Self, b: &Self, ratio: f64) -> Self {
        a + (b - a) * ratio
    }
}

impl Lerp for f32 {
    fn lerp(a: &Self, b: &Self, ratio: f64) -> Self {
        a + (b - a) * ratio as f32
    }
}

/// What to do when a query definitively has no value.
#[derive(Clone, Debug)]
pub enum OnMissing<S> {
    /// Report [`InterpolationResult::DoesNotExist`].
    Fail,
    /// Substitute this value instead.
    Default(S),
}

enum Method<S> {
    Nearest,
    First,
    Last,
    Linear(fn(&S, &S, f64) -> S),
}

impl<S> Clone for Method<S> {
    fn clone(&self) -> Self {
        match self {
            Method::Nearest => Method::Nearest,
            Method::First => Method::First,
            Method::Last => Method::Last,
            Method::Linear(lerp) => Method::Linear(*lerp),
        }
    }
}

/// A windowed, fidelity-tagged value selector over one stream.
pub struct Interpolator<S: Clone> {
    window: RelativeTimeInterval,
    fidelity: Fidelity,
    method: Method<S>,
    on_missing: OnMissing<S>,
}

impl<S: Clone> Clone for Interpolator<S> {
    fn clone(&self) -> Self {
        Interpolator {
            window: self.window,
            fidelity: self.fidelity,
            method: self.method.clone(),
            on_missing: self.on_missing.clone(),
        }
    }
}

impl<S: Clone> Interpolator<S> {
    /// Reproducible exact match: the message at precisely the query time.
    pub fn reproducible_exact() -> Interpolator<S> {
        Interpolator {
            window: RelativeTimeInterval::zero(),
            fidelity: Fidelity::Reproducible,
            method: Method::Nearest,
            on_missing: OnMissing::Fail,
        }
    }

    /// Reproducible nearest message within `window`; ties between
    /// equidistant neighbors go to the later message.
    pub fn reproducible_nearest(window: RelativeTimeInterval) -> Interpolator<S> {
        Interpolator {
            window,
            fidelity: Fidelity::Reproducible,
            method: Method::Nearest,
            on_missing: OnMissing::Fail,
        }
    }

    /// Reproducible earliest message within `window`, which must be
    /// left-bounded.
    pub fn reproducible_first(window: RelativeTimeInterval) -> Result<Interpolator<S>, Error> {
        ensure_left_bounded(&window)?;
        Ok(Interpolator {
            window,
            fidelity: Fidelity::Reproducible,
            method: Method::First,
            on_missing: OnMissing::Fail,
        })
    }

    /// Reproducible latest message within `window`.
    pub fn reproducible_last(window: RelativeTimeInterval) -> Interpolator<S> {
        Interpolator {
            window,
            fidelity: Fidelity::Reproducible,
            method: Method::Last,
            on_missing: OnMissing::Fail,
        }
    }

    /// Available nearest message within `window`: best knowledge now.
    pub fn available_nearest(window: RelativeTimeInterval) -> Interpolator<S> {
        Interpolator {
            window,
            fidelity: Fidelity::Available,
            method: Method::Nearest,
            on_missing: OnMissing::Fail,
        }
    }

    /// Available earliest message within `window`, which must be
    /// left-bounded.
    pub fn available_first(window: RelativeTimeInterval) -> Result<Interpolator<S>, Error> {
        ensure_left_bounded(&window)?;
        Ok(Interpolator {
            window,
            fidelity: Fidelity::Available,
            method: Method::First,
            on_missing: OnMissing::Fail,
        })
    }

    /// Available latest message over an unbounded window: the most
    /// recent value known at query time.
    pub fn available_last() -> Interpolator<S> {
        Interpolator {
            window: RelativeTimeInterval::infinite(),
            fidelity: Fidelity::Available,
            method: Method::Last,
            on_missing: OnMissing::Fail,
        }
    }

    /// Substitutes `value` wherever the query would otherwise
    /// definitively not exist.
    pub fn or_default(mut self, value: S) -> Interpolator<S> {
        self.on_missing = OnMissing::Default(value);
        self
    }

    /// The relative window.
    pub fn window(&self) -> RelativeTimeInterval {
        self.window
    }

    /// The fidelity family.
    pub fn fidelity(&self) -> Fidelity {
        self.fidelity
    }

    /// Answers the query at `time` over `buffer` (ordered by originating
    /// time). `closed_at` is the stream's closing time once known.
    pub fn interpolate(
        &self,
        time: Time,
        buffer: &VecDeque<Message<S>>,
        closed_at: Option<Time>,
    ) -> InterpolationResult<S> {
        let window = self.window.at(time);
        let horizon = buffer.back().map(|message| message.originating_time());

        // No message beyond the window's right edge will change the
        // candidate set once the horizon has passed it (per-stream
        // originating times are non-decreasing), or once the stream is
        // closed.
        let right = window.right();
        let window_settled = closed_at.is_some()
            || match horizon {
                Some(horizon) if right.bounded => {
                    horizon > right.point || (horizon == right.point && !right.inclusive)
                }
                _ => false,
            };

        let result = match &self.method {
            Method::Nearest => {
                let mut best: Option<&Message<S>> = None;
                for message in buffer {
                    if !window.contains(message.originating_time()) {
                        continue;
                    }
                    best = match best {
                        None => Some(message),
                        Some(current) => {
                            let current_distance =
                                (current.originating_time() - time).abs();
                            let distance = (message.originating_time() - time).abs();
                            // Ties go to the later message; the buffer is
                            // ordered, so `message` is the later one.
                            if distance <= current_distance {
                                Some(message)
                            } else {
                                Some(current)
                            }
                        }
                    };
                }
                match (self.fidelity, best) {
                    (Fidelity::Available, Some(anchor)) => self.created(anchor, buffer),
                    (Fidelity::Available, None) => self.missing(&window),
                    (Fidelity::Reproducible, Some(anchor))
                        if anchor.originating_time() >= time =>
                    {
                        // Any later arrival is farther from the query.
                        self.created(anchor, buffer)
                    }
                    (Fidelity::Reproducible, Some(anchor)) if window_settled => {
                        self.created(anchor, buffer)
                    }
                    (Fidelity::Reproducible, None) if window_settled => self.missing(&window),
                    (Fidelity::Reproducible, _) => InterpolationResult::InsufficientData,
                }
            }
            Method::First => {
                let first = buffer
                    .iter()
                    .find(|message| window.contains(message.originating_time()));
                match (self.fidelity, first) {
                    // Arrivals are time-ordered, so the first in-window
                    // message cannot be displaced by a later arrival.
                    (_, Some(anchor)) => self.created(anchor, buffer),
                    (Fidelity::Available, None) => self.missing(&window),
                    (Fidelity::Reproducible, None) if window_settled => self.missing(&window),
                    (Fidelity::Reproducible, None) => InterpolationResult::InsufficientData,
                }
            }
            Method::Last => {
                let last = buffer
                    .iter()
                    .rev()
                    .find(|message| window.contains(message.originating_time()));
                match (self.fidelity, last) {
                    (Fidelity::Available, Some(anchor)) => self.created(anchor, buffer),
                    (Fidelity::Available, None) => self.missing(&window),
                    (Fidelity::Reproducible, Some(anchor)) if window_settled => {
                        self.created(anchor, buffer)
                    }
                    (Fidelity::Reproducible, None) if window_settled => self.missing(&window),
                    (Fidelity::Reproducible, _) => InterpolationResult::InsufficientData,
                }
            }
            Method::Linear(lerp) => self.interpolate_linear(time, buffer, closed_at, *lerp),
        };

        match result {
            InterpolationResult::DoesNotExist { obsolete_time } => match &self.on_missing {
                OnMissing::Fail => InterpolationResult::DoesNotExist { obsolete_time },
                OnMissing::Default(value) => InterpolationResult::Created {
                    value: value.clone(),
                    obsolete_time,
                },
            },
            other => other,
        }
    }

    fn interpolate_linear(
        &self,
        time: Time,
        buffer: &VecDeque<Message<S>>,
        closed_at: Option<Time>,
        lerp: fn(&S, &S, f64) -> S,
    ) -> InterpolationResult<S> {
        let left = buffer
            .iter()
            .rev()
            .find(|message| message.originating_time() <= time);
        let right = buffer
            .iter()
            .find(|message| message.originating_time() >= time);
        match (left, right) {
            (Some(left), Some(right)) => {
                let span = (right.originating_time() - left.originating_time()).ticks();
                let value = if span == 0 {
                    left.data.clone()
                } else {
                    let ratio = (time - left.originating_time()).ticks() as f64 / span as f64;
                    lerp(&left.data, &right.data, ratio)
                };
                InterpolationResult::Created {
                    value,
                    obsolete_time: predecessor_of(buffer, left.originating_time()),
                }
            }
            (Some(left), None) => {
                if closed_at.is_some() {
                    InterpolationResult::DoesNotExist {
                        obsolete_time: predecessor_of(buffer, left.originating_time()),
                    }
                } else {
                    InterpolationResult::InsufficientData
                }
            }
            (None, Some(_)) => InterpolationResult::DoesNotExist { obsolete_time: Time::MIN },
            (None, None) => {
                if closed_at.is_some() {
                    InterpolationResult::DoesNotExist { obsolete_time: Time::MIN }
                } else {
                    InterpolationResult::InsufficientData
                }
            }
        }
    }

    fn created(
        &self,
        anchor: &Message<S>,
        buffer: &VecDeque<Message<S>>,
    ) -> InterpolationResult<S> {
        InterpolationResult::Created {
            value: anchor.data.clone(),
            obsolete_time: predecessor_of(buffer, anchor.originating_time()),
        }
    }

    fn missing(&self, window: &tempo_time::TimeInterval) -> InterpolationResult<S> {
        let left = window.left();
        let obsolete_time = if left.bounded {
            left.point - TimeSpan::from_ticks(1)
        } else {
            Time::MIN
        };
        InterpolationResult::DoesNotExist { obsolete_time }
    }
}

impl<S: Lerp> Interpolator<S> {
    /// Reproducible linear interpolation between the anchors straddling
    /// the query time; waits until the right anchor is known.
    pub fn reproducible_linear() -> Interpolator<S> {
        Interpolator {
            window: RelativeTimeInterval::infinite(),
            fidelity: Fidelity::Reproducible,
            method: Method::Linear(|a, b, ratio| S::lerp(a, b, ratio)),
            on_missing: OnMissing::Fail,
        }
    }
}

fn ensure_left_bounded(window: &RelativeTimeInterval) -> Result<(), Error> {
    if !window.left_bounded {
        return Err(Error::InvalidArgument(String::from(
            "a First interpolator requires a left-bounded window",
        )));
    }
    Ok(())
}

/// Greatest buffered time strictly before `anchor`, `Time::MIN` if none.
fn predecessor_of<S>(buffer: &VecDeque<Message<S>>, anchor: Time) -> Time {
    buffer
        .iter()
        .rev()
        .map(|message| message.originating_time())
        .find(|&time| time < anchor)
        .unwrap_or(Time::MIN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempo_time::Envelope;

    fn buffer(entries: &[(i64, i64)]) -> VecDeque<Message<i64>> {
        entries
            .iter()
            .enumerate()
            .map(|(index, &(ticks, value))| {
                let time = Time::from_ticks(ticks);
                Message::new(value, Envelope::new(0, index as u64, time, time))
            })
            .collect()
    }

    fn at(ticks: i64) -> Time {
        Time::from_ticks(ticks)
    }

    #[test]
    fn nearest_prefers_the_later_of_equidistant_neighbors() {
        let interpolator = Interpolator::<i64>::reproducible_nearest(RelativeTimeInterval::infinite());
        let buffer = buffer(&[(10, 1), (20, 2), (30, 3)]);
        // 25 is equidistant from 20 and 30.
        match interpolator.interpolate(at(25), &buffer, None) {
            InterpolationResult::Created { value, .. } => assert_eq!(value, 3),
            other => panic!("expected Created, got {other:?}"),
        }
    }

    #[test]
    fn nearest_past_anchor_resolves_without_close() {
        let interpolator = Interpolator::<i64>::reproducible_nearest(RelativeTimeInterval::infinite());
        let buffer = buffer(&[(10, 1), (20, 2), (30, 3)]);
        // The nearest message (30) is at or after the query; later
        // arrivals can only be farther.
        assert_eq!(
            interpolator.interpolate(at(26), &buffer, None),
            InterpolationResult::Created { value: 3, obsolete_time: at(20) }
        );
        // Known close changes nothing.
        match interpolator.interpolate(at(26), &buffer, Some(at(40))) {
            InterpolationResult::Created { value: 3, .. } => {}
            other => panic!("expected Created(3), got {other:?}"),
        }
    }

    #[test]
    fn nearest_waits_when_a_closer_future_message_is_possible() {
        let interpolator = Interpolator::<i64>::reproducible_nearest(RelativeTimeInterval::infinite());
        let buffer = buffer(&[(10, 1), (20, 2), (30, 3)]);
        // Best candidate (30) precedes the query; a message at 33 would
        // be nearer than 30 is.
        assert_eq!(
            interpolator.interpolate(at(35), &buffer, None),
            InterpolationResult::InsufficientData
        );
        // Once closed, the candidate stands.
        match interpolator.interpolate(at(35), &buffer, Some(at(31))) {
            InterpolationResult::Created { value: 3, .. } => {}
            other => panic!("expected Created(3), got {other:?}"),
        }
    }

    #[test]
    fn first_with_past_window_reports_does_not_exist_at_min() {
        let window = RelativeTimeInterval::closed(TimeSpan::MIN, TimeSpan::ZERO);
        let interpolator = Interpolator::<i64>::reproducible_first(window).unwrap();
        let buffer = buffer(&[(10, 1), (20, 2), (30, 3)]);
        // Nothing at or before 9, and the horizon (30) proves nothing
        // more will arrive there.
        assert_eq!(
            interpolator.interpolate(at(9), &buffer, None),
            InterpolationResult::DoesNotExist { obsolete_time: Time::MIN }
        );
    }

    #[test]
    fn first_requires_a_left_bounded_window() {
        let result = Interpolator::<i64>::reproducible_first(RelativeTimeInterval::past());
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        let result = Interpolator::<i64>::available_first(RelativeTimeInterval::infinite());
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn exact_match_only_within_zero_window() {
        let interpolator = Interpolator::<i64>::reproducible_exact();
        let buffer = buffer(&[(10, 1), (20, 2)]);
        match interpolator.interpolate(at(20), &buffer, None) {
            InterpolationResult::Created { value, .. } => assert_eq!(value, 2),
            other => panic!("expected Created, got {other:?}"),
        }
        // 15 has no exact match; the horizon has passed the window.
        assert_eq!(
            interpolator.interpolate(at(15), &buffer, None),
            InterpolationResult::DoesNotExist { obsolete_time: at(14) }
        );
        // Exactly at the horizon the window is not yet settled: another
        // message at 20 could still arrive and win the tie.
        assert_eq!(
            interpolator.interpolate(at(21), &buffer, None),
            InterpolationResult::InsufficientData
        );
    }

    #[test]
    fn available_last_answers_from_partial_knowledge() {
        let interpolator = Interpolator::<i64>::available_last();
        let empty = VecDeque::new();
        assert_eq!(
            interpolator.interpolate(at(5), &empty, None),
            InterpolationResult::DoesNotExist { obsolete_time: Time::MIN }
        );
        let buffer = buffer(&[(10, 1), (20, 2)]);
        match interpolator.interpolate(at(5), &buffer, None) {
            // Unbounded window: the latest known message wins even
            // though it is later than the query.
            InterpolationResult::Created { value, .. } => assert_eq!(value, 2),
            other => panic!("expected Created, got {other:?}"),
        }
    }

    #[test]
    fn reproducible_last_waits_for_the_window_to_settle() {
        let window = RelativeTimeInterval::closed(TimeSpan::from_ticks(-5), TimeSpan::from_ticks(5));
        let interpolator = Interpolator::<i64>::reproducible_last(window);
        let partial = buffer(&[(10, 1), (12, 2)]);
        // Window [5, 15]: horizon 12 has not passed 15 yet.
        assert_eq!(
            interpolator.interpolate(at(10), &partial, None),
            InterpolationResult::InsufficientData
        );
        let more = buffer(&[(10, 1), (12, 2), (16, 9)]);
        match interpolator.interpolate(at(10), &more, None) {
            InterpolationResult::Created { value, .. } => assert_eq!(value, 2),
            other => panic!("expected Created, got {other:?}"),
        }
    }

    #[test]
    fn linear_interpolates_between_anchors() {
        let interpolator = Interpolator::<f64>::reproducible_linear();
        let entries: VecDeque<Message<f64>> = [(10i64, 1.0f64), (20, 3.0)]
            .iter()
            .enumerate()
            .map(|(index, &(ticks, value))| {
                let time = Time::from_ticks(ticks);
                Message::new(value, Envelope::new(0, index as u64, time, time))
            })
            .collect();
        match interpolator.interpolate(at(15), &entries, None) {
            InterpolationResult::Created { value, .. } => assert!((value - 2.0).abs() < 1e-9),
            other => panic!("expected Created, got {other:?}"),
        }
        // No right anchor yet: wait, unless closed.
        assert_eq!(
            interpolator.interpolate(at(25), &entries, None),
            InterpolationResult::InsufficientData
        );
        assert!(matches!(
            interpolator.interpolate(at(25), &entries, Some(at(21))),
            InterpolationResult::DoesNotExist { .. }
        ));
    }

    #[test]
    fn or_default_substitutes_for_missing_values() {
        let window = RelativeTimeInterval::closed(TimeSpan::from_ticks(0), TimeSpan::from_ticks(0));
        let interpolator =
            Interpolator::<i64>::reproducible_nearest(window).or_default(-1);
        let buffer = buffer(&[(10, 1)]);
        match interpolator.interpolate(at(5), &buffer, None) {
            InterpolationResult::Created { value, .. } => assert_eq!(value, -1),
            other => panic!("expected default, got {other:?}"),
        }
    }
}
