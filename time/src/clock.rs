//! The virtual clock of a running pipeline.

use std::time::Duration;

use crate::{Time, TimeSpan};

/// Maps absolute (wall) time onto the virtual time of a pipeline.
///
/// Live pipelines use the identity mapping. Replay pipelines shift the
/// origin back to the recorded interval and optionally scale elapsed real
/// time by a speed factor: `virtual = origin_virtual + (real −
/// origin_real) × speed`.
#[derive(Clone, Copy, Debug)]
pub struct Clock {
    origin_virtual: Time,
    origin_real: Time,
    speed: f64,
}

impl Clock {
    /// The identity clock: virtual time is wall time.
    pub fn real_time() -> Clock {
        let now = Time::now();
        Clock { origin_virtual: now, origin_real: now, speed: 1.0 }
    }

    /// A replay clock with virtual origin `origin_virtual`, starting now,
    /// advancing `speed` virtual ticks per real tick. `speed` must be
    /// positive.
    pub fn replay(origin_virtual: Time, speed: f64) -> Clock {
        assert!(speed > 0.0, "replay speed must be positive");
        Clock { origin_virtual, origin_real: Time::now(), speed }
    }

    /// A clock from explicit origins, for tests and restored pipelines.
    pub fn with_origins(origin_virtual: Time, origin_real: Time, speed: f64) -> Clock {
        assert!(speed > 0.0, "replay speed must be positive");
        Clock { origin_virtual, origin_real, speed }
    }

    /// The speed factor.
    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// The current virtual time.
    pub fn now(&self) -> Time {
        self.to_virtual(Time::now())
    }

    /// Converts an absolute instant to virtual time.
    pub fn to_virtual(&self, real: Time) -> Time {
        let elapsed = (real - self.origin_real).ticks();
        let scaled = if self.speed == 1.0 {
            elapsed
        } else {
            (elapsed as f64 * self.speed) as i64
        };
        self.origin_virtual + TimeSpan::from_ticks(scaled)
    }

    /// Converts a virtual instant to absolute time.
    pub fn to_real(&self, virtual_time: Time) -> Time {
        let elapsed = (virtual_time - self.origin_virtual).ticks();
        let scaled = if self.speed == 1.0 {
            elapsed
        } else {
            (elapsed as f64 / self.speed) as i64
        };
        self.origin_real + TimeSpan::from_ticks(scaled)
    }

    /// How long to wait, in real time, until the virtual clock reaches
    /// `virtual_time`; zero if it already has.
    pub fn real_delay_until(&self, virtual_time: Time) -> Duration {
        let target = self.to_real(virtual_time);
        (target - Time::now()).to_duration().unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_mapping_at_unit_speed() {
        let origin = Time::from_ticks(1_000_000);
        let clock = Clock::with_origins(origin, origin, 1.0);
        let real = Time::from_ticks(1_000_500);
        assert_eq!(clock.to_virtual(real), real);
        assert_eq!(clock.to_real(real), real);
    }

    #[test]
    fn replay_origin_shift() {
        let clock = Clock::with_origins(
            Time::from_ticks(0),
            Time::from_ticks(5_000),
            1.0,
        );
        assert_eq!(clock.to_virtual(Time::from_ticks(5_250)), Time::from_ticks(250));
        assert_eq!(clock.to_real(Time::from_ticks(250)), Time::from_ticks(5_250));
    }

    #[test]
    fn speed_scales_elapsed_real_time() {
        let clock = Clock::with_origins(
            Time::from_ticks(0),
            Time::from_ticks(0),
            2.0,
        );
        // Two virtual ticks per real tick.
        assert_eq!(clock.to_virtual(Time::from_ticks(100)), Time::from_ticks(200));
        assert_eq!(clock.to_real(Time::from_ticks(200)), Time::from_ticks(100));
    }

    #[test]
    #[should_panic(expected = "positive")]
    fn non_positive_speed_rejected() {
        let _ = Clock::replay(Time::from_ticks(0), 0.0);
    }
}
