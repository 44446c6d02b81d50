//! Piecewise-linear stage schedules.
//!
//! A schedule starts at `start` and moves linearly to each stage's `target`
//! over that stage's duration:
//!
//! ```text
//! t    = (elapsed - stage_offset) / stage_duration
//! v(t) = previous_target + (target - previous_target) * t
//! ```
//!
//! A zero-duration stage jumps to its target instantly, which allows spikes or
//! a non-zero plateau without a ramp.
//!
//! Arrival-rate executors do not sample `v` per tick. They use the exact
//! integral of the rate up to `elapsed` and start whatever is due compared to
//! what was already issued, so late ticks never lose or bias arrivals.
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A stage ramps to `target` over `duration`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(with = "crate::engine::iteration::duration_ms")]
    pub duration: Duration,
    pub target: f64,
}

impl Stage {
    pub fn new(duration: Duration, target: f64) -> Self {
        Self { duration, target }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Schedule {
    start: f64,
    stages: Vec<Stage>,
    time_unit: Duration,
}

impl Schedule {
    /// `time_unit` is the period the targets are expressed in (`10` per `1s`,
    /// `600` per `1m`). Concurrency schedules use one second.
    pub fn new(start: f64, stages: Vec<Stage>, time_unit: Duration) -> Self {
        Self {
            start,
            stages,
            time_unit,
        }
    }

    /// A flat schedule holding `value` for `duration`.
    pub fn constant(value: f64, duration: Duration, time_unit: Duration) -> Self {
        Self::new(value, vec![Stage::new(duration, value)], time_unit)
    }

    pub fn total_duration(&self) -> Duration {
        self.stages
            .iter()
            .fold(Duration::ZERO, |total, s| total.saturating_add(s.duration))
    }

    /// Interpolated target at `elapsed`, in the schedule's own units.
    ///
    /// Past the last stage this holds the final target; callers stop issuing
    /// work at [`Schedule::total_duration`].
    pub fn value_at(&self, elapsed: Duration) -> f64 {
        let elapsed = elapsed.as_secs_f64();
        let mut previous = self.start;
        let mut offset = 0.0;

        for stage in &self.stages {
            let duration = stage.duration.as_secs_f64();
            if duration == 0.0 {
                previous = stage.target;
                continue;
            }
            if elapsed < offset + duration {
                let t = (elapsed - offset) / duration;
                return previous + (stage.target - previous) * t;
            }
            offset += duration;
            previous = stage.target;
        }

        previous
    }

    /// Instantaneous arrival rate at `elapsed`, per second.
    pub fn rate_at(&self, elapsed: Duration) -> f64 {
        self.value_at(elapsed) / self.time_unit.as_secs_f64()
    }

    /// Number of arrivals the schedule calls for in `[0, elapsed]`.
    ///
    /// This is the integral of [`Schedule::rate_at`], clamped at the end of
    /// the last stage so nothing becomes due after the schedule is over.
    pub fn expected_arrivals(&self, elapsed: Duration) -> f64 {
        let elapsed = elapsed.as_secs_f64();
        let mut previous = self.start;
        let mut offset = 0.0;
        let mut total = 0.0;

        for stage in &self.stages {
            let duration = stage.duration.as_secs_f64();
            if duration == 0.0 {
                previous = stage.target;
                continue;
            }
            let slope = (stage.target - previous) / duration;
            if elapsed < offset + duration {
                let tau = (elapsed - offset).max(0.0);
                total += previous * tau + slope * tau * tau / 2.0;
                return total / self.time_unit.as_secs_f64();
            }
            total += (previous + stage.target) / 2.0 * duration;
            offset += duration;
            previous = stage.target;
        }

        total / self.time_unit.as_secs_f64()
    }
}
