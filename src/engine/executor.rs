use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::iteration::Iteration;
use crate::engine::schedule::{Schedule, Stage};
use crate::error::ConfigError;

pub const DEFAULT_GRACEFUL_STOP: Duration = Duration::from_secs(30);

/// Timing model of an executor.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorKind {
    /// `vus` workers re-run the iteration back to back for `duration`.
    FixedConcurrency { vus: usize, duration: Duration },
    /// Worker count follows the stages, starting from `start_vus`.
    RampingConcurrency { start_vus: usize, stages: Vec<Stage> },
    /// `rate` iterations start every `time_unit`, whatever their latency.
    ConstantRate {
        rate: f64,
        time_unit: Duration,
        duration: Duration,
        pre_allocated_vus: usize,
        max_vus: usize,
    },
    /// Arrival rate follows the stages, starting from `start_rate`.
    RampingRate {
        start_rate: f64,
        time_unit: Duration,
        pre_allocated_vus: usize,
        max_vus: usize,
        stages: Vec<Stage>,
    },
}

impl ExecutorKind {
    pub fn label(&self) -> &'static str {
        match self {
            ExecutorKind::FixedConcurrency { .. } => "fixed-concurrency",
            ExecutorKind::RampingConcurrency { .. } => "ramping-concurrency",
            ExecutorKind::ConstantRate { .. } => "constant-rate",
            ExecutorKind::RampingRate { .. } => "ramping-rate",
        }
    }

    /// Open-loop kinds start iterations on a clock, closed-loop kinds whenever a
    /// worker frees up.
    pub fn is_open_loop(&self) -> bool {
        matches!(
            self,
            ExecutorKind::ConstantRate { .. } | ExecutorKind::RampingRate { .. }
        )
    }

    /// Length of the window in which new iterations may start.
    pub fn duration(&self) -> Duration {
        match self {
            ExecutorKind::FixedConcurrency { duration, .. }
            | ExecutorKind::ConstantRate { duration, .. } => *duration,
            ExecutorKind::RampingConcurrency { stages, .. }
            | ExecutorKind::RampingRate { stages, .. } => stages
                .iter()
                .fold(Duration::ZERO, |total, s| total.saturating_add(s.duration)),
        }
    }

    /// Ceiling on concurrently running workers.
    pub fn max_workers(&self) -> usize {
        match self {
            ExecutorKind::FixedConcurrency { vus, .. } => *vus,
            ExecutorKind::RampingConcurrency { start_vus, stages } => stages
                .iter()
                .map(|s| s.target.max(0.0).ceil() as usize)
                .fold(*start_vus, usize::max),
            ExecutorKind::ConstantRate { max_vus, .. }
            | ExecutorKind::RampingRate { max_vus, .. } => *max_vus,
        }
    }

    /// Workers allocated before the first iteration starts.
    pub fn initial_workers(&self) -> usize {
        match self {
            ExecutorKind::FixedConcurrency { vus, .. } => *vus,
            ExecutorKind::RampingConcurrency { start_vus, .. } => *start_vus,
            ExecutorKind::ConstantRate {
                pre_allocated_vus, ..
            }
            | ExecutorKind::RampingRate {
                pre_allocated_vus, ..
            } => *pre_allocated_vus,
        }
    }

    /// Target function driving the scheduler: arrivals per time unit for
    /// open-loop kinds, worker count for closed-loop kinds.
    pub fn schedule(&self) -> Schedule {
        let second = Duration::from_secs(1);
        match self {
            ExecutorKind::FixedConcurrency { vus, duration } => {
                Schedule::constant(*vus as f64, *duration, second)
            }
            ExecutorKind::RampingConcurrency { start_vus, stages } => {
                Schedule::new(*start_vus as f64, stages.clone(), second)
            }
            ExecutorKind::ConstantRate {
                rate,
                time_unit,
                duration,
                ..
            } => Schedule::constant(*rate, *duration, *time_unit),
            ExecutorKind::RampingRate {
                start_rate,
                time_unit,
                stages,
                ..
            } => Schedule::new(*start_rate, stages.clone(), *time_unit),
        }
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.duration().is_zero() {
            return Err(ConfigError::executor(name, "duration must be greater than zero"));
        }

        let stages: &[Stage] = match self {
            ExecutorKind::RampingConcurrency { stages, .. }
            | ExecutorKind::RampingRate { stages, .. } => stages.as_slice(),
            _ => &[],
        };
        for (i, stage) in stages.iter().enumerate() {
            if !stage.target.is_finite() || stage.target < 0.0 {
                return Err(ConfigError::executor(
                    name,
                    format!("stage {i} target must be a non-negative number"),
                ));
            }
        }

        match self {
            ExecutorKind::RampingConcurrency { stages, .. } if stages.is_empty() => {
                Err(ConfigError::executor(name, "at least one stage is required"))
            }
            ExecutorKind::RampingRate { stages, .. } if stages.is_empty() => {
                Err(ConfigError::executor(name, "at least one stage is required"))
            }
            ExecutorKind::ConstantRate {
                rate: start,
                time_unit,
                pre_allocated_vus,
                max_vus,
                ..
            }
            | ExecutorKind::RampingRate {
                start_rate: start,
                time_unit,
                pre_allocated_vus,
                max_vus,
                ..
            } => {
                if !start.is_finite() || *start < 0.0 {
                    return Err(ConfigError::executor(
                        name,
                        "rate must be a non-negative number",
                    ));
                }
                if time_unit.is_zero() {
                    return Err(ConfigError::executor(name, "time_unit must be greater than zero"));
                }
                if pre_allocated_vus > max_vus {
                    return Err(ConfigError::executor(
                        name,
                        format!(
                            "pre_allocated_vus ({pre_allocated_vus}) exceeds max_vus ({max_vus})"
                        ),
                    ));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// A named executor bound to its iteration logic.
#[derive(Clone)]
pub struct ExecutorSpec {
    pub name: Arc<str>,
    pub kind: ExecutorKind,
    pub iteration: Arc<dyn Iteration>,
    /// Delay between run start and this executor's first iteration.
    pub start_time: Duration,
    /// How long in-flight iterations may run after the executor's window ends
    /// before they are cancelled.
    pub graceful_stop: Duration,
}

impl fmt::Debug for ExecutorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorSpec")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("start_time", &self.start_time)
            .field("graceful_stop", &self.graceful_stop)
            .finish_non_exhaustive()
    }
}

impl ExecutorSpec {
    pub fn new(
        name: impl Into<Arc<str>>,
        kind: ExecutorKind,
        iteration: Arc<dyn Iteration>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            iteration,
            start_time: Duration::ZERO,
            graceful_stop: DEFAULT_GRACEFUL_STOP,
        }
    }

    pub fn fixed_concurrency(
        name: impl Into<Arc<str>>,
        vus: usize,
        duration: Duration,
        iteration: Arc<dyn Iteration>,
    ) -> Self {
        Self::new(name, ExecutorKind::FixedConcurrency { vus, duration }, iteration)
    }

    pub fn ramping_rate(
        name: impl Into<Arc<str>>,
        start_rate: f64,
        time_unit: Duration,
        pre_allocated_vus: usize,
        max_vus: usize,
        stages: Vec<Stage>,
        iteration: Arc<dyn Iteration>,
    ) -> Self {
        Self::new(
            name,
            ExecutorKind::RampingRate {
                start_rate,
                time_unit,
                pre_allocated_vus,
                max_vus,
                stages,
            },
            iteration,
        )
    }

    pub fn with_start_time(mut self, start_time: Duration) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn with_graceful_stop(mut self, graceful_stop: Duration) -> Self {
        self.graceful_stop = graceful_stop;
        self
    }

    /// Offset from run start at which this executor stops issuing iterations.
    pub fn end_offset(&self) -> Duration {
        self.start_time.saturating_add(self.kind.duration())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyExecutorName);
        }
        self.kind.validate(&self.name)
    }
}
