use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tokio::time::MissedTickBehavior;

use crate::engine::iteration::duration_ms;
use crate::engine::metrics::{names, ExecutorTally, MetricStat, SharedRegistry};
use crate::engine::state::{RunClock, RunControl, RunPhase, RunState};
use crate::engine::threshold::{evaluate_all, ThresholdResult, ThresholdSpec};

/// Periodic snapshot of a running test.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
    pub phase: Option<RunPhase>,
    pub active_executors: usize,
    pub totals: ExecutorTally,
    /// Completed iterations per second over the whole run so far.
    pub iterations_per_sec: f64,
    pub p95_iteration_ms: Option<f64>,
    pub thresholds: Vec<ThresholdResult>,
}

/// Why a run was stopped early.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbortCause {
    pub metric: String,
    pub expression: String,
    #[serde(with = "duration_ms")]
    pub at: Duration,
}

impl std::fmt::Display for AbortCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "threshold '{}' on {} crossed at {:.1}s",
            self.expression,
            self.metric,
            self.at.as_secs_f64()
        )
    }
}

pub(crate) struct Monitor {
    pub interval: Duration,
    pub thresholds: Arc<[ThresholdSpec]>,
    pub registry: SharedRegistry,
    pub clock: RunClock,
    pub state: Arc<watch::Sender<RunState>>,
    pub checkpoints: Arc<watch::Sender<Checkpoint>>,
    pub control: Arc<RunControl>,
}

impl Monitor {
    pub(crate) fn snapshot(&self) -> Checkpoint {
        let elapsed = self.clock.elapsed();
        let state = self.state.borrow().clone();
        let registry = self.registry.read();

        let totals = registry.totals();
        let secs = elapsed.as_secs_f64();
        let iterations_per_sec = if secs > 0.0 {
            totals.completed as f64 / secs
        } else {
            0.0
        };
        let p95_iteration_ms = match registry.get(names::ITERATION_DURATION) {
            Some(MetricStat::Trend(trend)) => trend.percentile(95.0),
            _ => None,
        };

        Checkpoint {
            elapsed,
            phase: Some(state.phase),
            active_executors: state.active_executors,
            totals,
            iterations_per_sec,
            p95_iteration_ms,
            thresholds: evaluate_all(&self.thresholds, &registry, elapsed),
        }
    }

    fn abort_cause(&self, checkpoint: &Checkpoint) -> Option<AbortCause> {
        self.thresholds
            .iter()
            .zip(&checkpoint.thresholds)
            .find(|(spec, result)| {
                spec.abort_on_fail && result.failed() && checkpoint.elapsed >= spec.delay_abort_eval
            })
            .map(|(spec, _)| AbortCause {
                metric: spec.metric.clone(),
                expression: spec.expr.to_string(),
                at: checkpoint.elapsed,
            })
    }

    /// Publish checkpoints until `done` fires. Returns the abort cause if a
    /// threshold stopped the run.
    pub(crate) async fn run(self, mut done: oneshot::Receiver<()>) -> Option<AbortCause> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // first tick fires immediately

        let mut cause = None;
        loop {
            tokio::select! {
                _ = &mut done => break,
                _ = ticker.tick() => {}
            }

            let checkpoint = self.snapshot();
            tracing::debug!(
                elapsed = ?checkpoint.elapsed,
                completed = checkpoint.totals.completed,
                failed = checkpoint.totals.failed,
                dropped = checkpoint.totals.dropped,
                "Checkpoint"
            );

            if cause.is_none() && checkpoint.phase == Some(RunPhase::Running) {
                if let Some(found) = self.abort_cause(&checkpoint) {
                    tracing::warn!("Aborting run: {found}");
                    self.state.send_modify(|s| s.aborted = true);
                    self.control.stop();
                    cause = Some(found);
                }
            }

            self.checkpoints.send_replace(checkpoint);
        }

        cause
    }
}
