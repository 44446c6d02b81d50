use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{oneshot, watch, Semaphore};
use tokio::time::Instant;
use uuid::Uuid;

use crate::engine::executor::ExecutorSpec;
use crate::engine::metrics::{spawn_aggregator, MetricsRegistry};
use crate::engine::monitor::{Checkpoint, Monitor};
use crate::engine::scheduler::{run_executor, ExecutorContext};
use crate::engine::state::{RunClock, RunControl, RunPhase, RunState};
use crate::engine::threshold::{evaluate_all, ThresholdSpec};
use crate::error::ConfigError;
use crate::report::{ExecutorSummary, RunReport};

pub const DEFAULT_TICK: Duration = Duration::from_millis(50);
pub const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_WORKERS: usize = 10_000;

/// Run-wide knobs.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub name: String,
    /// Cancels everything still in flight once reached, graceful stop or not.
    pub hard_timeout: Option<Duration>,
    /// Process-wide ceiling on allocated workers across all executors.
    pub max_workers: usize,
    /// Scheduler resolution for arrival-rate and ramping executors.
    pub tick: Duration,
    pub checkpoint_interval: Duration,
    pub retain_records: bool,
    /// Records folded into the registry per write lock.
    pub aggregator_batch: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            name: "volley".to_string(),
            hard_timeout: None,
            max_workers: DEFAULT_MAX_WORKERS,
            tick: DEFAULT_TICK,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            retain_records: false,
            aggregator_batch: 256,
        }
    }
}

impl EngineOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |option: &str, reason: &str| {
            Err(ConfigError::InvalidOption {
                option: option.to_string(),
                reason: reason.to_string(),
            })
        };
        if self.tick.is_zero() {
            return invalid("tick", "must be greater than zero");
        }
        if self.checkpoint_interval.is_zero() {
            return invalid("checkpoint_interval", "must be greater than zero");
        }
        if self.max_workers == 0 {
            return invalid("max_workers", "must be at least 1");
        }
        if self.hard_timeout.is_some_and(|t| t.is_zero()) {
            return invalid("hard_timeout", "must be greater than zero");
        }
        Ok(())
    }
}

/// Orchestrates one run: executors, worker pools, aggregator and thresholds.
///
/// ```rust,no_run
/// # use std::time::Duration;
/// # use volley::engine::{iteration_fn, Engine, EngineOptions, ExecutorSpec, ThresholdSpec};
/// # async fn demo() -> Result<(), volley::ConfigError> {
/// let browse = iteration_fn(|| async { Ok(vec![]) });
/// let report = Engine::new(EngineOptions::default())
///     .executor(ExecutorSpec::fixed_concurrency("browse", 20, Duration::from_secs(30), browse))
///     .threshold(ThresholdSpec::new("iteration_failed", "rate<0.01")?)
///     .run()
///     .await?;
/// println!("{}", report.status);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Engine {
    options: EngineOptions,
    executors: Vec<ExecutorSpec>,
    thresholds: Vec<ThresholdSpec>,
    state: Arc<watch::Sender<RunState>>,
    checkpoints: Arc<watch::Sender<Checkpoint>>,
    control: Arc<RunControl>,
}

impl Engine {
    pub fn new(options: EngineOptions) -> Self {
        Self {
            options,
            executors: Vec::new(),
            thresholds: Vec::new(),
            state: Arc::new(watch::channel(RunState::default()).0),
            checkpoints: Arc::new(watch::channel(Checkpoint::default()).0),
            control: Arc::new(RunControl::new()),
        }
    }

    pub fn executor(mut self, spec: ExecutorSpec) -> Self {
        self.executors.push(spec);
        self
    }

    pub fn threshold(mut self, spec: ThresholdSpec) -> Self {
        self.thresholds.push(spec);
        self
    }

    /// Keep every raw record and return them in the report.
    pub fn retain_records(mut self, retain: bool) -> Self {
        self.options.retain_records = retain;
        self
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn executors(&self) -> &[ExecutorSpec] {
        &self.executors
    }

    pub fn thresholds(&self) -> &[ThresholdSpec] {
        &self.thresholds
    }

    /// Checkpoints published every `checkpoint_interval` while running.
    pub fn subscribe(&self) -> watch::Receiver<Checkpoint> {
        self.checkpoints.subscribe()
    }

    pub fn state(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    /// Handle for stopping the run from outside, e.g. on Ctrl-C.
    pub fn control(&self) -> Arc<RunControl> {
        Arc::clone(&self.control)
    }

    /// Total span of the schedule: the latest executor end offset.
    pub fn planned_duration(&self) -> Duration {
        self.executors
            .iter()
            .map(ExecutorSpec::end_offset)
            .max()
            .unwrap_or_default()
    }

    /// Everything that can be rejected before the run starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.options.validate()?;
        if self.executors.is_empty() {
            return Err(ConfigError::NoExecutors);
        }

        let mut seen = HashSet::new();
        for spec in &self.executors {
            spec.validate()?;
            let horizon = spec.end_offset().saturating_add(spec.graceful_stop);
            if Instant::now().checked_add(horizon).is_none() {
                return Err(ConfigError::executor(
                    &spec.name,
                    "start_time + duration + graceful_stop overflows the clock",
                ));
            }
            if !seen.insert(Arc::clone(&spec.name)) {
                return Err(ConfigError::DuplicateExecutor(spec.name.to_string()));
            }
        }

        for threshold in &self.thresholds {
            threshold.validate()?;
        }
        Ok(())
    }

    pub async fn run(self) -> Result<RunReport, ConfigError> {
        self.validate()?;

        let Engine {
            options,
            executors,
            thresholds,
            state,
            checkpoints,
            control,
        } = self;

        let registry = MetricsRegistry::shared(options.retain_records);
        {
            let mut guard = registry.write();
            for spec in &executors {
                guard.register_executor(Arc::clone(&spec.name));
            }
        }
        let (sink, aggregator) = spawn_aggregator(Arc::clone(&registry), options.aggregator_batch);

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = RunClock::start();
        state.send_modify(|s| {
            s.started = Some(clock.started());
            s.active_executors = executors.len();
            s.advance(RunPhase::Running);
        });
        tracing::info!(
            %run_id,
            name = %options.name,
            executors = executors.len(),
            thresholds = thresholds.len(),
            "Run started"
        );

        let thresholds: Arc<[ThresholdSpec]> = thresholds.into();
        let (done_tx, done_rx) = oneshot::channel();
        let monitor = tokio::spawn(
            Monitor {
                interval: options.checkpoint_interval,
                thresholds: Arc::clone(&thresholds),
                registry: Arc::clone(&registry),
                clock,
                state: Arc::clone(&state),
                checkpoints: Arc::clone(&checkpoints),
                control: Arc::clone(&control),
            }
            .run(done_rx),
        );

        let timeout = options.hard_timeout.map(|limit| {
            let control = Arc::clone(&control);
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                tracing::warn!(
                    limit = ?limit,
                    "Hard timeout reached, cancelling in-flight iterations"
                );
                control.cancel();
            })
        });

        let limiter = Arc::new(Semaphore::new(options.max_workers));
        let tasks = executors.into_iter().map(|spec| {
            let ctx = ExecutorContext {
                clock,
                tick: options.tick,
                limiter: Arc::clone(&limiter),
                sink: sink.clone(),
                state: Arc::clone(&state),
                stop: control.stop_signal(),
                cancel: control.cancel_signal(),
            };
            tokio::spawn(run_executor(spec, ctx))
        });
        let tasks: Vec<_> = tasks.collect();
        drop(sink);

        let mut executor_stats = Vec::with_capacity(tasks.len());
        for joined in join_all(tasks).await {
            match joined {
                Ok(stats) => executor_stats.push(stats),
                Err(err) => tracing::error!("Executor task failed: {err}"),
            }
        }

        // Every sink is gone now, so the aggregator ends once the queue is empty.
        if let Err(err) = aggregator.await {
            tracing::error!("Aggregator task failed: {err}");
        }

        let timed_out = match timeout {
            Some(handle) if handle.is_finished() => true,
            Some(handle) => {
                handle.abort();
                false
            }
            None => false,
        };

        let _ = done_tx.send(());
        let abort_cause = monitor.await.unwrap_or_else(|err| {
            tracing::error!("Monitor task failed: {err}");
            None
        });

        let duration = clock.elapsed();
        let (metrics, results, executors, records) = {
            let mut guard = registry.write();
            if guard.rejected_samples() > 0 {
                tracing::warn!(
                    rejected = guard.rejected_samples(),
                    "Samples ignored because their kind disagreed with the metric"
                );
            }
            let results = evaluate_all(&thresholds, &guard, duration);
            let executors = executor_stats
                .iter()
                .map(|stats| {
                    let tally = guard.executor(&stats.name).copied().unwrap_or_default();
                    ExecutorSummary::new(stats, tally)
                })
                .collect::<Vec<_>>();
            (guard.summaries(duration), results, executors, guard.take_records())
        };

        let aborted = state.borrow().aborted || (control.is_stopped() && !timed_out);
        let status = RunReport::status_for(&results, abort_cause.is_some());

        state.send_modify(|s| s.advance(RunPhase::Completed));
        checkpoints.send_modify(|c| {
            c.elapsed = duration;
            c.phase = Some(RunPhase::Completed);
            c.active_executors = 0;
            c.thresholds = results.clone();
        });

        tracing::info!(%run_id, %status, elapsed = ?duration, "Run finished");

        Ok(RunReport {
            run_id,
            name: options.name,
            started_at,
            duration,
            status,
            aborted,
            abort_cause,
            timed_out,
            metrics,
            executors,
            thresholds: results,
            records,
        })
    }
}
