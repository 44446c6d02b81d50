//! Per-executor timing loops.
//!
//! Closed-loop executors keep `target` workers busy and re-dispatch a worker
//! as soon as its iteration ends. Open-loop executors start iterations on a
//! clock: every tick they compare the integral of the arrival rate with what
//! they already issued and submit the difference, whatever the latency of
//! earlier iterations.
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};

use crate::engine::executor::ExecutorSpec;
use crate::engine::metrics::RecordSink;
use crate::engine::pool::{PoolStats, WorkerPool};
use crate::engine::schedule::Schedule;
use crate::engine::state::{fired, RunClock, RunState};

/// Guards `floor` against integrals that land a hair under a whole number.
const ARRIVAL_EPSILON: f64 = 1e-9;

/// What one executor did during the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorStats {
    pub name: Arc<str>,
    pub kind: String,
    /// Iterations the scheduler asked for, including dropped ones.
    pub scheduled: u64,
    pub pool: PoolStats,
    /// Stopped by an abort or timeout before its window ended.
    pub interrupted: bool,
}

/// Shared run plumbing handed to every executor task.
pub(crate) struct ExecutorContext {
    pub clock: RunClock,
    pub tick: Duration,
    pub limiter: Arc<Semaphore>,
    pub sink: RecordSink,
    pub state: Arc<watch::Sender<RunState>>,
    pub stop: watch::Receiver<bool>,
    pub cancel: watch::Receiver<bool>,
}

pub(crate) async fn run_executor(spec: ExecutorSpec, mut ctx: ExecutorContext) -> ExecutorStats {
    let kind = &spec.kind;
    let mut pool = WorkerPool::new(
        Arc::clone(&spec.name),
        Arc::clone(&spec.iteration),
        kind.max_workers(),
        kind.initial_workers(),
        Arc::clone(&ctx.limiter),
        ctx.sink.clone(),
        ctx.clock,
    );
    drop(ctx.sink);

    let began = tokio::select! {
        biased;
        _ = fired(&mut ctx.stop) => false,
        _ = sleep_until(ctx.clock.at(spec.start_time)) => true,
    };

    let mut scheduled = 0;
    if began {
        tracing::info!(
            executor = %spec.name,
            kind = kind.label(),
            workers = pool.allocated(),
            "Executor started"
        );
        let window_start = Instant::now();
        let schedule = kind.schedule();
        scheduled = if kind.is_open_loop() {
            open_loop(&mut pool, &schedule, window_start, ctx.tick, &mut ctx.stop).await
        } else {
            closed_loop(&mut pool, &schedule, window_start, ctx.tick, &mut ctx.stop).await
        };
    }

    let interrupted = *ctx.stop.borrow() && ctx.clock.elapsed() < spec.end_offset();
    tracing::info!(executor = %spec.name, scheduled, interrupted, "Executor stopped issuing");
    ctx.state.send_modify(RunState::executor_finished);

    pool.drain(spec.graceful_stop, &mut ctx.cancel).await;

    ExecutorStats {
        name: Arc::clone(&spec.name),
        kind: kind.label().to_string(),
        scheduled,
        pool: pool.stats(),
        interrupted,
    }
}

/// Whole arrivals due by the time the schedule has integrated to `expected`.
///
/// Arrival `k` is due once the integral reaches `k`, so the first one starts
/// with the window and the last lands strictly before it closes.
fn arrivals_due(expected: f64, planned: u64) -> u64 {
    if planned == 0 {
        return 0;
    }
    let reached = (expected + ARRIVAL_EPSILON).floor().max(0.0) as u64;
    (reached + 1).min(planned)
}

async fn open_loop(
    pool: &mut WorkerPool,
    schedule: &Schedule,
    window_start: Instant,
    tick: Duration,
    stop: &mut watch::Receiver<bool>,
) -> u64 {
    let total = schedule.total_duration();
    let planned = (schedule.expected_arrivals(total) + ARRIVAL_EPSILON).floor() as u64;
    let mut issued = 0;

    let mut ticker = interval_at(window_start, tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = fired(stop) => break,
            _ = ticker.tick() => {}
        }

        let elapsed = window_start.elapsed();
        if elapsed >= total {
            break;
        }

        let due = arrivals_due(schedule.expected_arrivals(elapsed), planned);
        while issued < due {
            pool.submit();
            issued += 1;
        }
    }

    if issued < planned {
        tracing::debug!(issued, planned, "Arrival window closed early");
    }
    issued
}

async fn closed_loop(
    pool: &mut WorkerPool,
    schedule: &Schedule,
    window_start: Instant,
    tick: Duration,
    stop: &mut watch::Receiver<bool>,
) -> u64 {
    let total = schedule.total_duration();
    let deadline = window_start + total;
    let mut issued = 0;
    let mut shortfall_recorded = 0;

    // Only matters for ramping targets; fixed targets wake on completions.
    let mut ticker = interval_at(window_start + tick, tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let elapsed = window_start.elapsed();
        if elapsed >= total || *stop.borrow() {
            break;
        }

        let target = schedule.value_at(elapsed).max(0.0).round() as usize;
        while pool.busy() < target {
            match pool.try_acquire() {
                Some(worker) => {
                    pool.dispatch(worker);
                    issued += 1;
                }
                None => break,
            }
        }

        // Slots the limiter refused, reported once each.
        let shortfall = target.saturating_sub(pool.busy());
        if shortfall > shortfall_recorded {
            pool.record_dropped(shortfall - shortfall_recorded);
            issued += (shortfall - shortfall_recorded) as u64;
            shortfall_recorded = shortfall;
        }

        tokio::select! {
            biased;
            _ = fired(stop) => break,
            _ = sleep_until(deadline) => break,
            _ = pool.wait_one() => {}
            _ = ticker.tick() => {}
        }
    }

    issued
}
