//! Bounded set of virtual workers for one executor.
//!
//! A worker is an id plus a slot in the process-wide limiter. Dispatching a
//! worker spawns a task that runs one iteration, emits its record and hands
//! the id back through the pool's [`JoinSet`]. The pool itself is owned by the
//! executor's scheduler task, so allocation needs no locking.
use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;

use crate::engine::iteration::{Iteration, IterationRecord, Outcome};
use crate::engine::metrics::RecordSink;
use crate::engine::state::{fired, RunClock};

/// Worker accounting reported per executor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub max_workers: usize,
    pub allocated: usize,
    pub peak_busy: usize,
}

pub struct WorkerPool {
    executor: Arc<str>,
    iteration: Arc<dyn Iteration>,
    max_workers: usize,
    limiter: Arc<Semaphore>,
    permits: Vec<OwnedSemaphorePermit>,
    idle: VecDeque<usize>,
    running: JoinSet<usize>,
    peak_busy: usize,
    sink: RecordSink,
    clock: RunClock,
    cancel: watch::Sender<bool>,
}

impl WorkerPool {
    /// Create a pool and allocate up to `initial` workers right away.
    ///
    /// `limiter` is shared by every pool of the run; each allocated worker
    /// holds one of its permits until the pool is dropped.
    pub fn new(
        executor: Arc<str>,
        iteration: Arc<dyn Iteration>,
        max_workers: usize,
        initial: usize,
        limiter: Arc<Semaphore>,
        sink: RecordSink,
        clock: RunClock,
    ) -> Self {
        let mut pool = Self {
            executor,
            iteration,
            max_workers,
            limiter,
            permits: Vec::new(),
            idle: VecDeque::new(),
            running: JoinSet::new(),
            peak_busy: 0,
            sink,
            clock,
            cancel: watch::channel(false).0,
        };

        let wanted = initial.min(max_workers);
        while pool.allocated() < wanted {
            match pool.allocate() {
                Some(worker) => pool.idle.push_back(worker),
                None => {
                    tracing::warn!(
                        executor = %pool.executor,
                        wanted,
                        allocated = pool.allocated(),
                        "Worker limit reached while pre-allocating"
                    );
                    break;
                }
            }
        }
        pool
    }

    pub fn allocated(&self) -> usize {
        self.permits.len()
    }

    pub fn busy(&self) -> usize {
        self.running.len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            max_workers: self.max_workers,
            allocated: self.allocated(),
            peak_busy: self.peak_busy,
        }
    }

    fn allocate(&mut self) -> Option<usize> {
        if self.allocated() >= self.max_workers {
            return None;
        }
        let permit = Arc::clone(&self.limiter).try_acquire_owned().ok()?;
        let worker = self.permits.len();
        self.permits.push(permit);
        tracing::trace!(executor = %self.executor, worker, "Allocated worker");
        Some(worker)
    }

    /// Collect workers whose iteration already finished.
    fn reap(&mut self) {
        while let Some(joined) = self.running.try_join_next() {
            self.release(joined);
        }
    }

    fn release(&mut self, joined: Result<usize, tokio::task::JoinError>) {
        match joined {
            Ok(worker) => self.idle.push_back(worker),
            // Worker bodies catch panics, so this only happens on runtime shutdown.
            Err(err) => tracing::error!(executor = %self.executor, "Worker task lost: {err}"),
        }
    }

    /// An idle worker, allocating a new one if the limits allow.
    pub fn try_acquire(&mut self) -> Option<usize> {
        self.reap();
        self.idle.pop_front().or_else(|| self.allocate())
    }

    /// Start one iteration on `worker`. The scheduler never waits on it.
    pub fn dispatch(&mut self, worker: usize) {
        let task = WorkerTask {
            worker,
            executor: Arc::clone(&self.executor),
            iteration: Arc::clone(&self.iteration),
            sink: self.sink.clone(),
            clock: self.clock,
            cancel: self.cancel.subscribe(),
        };
        self.running.spawn(task.run());
        self.peak_busy = self.peak_busy.max(self.running.len());
    }

    /// Open-loop submission: start an iteration now or record it as dropped.
    pub fn submit(&mut self) -> bool {
        match self.try_acquire() {
            Some(worker) => {
                self.dispatch(worker);
                true
            }
            None => {
                self.record_dropped(1);
                false
            }
        }
    }

    /// Emit `count` records for iterations that never got a worker.
    pub fn record_dropped(&self, count: usize) {
        if count == 0 {
            return;
        }
        tracing::debug!(
            executor = %self.executor,
            count,
            "No worker available, dropping iterations"
        );
        let now = self.clock.elapsed();
        for _ in 0..count {
            let _ = self.sink.send(IterationRecord {
                executor: Arc::clone(&self.executor),
                worker: None,
                started_at: now,
                ended_at: now,
                outcome: Outcome::CapacityExceeded,
                observations: Vec::new(),
            });
        }
    }

    /// Wait for any running iteration to finish and return its worker to the
    /// idle queue. Pending forever when nothing is running.
    pub async fn wait_one(&mut self) {
        match self.running.join_next().await {
            Some(joined) => self.release(joined),
            None => std::future::pending().await,
        }
    }

    /// Let in-flight iterations finish for up to `grace`, then cancel the rest.
    ///
    /// `hard_cancel` cuts the grace period short.
    pub async fn drain(&mut self, grace: Duration, hard_cancel: &mut watch::Receiver<bool>) {
        if !self.running.is_empty() {
            tracing::debug!(
                executor = %self.executor,
                in_flight = self.running.len(),
                "Draining workers"
            );
        }

        let deadline = tokio::time::sleep(grace);
        tokio::pin!(deadline);

        loop {
            let joined = tokio::select! {
                joined = self.running.join_next() => joined,
                _ = &mut deadline => break,
                _ = fired(hard_cancel) => break,
            };
            match joined {
                Some(joined) => self.release(joined),
                None => return,
            }
        }

        tracing::info!(
            executor = %self.executor,
            in_flight = self.running.len(),
            "Cancelling in-flight iterations"
        );
        self.cancel.send_replace(true);
        while let Some(joined) = self.running.join_next().await {
            self.release(joined);
        }
    }
}

struct WorkerTask {
    worker: usize,
    executor: Arc<str>,
    iteration: Arc<dyn Iteration>,
    sink: RecordSink,
    clock: RunClock,
    cancel: watch::Receiver<bool>,
}

impl WorkerTask {
    async fn run(mut self) -> usize {
        let started_at = self.clock.elapsed();

        let (outcome, observations) = tokio::select! {
            result = AssertUnwindSafe(self.iteration.run()).catch_unwind() => match result {
                Ok(Ok(observations)) => (Outcome::Success, observations),
                Ok(Err(err)) => (Outcome::Failure { error: err.message }, err.observations),
                Err(panic) => (
                    Outcome::Failure {
                        error: format!("iteration panicked: {}", panic_message(&*panic)),
                    },
                    Vec::new(),
                ),
            },
            _ = fired(&mut self.cancel) => (Outcome::Cancelled, Vec::new()),
        };

        let record = IterationRecord {
            executor: self.executor,
            worker: Some(self.worker),
            started_at,
            ended_at: self.clock.elapsed(),
            outcome,
            observations,
        };
        // Fails only once the aggregator is gone, at which point nobody reads it.
        let _ = self.sink.send(record);
        self.worker
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
