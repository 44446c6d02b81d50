use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

/// Lifecycle of a run. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Idle,
    /// At least one executor is still issuing iterations.
    Running,
    /// Nothing new starts; in-flight iterations are finishing.
    Draining,
    Completed,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunPhase::Idle => "idle",
            RunPhase::Running => "running",
            RunPhase::Draining => "draining",
            RunPhase::Completed => "completed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct RunState {
    pub phase: RunPhase,
    pub started: Option<Instant>,
    /// Executors that have not yet stopped issuing.
    pub active_executors: usize,
    pub aborted: bool,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            phase: RunPhase::Idle,
            started: None,
            active_executors: 0,
            aborted: false,
        }
    }
}

impl RunState {
    /// One executor stopped issuing. The last one moves the run to draining.
    pub(crate) fn executor_finished(&mut self) {
        self.active_executors = self.active_executors.saturating_sub(1);
        if self.active_executors == 0 && self.phase == RunPhase::Running {
            self.phase = RunPhase::Draining;
        }
    }

    pub(crate) fn advance(&mut self, phase: RunPhase) {
        if phase > self.phase {
            self.phase = phase;
        }
    }
}

/// Monotonic time since the run started. Every record offset comes from one
/// shared clock.
#[derive(Debug, Clone, Copy)]
pub struct RunClock {
    start: Instant,
}

impl RunClock {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Instant `offset` after run start.
    pub fn at(&self, offset: Duration) -> Instant {
        self.start + offset
    }

    pub fn started(&self) -> Instant {
        self.start
    }
}

/// Stop signals shared by every task of a run.
///
/// `stop` asks schedulers to quit issuing and drain gracefully (abort on a
/// failed threshold). `cancel` interrupts in-flight iterations (hard timeout).
#[derive(Debug)]
pub struct RunControl {
    stop: watch::Sender<bool>,
    cancel: watch::Sender<bool>,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    pub fn new() -> Self {
        Self {
            stop: watch::channel(false).0,
            cancel: watch::channel(false).0,
        }
    }

    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Cancel implies stop.
    pub fn cancel(&self) {
        self.stop.send_replace(true);
        self.cancel.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    pub fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }
}

/// Resolves once `signal` turns true. Never resolves if the sender is gone
/// without having fired.
pub(crate) async fn fired(signal: &mut watch::Receiver<bool>) {
    if signal.wait_for(|fired| *fired).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_clock_follows_tokio_time() {
        let clock = RunClock::start();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(clock.elapsed(), Duration::from_millis(1500));
        assert_eq!(clock.at(Duration::from_secs(2)) - clock.started(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_cancel_implies_stop() {
        let control = RunControl::new();
        let mut stop = control.stop_signal();
        let mut cancel = control.cancel_signal();
        control.cancel();
        fired(&mut stop).await;
        fired(&mut cancel).await;
        assert!(control.is_stopped());
    }

    #[test]
    fn test_phase_order() {
        assert!(RunPhase::Idle < RunPhase::Running);
        assert!(RunPhase::Running < RunPhase::Draining);
        assert!(RunPhase::Draining < RunPhase::Completed);
    }
}
