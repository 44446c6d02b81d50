pub mod executor;
pub mod iteration;
pub mod metrics;
pub mod monitor;
pub mod pool;
pub mod runner;
pub mod schedule;
pub mod scheduler;
pub mod state;
pub mod threshold;

pub use executor::{ExecutorKind, ExecutorSpec, DEFAULT_GRACEFUL_STOP};
pub use iteration::{
    iteration_fn, Iteration, IterationRecord, MetricKind, Observation, ObservedValue, Outcome,
};
pub use metrics::{names, MetricSummary, MetricsRegistry};
pub use monitor::{AbortCause, Checkpoint};
pub use runner::{Engine, EngineOptions};
pub use schedule::{Schedule, Stage};
pub use state::{RunControl, RunPhase, RunState};
pub use threshold::{ThresholdResult, ThresholdSpec, ThresholdStatus};
