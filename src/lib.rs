//! Single-process load generation.
//!
//! Executors decide when iterations start, bounded worker pools run them and
//! a single aggregator folds their records into trend, rate and counter
//! metrics that thresholds turn into a PASSED or FAILED run.
pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod report;
pub mod utils;
pub mod variables;

pub use engine::{
    iteration_fn, Engine, EngineOptions, ExecutorKind, ExecutorSpec, Iteration, Observation,
    Stage, ThresholdSpec,
};
pub use error::{ConfigError, IterationError};
pub use report::{RunReport, RunStatus};
