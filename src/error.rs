use thiserror::Error;

use crate::engine::iteration::Observation;

/// Rejects a run before it starts. Nothing in the engine produces this once
/// the run is underway.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no executors configured")]
    NoExecutors,

    #[error("executor name must not be empty")]
    EmptyExecutorName,

    #[error("executor '{0}' is registered more than once")]
    DuplicateExecutor(String),

    #[error("executor '{executor}': {reason}")]
    InvalidExecutor { executor: String, reason: String },

    #[error("threshold '{expression}' on metric '{metric}': {reason}")]
    InvalidThreshold {
        metric: String,
        expression: String,
        reason: String,
    },

    #[error("invalid duration '{0}' (expected e.g. 500ms, 30s, 2m, 1m30s)")]
    InvalidDuration(String),

    #[error("engine option '{option}': {reason}")]
    InvalidOption { option: String, reason: String },

    #[error("failed to read run file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse run file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ConfigError {
    pub(crate) fn executor(executor: &str, reason: impl Into<String>) -> Self {
        Self::InvalidExecutor {
            executor: executor.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn threshold(metric: &str, expression: &str, reason: impl Into<String>) -> Self {
        Self::InvalidThreshold {
            metric: metric.to_string(),
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }
}

/// Failure of a single iteration. Recorded as data, never propagated past the
/// worker pool.
///
/// Observations gathered before the failure (for example the duration of the
/// request that returned a 500) travel with the error so they still reach the
/// aggregator.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct IterationError {
    pub message: String,
    pub observations: Vec<Observation>,
}

impl IterationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            observations: Vec::new(),
        }
    }

    pub fn with_observations(mut self, observations: Vec<Observation>) -> Self {
        self.observations = observations;
        self
    }
}

impl From<anyhow::Error> for IterationError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

impl From<reqwest::Error> for IterationError {
    fn from(err: reqwest::Error) -> Self {
        Self::new(err.to_string())
    }
}
