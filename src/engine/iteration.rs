use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::IterationError;

/// One unit of caller-supplied load logic.
///
/// An iteration may perform any number of request/response exchanges. It
/// returns the named observations it made, or an [`IterationError`] which the
/// worker pool records as a failed iteration.
///
/// ```rust
/// use volley::engine::{Iteration, Observation};
/// use volley::IterationError;
///
/// struct Ping;
///
/// #[async_trait::async_trait]
/// impl Iteration for Ping {
///     async fn run(&self) -> Result<Vec<Observation>, IterationError> {
///         Ok(vec![Observation::trend("ping_ms", 1.0)])
///     }
/// }
/// ```
#[async_trait]
pub trait Iteration: Send + Sync {
    async fn run(&self) -> Result<Vec<Observation>, IterationError>;
}

/// Adapter turning an async closure into an [`Iteration`].
pub struct IterationFn<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Iteration for IterationFn<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<Observation>, IterationError>> + Send,
{
    async fn run(&self) -> Result<Vec<Observation>, IterationError> {
        (self.f)().await
    }
}

/// Wrap a closure as a shareable iteration.
///
/// Clients and other heavy state belong in the closure's captures, not inside
/// the returned future.
pub fn iteration_fn<F, Fut>(f: F) -> Arc<dyn Iteration>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Observation>, IterationError>> + Send + 'static,
{
    Arc::new(IterationFn { f })
}

/// Metric kind an observation feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Trend,
    Rate,
    Counter,
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricKind::Trend => write!(f, "trend"),
            MetricKind::Rate => write!(f, "rate"),
            MetricKind::Counter => write!(f, "counter"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum ObservedValue {
    Trend(f64),
    Rate(bool),
    Counter(f64),
}

impl ObservedValue {
    pub fn kind(&self) -> MetricKind {
        match self {
            ObservedValue::Trend(_) => MetricKind::Trend,
            ObservedValue::Rate(_) => MetricKind::Rate,
            ObservedValue::Counter(_) => MetricKind::Counter,
        }
    }
}

/// A named sample produced by an iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub metric: String,
    #[serde(flatten)]
    pub value: ObservedValue,
}

impl Observation {
    pub fn trend(metric: impl Into<String>, value: f64) -> Self {
        Self {
            metric: metric.into(),
            value: ObservedValue::Trend(value),
        }
    }

    /// Trend sample of a duration, in milliseconds.
    pub fn duration(metric: impl Into<String>, value: Duration) -> Self {
        Self::trend(metric, value.as_secs_f64() * 1000.0)
    }

    pub fn rate(metric: impl Into<String>, matched: bool) -> Self {
        Self {
            metric: metric.into(),
            value: ObservedValue::Rate(matched),
        }
    }

    pub fn counter(metric: impl Into<String>, value: f64) -> Self {
        Self {
            metric: metric.into(),
            value: ObservedValue::Counter(value),
        }
    }
}

/// How an iteration ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure { error: String },
    /// Interrupted by the graceful-stop budget or the run's hard timeout.
    Cancelled,
    /// Dropped before it started: no worker could be allocated.
    CapacityExceeded,
}

/// Immutable record of one iteration, emitted exactly once by the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub executor: Arc<str>,
    /// `None` for arrivals dropped before a worker was assigned.
    pub worker: Option<usize>,
    /// Offset from run start.
    #[serde(with = "duration_ms")]
    pub started_at: Duration,
    #[serde(with = "duration_ms")]
    pub ended_at: Duration,
    pub outcome: Outcome,
    pub observations: Vec<Observation>,
}

impl IterationRecord {
    pub fn duration(&self) -> Duration {
        self.ended_at.saturating_sub(self.started_at)
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, Outcome::Success | Outcome::Failure { .. })
    }
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64() * 1000.0)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(millis.max(0.0) / 1000.0).map_err(serde::de::Error::custom)
    }
}
