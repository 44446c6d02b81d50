//! Streaming statistics fed by iteration records.
//!
//! Workers never touch the registry. They push [`IterationRecord`]s into an
//! unbounded queue and a single aggregator task drains it in batches, taking
//! the write lock once per batch. Readers (checkpoints, the final report) take
//! the read lock.
use std::sync::Arc;
use std::time::Duration;

use hdrhistogram::Histogram;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::engine::iteration::{IterationRecord, MetricKind, ObservedValue, Outcome};

/// Names of the metrics the engine and the HTTP iteration emit.
pub mod names {
    pub const ITERATIONS: &str = "iterations";
    pub const ITERATION_DURATION: &str = "iteration_duration";
    pub const ITERATION_FAILED: &str = "iteration_failed";
    pub const DROPPED_ITERATIONS: &str = "dropped_iterations";
    pub const CANCELLED_ITERATIONS: &str = "cancelled_iterations";

    pub const HTTP_REQS: &str = "http_reqs";
    pub const HTTP_REQ_DURATION: &str = "http_req_duration";
    pub const HTTP_REQ_FAILED: &str = "http_req_failed";
    pub const CHECKS: &str = "checks";
}

/// Kind of a metric the engine knows about ahead of time.
pub fn builtin_kind(metric: &str) -> Option<MetricKind> {
    use names::*;
    match metric {
        ITERATIONS | DROPPED_ITERATIONS | CANCELLED_ITERATIONS | HTTP_REQS => {
            Some(MetricKind::Counter)
        }
        ITERATION_DURATION | HTTP_REQ_DURATION => Some(MetricKind::Trend),
        ITERATION_FAILED | HTTP_REQ_FAILED | CHECKS => Some(MetricKind::Rate),
        _ => None,
    }
}

/// Trend values are kept in the histogram at this many units per 1.0, giving
/// microsecond resolution for millisecond trends.
const TREND_SCALE: f64 = 1000.0;

/// Distribution of a numeric observation.
///
/// Percentiles come from an HDR histogram with three significant digits, so
/// they are approximate (within 0.1%) while count, sum, min and max are exact.
#[derive(Debug, Clone)]
pub struct TrendStat {
    histogram: Histogram<u64>,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Default for TrendStat {
    fn default() -> Self {
        Self::new()
    }
}

impl TrendStat {
    pub fn new() -> Self {
        Self {
            histogram: Histogram::new(3).expect("3 significant figures is a valid precision"),
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    pub fn add(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        // Negative samples still count toward min/mean; the histogram floors them at zero.
        let scaled = (value.max(0.0) * TREND_SCALE).round() as u64;
        let _ = self.histogram.record(scaled);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    /// Value at percentile `p` (0..=100). Clamped to the observed range.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        let quantile = (p / 100.0).clamp(0.0, 1.0);
        let raw = self.histogram.value_at_quantile(quantile) as f64 / TREND_SCALE;
        Some(raw.clamp(self.min.max(0.0).min(self.max), self.max))
    }
}

/// Fraction of samples matching a predicate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateStat {
    pub matches: u64,
    pub total: u64,
}

impl RateStat {
    pub fn add(&mut self, matched: bool) {
        self.total += 1;
        if matched {
            self.matches += 1;
        }
    }

    pub fn rate(&self) -> Option<f64> {
        (self.total > 0).then(|| self.matches as f64 / self.total as f64)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CounterStat {
    pub sum: f64,
    pub samples: u64,
}

impl CounterStat {
    pub fn add(&mut self, value: f64) {
        if value.is_finite() {
            self.sum += value;
            self.samples += 1;
        }
    }

    pub fn per_second(&self, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            self.sum / secs
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone)]
pub enum MetricStat {
    Trend(TrendStat),
    Rate(RateStat),
    Counter(CounterStat),
}

impl MetricStat {
    pub fn new(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Trend => MetricStat::Trend(TrendStat::new()),
            MetricKind::Rate => MetricStat::Rate(RateStat::default()),
            MetricKind::Counter => MetricStat::Counter(CounterStat::default()),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            MetricStat::Trend(_) => MetricKind::Trend,
            MetricStat::Rate(_) => MetricKind::Rate,
            MetricStat::Counter(_) => MetricKind::Counter,
        }
    }

    /// Whether any sample has been recorded. Counters always have a value.
    pub fn has_data(&self) -> bool {
        match self {
            MetricStat::Trend(t) => t.count() > 0,
            MetricStat::Rate(r) => r.total > 0,
            MetricStat::Counter(_) => true,
        }
    }

    fn observe(&mut self, value: ObservedValue) -> bool {
        match (self, value) {
            (MetricStat::Trend(t), ObservedValue::Trend(v)) => t.add(v),
            (MetricStat::Rate(r), ObservedValue::Rate(m)) => r.add(m),
            (MetricStat::Counter(c), ObservedValue::Counter(v)) => c.add(v),
            _ => return false,
        }
        true
    }

    pub fn summary(&self, elapsed: Duration) -> MetricSummary {
        match self {
            MetricStat::Trend(t) => MetricSummary::Trend {
                count: t.count(),
                avg: t.mean(),
                min: t.min(),
                med: t.percentile(50.0),
                max: t.max(),
                p90: t.percentile(90.0),
                p95: t.percentile(95.0),
                p99: t.percentile(99.0),
            },
            MetricStat::Rate(r) => MetricSummary::Rate {
                rate: r.rate(),
                matches: r.matches,
                total: r.total,
            },
            MetricStat::Counter(c) => MetricSummary::Counter {
                count: c.sum,
                rate: c.per_second(elapsed),
            },
        }
    }
}

/// Final or checkpointed value of a metric, as exposed in reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetricSummary {
    Trend {
        count: u64,
        avg: Option<f64>,
        min: Option<f64>,
        med: Option<f64>,
        max: Option<f64>,
        p90: Option<f64>,
        p95: Option<f64>,
        p99: Option<f64>,
    },
    Rate {
        rate: Option<f64>,
        matches: u64,
        total: u64,
    },
    Counter {
        count: f64,
        /// Per second over the run so far.
        rate: f64,
    },
}

/// Per-executor outcome tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorTally {
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub dropped: u64,
}

impl ExecutorTally {
    fn merge(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Success => self.completed += 1,
            Outcome::Failure { .. } => {
                self.completed += 1;
                self.failed += 1;
            }
            Outcome::Cancelled => self.cancelled += 1,
            Outcome::CapacityExceeded => self.dropped += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.completed + self.cancelled + self.dropped
    }
}

/// Every metric seen during a run, keyed by name in first-seen order.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    metrics: IndexMap<String, MetricStat>,
    executors: IndexMap<Arc<str>, ExecutorTally>,
    records: Option<Vec<IterationRecord>>,
    rejected: u64,
}

pub type SharedRegistry = Arc<RwLock<MetricsRegistry>>;

impl MetricsRegistry {
    pub fn new(retain_records: bool) -> Self {
        let mut registry = Self {
            records: retain_records.then(Vec::new),
            ..Self::default()
        };
        for name in [
            names::ITERATIONS,
            names::ITERATION_DURATION,
            names::ITERATION_FAILED,
            names::DROPPED_ITERATIONS,
            names::CANCELLED_ITERATIONS,
        ] {
            if let Some(kind) = builtin_kind(name) {
                registry
                    .metrics
                    .insert(name.to_string(), MetricStat::new(kind));
            }
        }
        registry
    }

    pub fn shared(retain_records: bool) -> SharedRegistry {
        Arc::new(RwLock::new(Self::new(retain_records)))
    }

    /// Register an executor so it appears in reports even if it never ran.
    pub fn register_executor(&mut self, name: Arc<str>) {
        self.executors.entry(name).or_default();
    }

    pub fn consume(&mut self, record: IterationRecord) {
        self.executors
            .entry(Arc::clone(&record.executor))
            .or_default()
            .merge(&record.outcome);

        match &record.outcome {
            Outcome::Success | Outcome::Failure { .. } => {
                let failed = matches!(record.outcome, Outcome::Failure { .. });
                let millis = record.duration().as_secs_f64() * 1000.0;
                self.observe(names::ITERATIONS, ObservedValue::Counter(1.0));
                self.observe(names::ITERATION_DURATION, ObservedValue::Trend(millis));
                self.observe(names::ITERATION_FAILED, ObservedValue::Rate(failed));
            }
            Outcome::Cancelled => {
                self.observe(names::CANCELLED_ITERATIONS, ObservedValue::Counter(1.0));
            }
            Outcome::CapacityExceeded => {
                self.observe(names::DROPPED_ITERATIONS, ObservedValue::Counter(1.0));
            }
        }

        for obs in &record.observations {
            self.observe(&obs.metric, obs.value);
        }

        if let Some(records) = self.records.as_mut() {
            records.push(record);
        }
    }

    fn observe(&mut self, metric: &str, value: ObservedValue) {
        let stat = match self.metrics.get_mut(metric) {
            Some(stat) => stat,
            None => self
                .metrics
                .entry(metric.to_string())
                .or_insert_with(|| MetricStat::new(value.kind())),
        };
        if !stat.observe(value) {
            if self.rejected == 0 {
                tracing::warn!(
                    metric,
                    expected = %stat.kind(),
                    got = %value.kind(),
                    "Dropping sample with mismatched metric kind"
                );
            }
            self.rejected += 1;
        }
    }

    pub fn get(&self, metric: &str) -> Option<&MetricStat> {
        self.metrics.get(metric)
    }

    pub fn executor(&self, name: &str) -> Option<&ExecutorTally> {
        self.executors.get(name)
    }

    /// Samples discarded because their kind disagreed with the metric's.
    pub fn rejected_samples(&self) -> u64 {
        self.rejected
    }

    pub fn summaries(&self, elapsed: Duration) -> IndexMap<String, MetricSummary> {
        self.metrics
            .iter()
            .map(|(name, stat)| (name.clone(), stat.summary(elapsed)))
            .collect()
    }

    pub fn take_records(&mut self) -> Option<Vec<IterationRecord>> {
        self.records.take()
    }

    /// Sum of all executor tallies.
    pub fn totals(&self) -> ExecutorTally {
        self.executors
            .values()
            .fold(ExecutorTally::default(), |mut acc, t| {
                acc.completed += t.completed;
                acc.failed += t.failed;
                acc.cancelled += t.cancelled;
                acc.dropped += t.dropped;
                acc
            })
    }
}

/// Sending side handed to every worker and scheduler.
pub type RecordSink = mpsc::UnboundedSender<IterationRecord>;

/// Spawn the single consumer that folds records into `registry`.
///
/// The task ends once every [`RecordSink`] has been dropped and the queue is
/// empty.
pub fn spawn_aggregator(
    registry: SharedRegistry,
    batch_size: usize,
) -> (RecordSink, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(aggregator_task(rx, registry, batch_size.max(1)));
    (tx, handle)
}

async fn aggregator_task(
    mut rx: mpsc::UnboundedReceiver<IterationRecord>,
    registry: SharedRegistry,
    batch_size: usize,
) {
    let mut batch = Vec::with_capacity(batch_size);

    // First record of a batch waits; the rest are whatever is already queued.
    while let Some(record) = rx.recv().await {
        batch.push(record);
        while batch.len() < batch_size {
            match rx.try_recv() {
                Ok(record) => batch.push(record),
                Err(_) => break,
            }
        }

        let mut guard = registry.write();
        for record in batch.drain(..) {
            guard.consume(record);
        }
    }

    tracing::debug!("Aggregator drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::iteration::Observation;

    fn record(outcome: Outcome, millis: u64, observations: Vec<Observation>) -> IterationRecord {
        IterationRecord {
            executor: Arc::from("test"),
            worker: Some(0),
            started_at: Duration::ZERO,
            ended_at: Duration::from_millis(millis),
            outcome,
            observations,
        }
    }

    #[test]
    fn test_rate_is_exact() {
        let mut registry = MetricsRegistry::new(false);
        let k = 1000;
        let f = 37;
        for i in 0..k {
            let outcome = if i < f {
                Outcome::Failure {
                    error: "x".to_string(),
                }
            } else {
                Outcome::Success
            };
            registry.consume(record(outcome, 10, vec![]));
        }

        let Some(MetricStat::Rate(rate)) = registry.get(names::ITERATION_FAILED) else {
            panic!("iteration_failed should be a rate");
        };
        assert_eq!(rate.rate(), Some(f as f64 / k as f64));
        assert_eq!(rate.total, k);
        assert_eq!(registry.totals().failed, f);
    }

    #[test]
    fn test_percentiles_are_monotonic() {
        let mut trend = TrendStat::new();
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        for _ in 0..10_000 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            trend.add((seed % 5_000) as f64 / 3.0);
        }

        let p50 = trend.percentile(50.0).unwrap();
        let p90 = trend.percentile(90.0).unwrap();
        let p95 = trend.percentile(95.0).unwrap();
        let p99 = trend.percentile(99.0).unwrap();
        assert!(p50 <= p90 && p90 <= p95 && p95 <= p99);
        assert!(trend.min().unwrap() <= p50);
        assert!(p99 <= trend.max().unwrap());
    }

    #[test]
    fn test_single_sample_percentiles() {
        let mut trend = TrendStat::new();
        trend.add(42.5);
        for p in [0.0, 50.0, 90.0, 99.0, 100.0] {
            assert_eq!(trend.percentile(p), Some(42.5));
        }
        assert_eq!(trend.mean(), Some(42.5));
    }

    #[test]
    fn test_percentile_accuracy() {
        let mut trend = TrendStat::new();
        for v in 1..=1000 {
            trend.add(v as f64);
        }
        let p95 = trend.percentile(95.0).unwrap();
        assert!((p95 - 950.0).abs() / 950.0 < 0.01, "p95 = {p95}");
        assert_eq!(trend.min(), Some(1.0));
        assert_eq!(trend.max(), Some(1000.0));
    }

    #[test]
    fn test_empty_trend_has_no_values() {
        let trend = TrendStat::new();
        assert_eq!(trend.percentile(95.0), None);
        assert_eq!(trend.mean(), None);
    }

    #[test]
    fn test_outcomes_feed_builtin_metrics() {
        let mut registry = MetricsRegistry::new(true);
        registry.consume(record(Outcome::Success, 100, vec![]));
        registry.consume(record(Outcome::Cancelled, 5, vec![]));
        registry.consume(record(Outcome::CapacityExceeded, 0, vec![]));
        registry.consume(record(
            Outcome::Success,
            300,
            vec![Observation::trend("order_create_duration", 12.0)],
        ));

        let summaries = registry.summaries(Duration::from_secs(2));
        assert_eq!(
            summaries[names::ITERATIONS],
            MetricSummary::Counter {
                count: 2.0,
                rate: 1.0
            }
        );
        assert!(matches!(
            summaries[names::DROPPED_ITERATIONS],
            MetricSummary::Counter { count, .. } if count == 1.0
        ));
        assert!(matches!(
            summaries[names::CANCELLED_ITERATIONS],
            MetricSummary::Counter { count, .. } if count == 1.0
        ));
        match &summaries[names::ITERATION_DURATION] {
            MetricSummary::Trend { count, avg, .. } => {
                assert_eq!(*count, 2);
                assert_eq!(*avg, Some(200.0));
            }
            other => panic!("unexpected summary {other:?}"),
        }
        assert!(summaries.contains_key("order_create_duration"));

        let tally = registry.executor("test").unwrap();
        assert_eq!(tally.completed, 2);
        assert_eq!(tally.cancelled, 1);
        assert_eq!(tally.dropped, 1);
        assert_eq!(registry.take_records().map(|r| r.len()), Some(4));
    }

    #[test]
    fn test_kind_mismatch_is_rejected() {
        let mut registry = MetricsRegistry::new(false);
        registry.consume(record(
            Outcome::Success,
            1,
            vec![
                Observation::trend("latency", 1.0),
                Observation::rate("latency", true),
            ],
        ));
        assert_eq!(registry.rejected_samples(), 1);
        assert_eq!(registry.get("latency").unwrap().kind(), MetricKind::Trend);
    }

    #[tokio::test]
    async fn test_aggregator_drains_all_senders() {
        let registry = MetricsRegistry::shared(false);
        let (sink, handle) = spawn_aggregator(Arc::clone(&registry), 8);

        let mut producers = Vec::new();
        for _ in 0..4 {
            let sink = sink.clone();
            producers.push(tokio::spawn(async move {
                for _ in 0..250 {
                    sink.send(record(Outcome::Success, 1, vec![])).unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }
        drop(sink);
        for p in producers {
            p.await.unwrap();
        }
        handle.await.unwrap();

        assert_eq!(registry.read().totals().completed, 1000);
    }
}
