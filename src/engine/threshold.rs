//! Pass/fail criteria over aggregated metrics.
//!
//! Expressions take the form `<statistic> <op> <value>[unit]`, for example
//! `rate<0.02`, `p(95)<800`, `p95 < 800ms`, `max<1s` or `count>=10`. Units are
//! only meaningful for trend statistics and convert to milliseconds.
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::engine::iteration::MetricKind;
use crate::engine::metrics::{builtin_kind, MetricStat, MetricsRegistry};
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Statistic {
    /// Fraction of matches for a rate, per-second rate for a counter.
    Rate,
    Avg,
    Min,
    Max,
    Med,
    Percentile(f64),
    Count,
}

impl Statistic {
    pub fn applies_to(&self, kind: MetricKind) -> bool {
        match (self, kind) {
            (Statistic::Rate, MetricKind::Rate | MetricKind::Counter) => true,
            (Statistic::Count, MetricKind::Counter | MetricKind::Trend) => true,
            (
                Statistic::Avg
                | Statistic::Min
                | Statistic::Max
                | Statistic::Med
                | Statistic::Percentile(_),
                MetricKind::Trend,
            ) => true,
            _ => false,
        }
    }

    /// Current value of this statistic, or `None` when the metric has no data.
    pub fn value(&self, stat: &MetricStat, elapsed: Duration) -> Option<f64> {
        if !stat.has_data() {
            return None;
        }
        match (self, stat) {
            (Statistic::Rate, MetricStat::Rate(r)) => r.rate(),
            (Statistic::Rate, MetricStat::Counter(c)) => Some(c.per_second(elapsed)),
            (Statistic::Count, MetricStat::Counter(c)) => Some(c.sum),
            (Statistic::Count, MetricStat::Trend(t)) => Some(t.count() as f64),
            (Statistic::Avg, MetricStat::Trend(t)) => t.mean(),
            (Statistic::Min, MetricStat::Trend(t)) => t.min(),
            (Statistic::Max, MetricStat::Trend(t)) => t.max(),
            (Statistic::Med, MetricStat::Trend(t)) => t.percentile(50.0),
            (Statistic::Percentile(p), MetricStat::Trend(t)) => t.percentile(*p),
            _ => None,
        }
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statistic::Rate => write!(f, "rate"),
            Statistic::Avg => write!(f, "avg"),
            Statistic::Min => write!(f, "min"),
            Statistic::Max => write!(f, "max"),
            Statistic::Med => write!(f, "med"),
            Statistic::Percentile(p) => write!(f, "p({p})"),
            Statistic::Count => write!(f, "count"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparison {
    pub fn holds(&self, observed: f64, bound: f64) -> bool {
        match self {
            Comparison::Lt => observed < bound,
            Comparison::Le => observed <= bound,
            Comparison::Gt => observed > bound,
            Comparison::Ge => observed >= bound,
            Comparison::Eq => observed == bound,
            Comparison::Ne => observed != bound,
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
            Comparison::Eq => "==",
            Comparison::Ne => "!=",
        };
        f.write_str(op)
    }
}

/// A parsed threshold expression.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdExpr {
    pub statistic: Statistic,
    pub comparison: Comparison,
    pub bound: f64,
    source: String,
}

fn expression_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^\s*(rate|avg|min|max|med|count|p\(\s*(\d+(?:\.\d+)?)\s*\)|p(\d+(?:\.\d+)?))\s*(<=|>=|==|!=|<|>)\s*(-?\d+(?:\.\d+)?)\s*(ms|s|m)?\s*$",
        )
        .expect("Invalid threshold regex")
    })
}

impl FromStr for ThresholdExpr {
    type Err = String;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        let caps = expression_regex()
            .captures(expr)
            .ok_or_else(|| "expected `<statistic> <op> <value>`, e.g. `p(95)<800`".to_string())?;

        let statistic = match &caps[1] {
            "rate" => Statistic::Rate,
            "avg" => Statistic::Avg,
            "min" => Statistic::Min,
            "max" => Statistic::Max,
            "med" => Statistic::Med,
            "count" => Statistic::Count,
            _ => {
                let raw = caps
                    .get(2)
                    .or_else(|| caps.get(3))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                let p: f64 = raw
                    .parse()
                    .map_err(|_| format!("invalid percentile '{raw}'"))?;
                if !(0.0..=100.0).contains(&p) {
                    return Err(format!("percentile {p} is outside 0..=100"));
                }
                Statistic::Percentile(p)
            }
        };

        let comparison = match &caps[4] {
            "<" => Comparison::Lt,
            "<=" => Comparison::Le,
            ">" => Comparison::Gt,
            ">=" => Comparison::Ge,
            "==" => Comparison::Eq,
            _ => Comparison::Ne,
        };

        let mut bound: f64 = caps[5]
            .parse()
            .map_err(|_| format!("invalid number '{}'", &caps[5]))?;
        if let Some(unit) = caps.get(6) {
            if matches!(statistic, Statistic::Rate | Statistic::Count) {
                return Err(format!("a time unit makes no sense for {statistic}"));
            }
            bound *= match unit.as_str() {
                "s" => 1_000.0,
                "m" => 60_000.0,
                _ => 1.0,
            };
        }

        Ok(Self {
            statistic,
            comparison,
            bound,
            source: expr.trim().to_string(),
        })
    }
}

impl fmt::Display for ThresholdExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// A threshold bound to a metric.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdSpec {
    pub metric: String,
    pub expr: ThresholdExpr,
    /// Stop the run as soon as a checkpoint sees this threshold failing.
    pub abort_on_fail: bool,
    /// Checkpoints before this offset never abort.
    pub delay_abort_eval: Duration,
}

impl ThresholdSpec {
    pub fn new(metric: impl Into<String>, expression: &str) -> Result<Self, ConfigError> {
        let metric = metric.into();
        let expr = expression
            .parse::<ThresholdExpr>()
            .map_err(|reason| ConfigError::threshold(&metric, expression, reason))?;
        let spec = Self {
            metric,
            expr,
            abort_on_fail: false,
            delay_abort_eval: Duration::ZERO,
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn abort_on_fail(mut self, delay: Duration) -> Self {
        self.abort_on_fail = true;
        self.delay_abort_eval = delay;
        self
    }

    /// Reject statistics that can never apply to a built-in metric.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.metric.trim().is_empty() {
            return Err(ConfigError::threshold(
                &self.metric,
                &self.expr.source,
                "metric name is empty",
            ));
        }
        if let Some(kind) = builtin_kind(&self.metric) {
            if !self.expr.statistic.applies_to(kind) {
                return Err(ConfigError::threshold(
                    &self.metric,
                    &self.expr.source,
                    format!("{} does not apply to {kind} metric", self.expr.statistic),
                ));
            }
        }
        Ok(())
    }

    /// Evaluate against the registry. Reading never alters the data.
    pub fn evaluate(&self, registry: &MetricsRegistry, elapsed: Duration) -> ThresholdResult {
        let (observed, status) = match registry.get(&self.metric) {
            None => (None, ThresholdStatus::NoData),
            Some(stat) if !self.expr.statistic.applies_to(stat.kind()) => {
                tracing::warn!(
                    metric = %self.metric,
                    expression = %self.expr,
                    kind = %stat.kind(),
                    "Threshold statistic does not apply to metric kind"
                );
                (None, ThresholdStatus::Failed)
            }
            Some(stat) => match self.expr.statistic.value(stat, elapsed) {
                None => (None, ThresholdStatus::NoData),
                Some(value) if self.expr.comparison.holds(value, self.expr.bound) => {
                    (Some(value), ThresholdStatus::Passed)
                }
                Some(value) => (Some(value), ThresholdStatus::Failed),
            },
        };

        ThresholdResult {
            metric: self.metric.clone(),
            expression: self.expr.to_string(),
            observed,
            status,
            abort_on_fail: self.abort_on_fail,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdStatus {
    Passed,
    Failed,
    /// The metric saw no samples; does not fail the run.
    NoData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdResult {
    pub metric: String,
    pub expression: String,
    pub observed: Option<f64>,
    pub status: ThresholdStatus,
    pub abort_on_fail: bool,
}

impl ThresholdResult {
    pub fn failed(&self) -> bool {
        self.status == ThresholdStatus::Failed
    }
}

pub fn evaluate_all(
    specs: &[ThresholdSpec],
    registry: &MetricsRegistry,
    elapsed: Duration,
) -> Vec<ThresholdResult> {
    specs
        .iter()
        .map(|spec| spec.evaluate(registry, elapsed))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::iteration::{IterationRecord, Observation, Outcome};
    use crate::engine::metrics::names;
    use std::sync::Arc;

    fn expr(s: &str) -> ThresholdExpr {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_expressions() {
        let e = expr("rate<0.02");
        assert_eq!(e.statistic, Statistic::Rate);
        assert_eq!(e.comparison, Comparison::Lt);
        assert_eq!(e.bound, 0.02);

        let e = expr("p(95)<800");
        assert_eq!(e.statistic, Statistic::Percentile(95.0));
        assert_eq!(e.bound, 800.0);

        let e = expr("p95 < 800ms");
        assert_eq!(e.statistic, Statistic::Percentile(95.0));
        assert_eq!(e.bound, 800.0);

        let e = expr("p(99.9)<=1.5s");
        assert_eq!(e.statistic, Statistic::Percentile(99.9));
        assert_eq!(e.comparison, Comparison::Le);
        assert_eq!(e.bound, 1500.0);

        assert_eq!(expr("max<1m").bound, 60_000.0);
        assert_eq!(expr("count>=10").comparison, Comparison::Ge);
        assert_eq!(expr("  avg != 3 ").to_string(), "avg != 3");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", "p95", "rate<", "p(101)<5", "median<3", "rate<0.1s", "avg<<3"] {
            assert!(bad.parse::<ThresholdExpr>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn test_statistic_must_fit_builtin_kind() {
        let err = ThresholdSpec::new(names::HTTP_REQ_FAILED, "p(95)<10").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidThreshold { .. }));
        assert!(ThresholdSpec::new(names::HTTP_REQ_DURATION, "rate<0.1").is_err());
        assert!(ThresholdSpec::new(names::DROPPED_ITERATIONS, "count<1").is_ok());
        assert!(ThresholdSpec::new("custom_metric", "p(95)<10").is_ok());
    }

    fn registry_with_failures(failed: usize, total: usize) -> MetricsRegistry {
        let mut registry = MetricsRegistry::new(false);
        for i in 0..total {
            registry.consume(IterationRecord {
                executor: Arc::from("orders"),
                worker: Some(0),
                started_at: Duration::ZERO,
                ended_at: Duration::from_millis(10 * (i as u64 + 1)),
                outcome: if i < failed {
                    Outcome::Failure {
                        error: "HTTP 500".into(),
                    }
                } else {
                    Outcome::Success
                },
                observations: vec![Observation::trend("order_create_duration", i as f64)],
            });
        }
        registry
    }

    #[test]
    fn test_evaluate_pass_and_fail() {
        let registry = registry_with_failures(3, 100);
        let elapsed = Duration::from_secs(10);

        let ok = ThresholdSpec::new(names::ITERATION_FAILED, "rate<0.05").unwrap();
        let result = ok.evaluate(&registry, elapsed);
        assert_eq!(result.status, ThresholdStatus::Passed);
        assert_eq!(result.observed, Some(0.03));

        let strict = ThresholdSpec::new(names::ITERATION_FAILED, "rate<0.02").unwrap();
        assert!(strict.evaluate(&registry, elapsed).failed());

        let latency = ThresholdSpec::new("order_create_duration", "max<=99").unwrap();
        assert_eq!(latency.evaluate(&registry, elapsed).status, ThresholdStatus::Passed);
    }

    #[test]
    fn test_evaluation_is_idempotent() {
        let registry = registry_with_failures(5, 50);
        let specs = vec![
            ThresholdSpec::new(names::ITERATION_FAILED, "rate<0.05").unwrap(),
            ThresholdSpec::new(names::ITERATION_DURATION, "p(95)<400").unwrap(),
        ];
        let elapsed = Duration::from_secs(5);
        let first = evaluate_all(&specs, &registry, elapsed);
        let second = evaluate_all(&specs, &registry, elapsed);
        assert_eq!(first, second);
        assert_eq!(registry.totals().completed, 50);
    }

    #[test]
    fn test_no_data_does_not_fail() {
        let registry = MetricsRegistry::new(false);
        let spec = ThresholdSpec::new(names::HTTP_REQ_DURATION, "p(95)<800").unwrap();
        let result = spec.evaluate(&registry, Duration::from_secs(1));
        assert_eq!(result.status, ThresholdStatus::NoData);
        assert!(!result.failed());

        let spec = ThresholdSpec::new(names::ITERATION_FAILED, "rate<0.01").unwrap();
        assert_eq!(
            spec.evaluate(&registry, Duration::from_secs(1)).status,
            ThresholdStatus::NoData
        );
    }

    #[test]
    fn test_counter_thresholds() {
        let registry = MetricsRegistry::new(false);
        let spec = ThresholdSpec::new(names::DROPPED_ITERATIONS, "count<1").unwrap();
        let result = spec.evaluate(&registry, Duration::from_secs(1));
        assert_eq!(result.status, ThresholdStatus::Passed);
        assert_eq!(result.observed, Some(0.0));
    }
}
