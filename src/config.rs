//! YAML run files.
//!
//! ```yaml
//! name: storefront
//! vars:
//!   BASE_URL: "${BASE_URL:http://localhost:8000}"
//! executors:
//!   catalog_read:
//!     executor: constant-vus
//!     vus: 20
//!     duration: 2m
//!     requests:
//!       - url: "{{BASE_URL}}/api/store/products/?limit=20"
//!         expect_status: 200
//!         think_time: 1s
//! thresholds:
//!   http_req_failed: ["rate<0.02"]
//!   http_req_duration: ["p(95)<800", { threshold: "p(99)<1200", abort_on_fail: true }]
//! ```
use indexmap::IndexMap;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::executor::{ExecutorKind, ExecutorSpec};
use crate::engine::runner::{Engine, EngineOptions};
use crate::engine::schedule::Stage;
use crate::engine::threshold::ThresholdSpec;
use crate::error::ConfigError;
use crate::http::{build_client, HttpIteration, HttpStep, StepBody};
use crate::utils::{parse_duration, seconds_to_duration};
use crate::variables::VariableContext;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Name given to the executor built from top-level `stages` and `requests`.
pub const DEFAULT_EXECUTOR: &str = "default";

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct RunFile {
    pub name: Option<String>,
    #[serde(default)]
    pub vars: IndexMap<String, String>,
    #[serde(default)]
    pub options: OptionsConfig,
    #[serde(default, alias = "scenarios")]
    pub executors: IndexMap<String, ExecutorConfig>,
    /// Shorthand for a single ramping-concurrency executor.
    #[serde(default)]
    pub stages: Vec<StageConfig>,
    #[serde(default)]
    pub requests: Vec<RequestConfig>,
    #[serde(default)]
    pub thresholds: IndexMap<String, Vec<ThresholdConfig>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct OptionsConfig {
    pub hard_timeout: Option<DurationValue>,
    pub checkpoint_interval: Option<DurationValue>,
    pub max_workers: Option<usize>,
    pub tick: Option<DurationValue>,
    pub request_timeout: Option<DurationValue>,
    #[serde(default)]
    pub insecure: bool,
}

/// `"1m30s"` or a bare number of seconds.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum DurationValue {
    Seconds(f64),
    Text(String),
}

impl DurationValue {
    pub fn to_duration(&self) -> Result<Duration, ConfigError> {
        match self {
            DurationValue::Seconds(s) => seconds_to_duration(*s, &s.to_string()),
            DurationValue::Text(text) => parse_duration(text),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorType {
    #[serde(rename = "fixed-concurrency", alias = "constant-vus")]
    FixedConcurrency,
    #[serde(rename = "ramping-concurrency", alias = "ramping-vus")]
    RampingConcurrency,
    #[serde(rename = "constant-rate", alias = "constant-arrival-rate")]
    ConstantRate,
    #[serde(rename = "ramping-rate", alias = "ramping-arrival-rate")]
    RampingRate,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    pub executor: ExecutorType,
    pub vus: Option<usize>,
    pub duration: Option<DurationValue>,
    pub rate: Option<f64>,
    #[serde(alias = "startRate")]
    pub start_rate: Option<f64>,
    #[serde(alias = "startVUs")]
    pub start_vus: Option<usize>,
    #[serde(alias = "timeUnit")]
    pub time_unit: Option<DurationValue>,
    #[serde(alias = "preAllocatedVUs")]
    pub pre_allocated_vus: Option<usize>,
    #[serde(alias = "maxVUs")]
    pub max_vus: Option<usize>,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
    #[serde(alias = "startTime")]
    pub start_time: Option<DurationValue>,
    #[serde(alias = "gracefulStop")]
    pub graceful_stop: Option<DurationValue>,
    #[serde(default)]
    pub requests: Vec<RequestConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    pub duration: DurationValue,
    pub target: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct RequestConfig {
    pub name: Option<String>,
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub query: IndexMap<String, String>,
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    /// Raw body, templated as text.
    pub body: Option<String>,
    /// JSON body, templated leaf by leaf.
    pub json: Option<serde_json::Value>,
    pub expect_status: Option<StatusExpectation>,
    pub think_time: Option<DurationValue>,
    pub trend: Option<String>,
    pub fail_rate: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum StatusExpectation {
    Number(u16),
    List(Vec<u16>),
}

impl StatusExpectation {
    pub fn codes(&self) -> Vec<u16> {
        match self {
            StatusExpectation::Number(code) => vec![*code],
            StatusExpectation::List(codes) => codes.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum ThresholdConfig {
    Expression(String),
    Detailed {
        threshold: String,
        #[serde(default, alias = "abortOnFail")]
        abort_on_fail: bool,
        #[serde(alias = "delayAbortEval")]
        delay_abort_eval: Option<DurationValue>,
    },
}

impl RunFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn engine_options(&self) -> Result<EngineOptions, ConfigError> {
        let mut options = EngineOptions {
            name: self.name.clone().unwrap_or_else(|| "volley".to_string()),
            ..EngineOptions::default()
        };
        let o = &self.options;
        if let Some(t) = &o.hard_timeout {
            options.hard_timeout = Some(t.to_duration()?);
        }
        if let Some(t) = &o.checkpoint_interval {
            options.checkpoint_interval = t.to_duration()?;
        }
        if let Some(t) = &o.tick {
            options.tick = t.to_duration()?;
        }
        if let Some(n) = o.max_workers {
            options.max_workers = n;
        }
        options.validate()?;
        Ok(options)
    }

    pub fn threshold_specs(&self) -> Result<Vec<ThresholdSpec>, ConfigError> {
        let mut specs = Vec::new();
        for (metric, entries) in &self.thresholds {
            for entry in entries {
                let spec = match entry {
                    ThresholdConfig::Expression(expr) => ThresholdSpec::new(metric.as_str(), expr)?,
                    ThresholdConfig::Detailed {
                        threshold,
                        abort_on_fail,
                        delay_abort_eval,
                    } => {
                        let spec = ThresholdSpec::new(metric.as_str(), threshold)?;
                        if *abort_on_fail {
                            let delay = match delay_abort_eval {
                                Some(d) => d.to_duration()?,
                                None => Duration::ZERO,
                            };
                            spec.abort_on_fail(delay)
                        } else {
                            spec
                        }
                    }
                };
                specs.push(spec);
            }
        }
        Ok(specs)
    }

    fn variables(&self) -> VariableContext {
        VariableContext::new()
            .with_env_vars()
            .with_config_vars(&self.vars)
    }

    /// `{{NAME}}` references in requests that neither `vars` nor the
    /// environment define, as `(executor, name)` pairs.
    pub fn unresolved_vars(&self) -> Result<Vec<(String, String)>, ConfigError> {
        let vars = self.variables();
        let mut missing = Vec::new();
        for (executor, config) in self.executor_configs()? {
            for request in &config.requests {
                let mut texts = vec![request.url.clone()];
                texts.extend(request.query.values().cloned());
                texts.extend(request.headers.values().cloned());
                texts.extend(request.body.clone());
                texts.extend(request.json.as_ref().map(|json| json.to_string()));
                for name in texts.iter().flat_map(|text| vars.unresolved(text)) {
                    if !missing.iter().any(|(e, n)| *e == executor && *n == name) {
                        missing.push((executor.clone(), name));
                    }
                }
            }
        }
        Ok(missing)
    }

    /// Executors in file order, with the top-level shorthand first.
    fn executor_configs(&self) -> Result<Vec<(String, ExecutorConfig)>, ConfigError> {
        let mut configs = Vec::new();
        if !self.stages.is_empty() || !self.requests.is_empty() {
            if self.executors.contains_key(DEFAULT_EXECUTOR) {
                return Err(ConfigError::DuplicateExecutor(DEFAULT_EXECUTOR.to_string()));
            }
            configs.push((
                DEFAULT_EXECUTOR.to_string(),
                ExecutorConfig {
                    executor: ExecutorType::RampingConcurrency,
                    vus: None,
                    duration: None,
                    rate: None,
                    start_rate: None,
                    start_vus: None,
                    time_unit: None,
                    pre_allocated_vus: None,
                    max_vus: None,
                    stages: self.stages.clone(),
                    start_time: None,
                    graceful_stop: None,
                    requests: self.requests.clone(),
                },
            ));
        }
        configs.extend(self.executors.iter().map(|(k, v)| (k.clone(), v.clone())));
        if configs.is_empty() {
            return Err(ConfigError::NoExecutors);
        }
        Ok(configs)
    }

    /// Build a ready-to-run engine: HTTP client, templates, executors and
    /// thresholds.
    pub fn build_engine(&self) -> Result<Engine, ConfigError> {
        let options = self.engine_options()?;

        let timeout = match &self.options.request_timeout {
            Some(t) => t.to_duration()?,
            None => DEFAULT_REQUEST_TIMEOUT,
        };
        let client = build_client(timeout, self.options.insecure).map_err(|err| {
            ConfigError::InvalidOption {
                option: "request_timeout".to_string(),
                reason: format!("{err:#}"),
            }
        })?;
        let vars = Arc::new(self.variables());

        let mut engine = Engine::new(options);
        for (name, config) in self.executor_configs()? {
            let steps = config.steps(&name)?;
            let iteration = Arc::new(HttpIteration::new(client.clone(), steps, Arc::clone(&vars)));
            let mut spec = ExecutorSpec::new(name.as_str(), config.kind(&name)?, iteration);
            if let Some(t) = &config.start_time {
                spec = spec.with_start_time(t.to_duration()?);
            }
            if let Some(t) = &config.graceful_stop {
                spec = spec.with_graceful_stop(t.to_duration()?);
            }
            engine = engine.executor(spec);
        }

        for threshold in self.threshold_specs()? {
            engine = engine.threshold(threshold);
        }

        engine.validate()?;
        Ok(engine)
    }
}

impl ExecutorConfig {
    fn require<T: Copy>(
        value: Option<T>,
        name: &str,
        field: &str,
        kind: ExecutorType,
    ) -> Result<T, ConfigError> {
        value.ok_or_else(|| {
            ConfigError::executor(name, format!("`{field}` is required for {}", kind_label(kind)))
        })
    }

    fn duration_field(&self, name: &str) -> Result<Duration, ConfigError> {
        match &self.duration {
            Some(d) => d.to_duration(),
            None => Err(ConfigError::executor(
                name,
                format!("`duration` is required for {}", kind_label(self.executor)),
            )),
        }
    }

    fn stage_list(&self) -> Result<Vec<Stage>, ConfigError> {
        self.stages
            .iter()
            .map(|s| Ok(Stage::new(s.duration.to_duration()?, s.target)))
            .collect()
    }

    fn time_unit(&self) -> Result<Duration, ConfigError> {
        match &self.time_unit {
            Some(t) => t.to_duration(),
            None => Ok(Duration::from_secs(1)),
        }
    }

    pub fn kind(&self, name: &str) -> Result<ExecutorKind, ConfigError> {
        let kind = self.executor;
        Ok(match kind {
            ExecutorType::FixedConcurrency => ExecutorKind::FixedConcurrency {
                vus: Self::require(self.vus, name, "vus", kind)?,
                duration: self.duration_field(name)?,
            },
            ExecutorType::RampingConcurrency => ExecutorKind::RampingConcurrency {
                start_vus: self.start_vus.unwrap_or(1),
                stages: self.stage_list()?,
            },
            ExecutorType::ConstantRate => {
                let pre_allocated_vus =
                    Self::require(self.pre_allocated_vus, name, "pre_allocated_vus", kind)?;
                ExecutorKind::ConstantRate {
                    rate: Self::require(self.rate, name, "rate", kind)?,
                    time_unit: self.time_unit()?,
                    duration: self.duration_field(name)?,
                    pre_allocated_vus,
                    max_vus: self.max_vus.unwrap_or(pre_allocated_vus),
                }
            }
            ExecutorType::RampingRate => {
                let pre_allocated_vus =
                    Self::require(self.pre_allocated_vus, name, "pre_allocated_vus", kind)?;
                ExecutorKind::RampingRate {
                    start_rate: self.start_rate.unwrap_or(0.0),
                    time_unit: self.time_unit()?,
                    pre_allocated_vus,
                    max_vus: self.max_vus.unwrap_or(pre_allocated_vus),
                    stages: self.stage_list()?,
                }
            }
        })
    }

    pub fn steps(&self, name: &str) -> Result<Vec<HttpStep>, ConfigError> {
        if self.requests.is_empty() {
            return Err(ConfigError::executor(name, "at least one request is required"));
        }
        self.requests
            .iter()
            .enumerate()
            .map(|(i, request)| request.to_step(name, i))
            .collect()
    }
}

fn kind_label(kind: ExecutorType) -> &'static str {
    match kind {
        ExecutorType::FixedConcurrency => "fixed-concurrency",
        ExecutorType::RampingConcurrency => "ramping-concurrency",
        ExecutorType::ConstantRate => "constant-rate",
        ExecutorType::RampingRate => "ramping-rate",
    }
}

impl RequestConfig {
    fn to_step(&self, executor: &str, index: usize) -> Result<HttpStep, ConfigError> {
        let method = Method::from_bytes(self.method.trim().to_uppercase().as_bytes())
            .map_err(|_| {
                ConfigError::executor(
                    executor,
                    format!("request {index}: invalid HTTP method '{}'", self.method),
                )
            })?;

        let body = match (&self.body, &self.json) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::executor(
                    executor,
                    format!("request {index}: set either `body` or `json`, not both"),
                ))
            }
            (Some(raw), None) => Some(StepBody::Raw(raw.clone())),
            (None, Some(json)) => Some(StepBody::Json(json.clone())),
            (None, None) => None,
        };

        let mut headers: Vec<(String, String)> = self.headers.clone().into_iter().collect();
        if matches!(body, Some(StepBody::Json(_)))
            && !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("content-type"))
        {
            headers.push(("Content-Type".to_string(), "application/json".to_string()));
        }

        let mut step = HttpStep::new(method, self.url.clone());
        if let Some(name) = &self.name {
            step.name = name.clone();
        }
        step.query = self.query.clone().into_iter().collect();
        step.headers = headers;
        step.body = body;
        step.expect_status = self
            .expect_status
            .as_ref()
            .map(StatusExpectation::codes)
            .unwrap_or_default();
        step.think_time = match &self.think_time {
            Some(t) => t.to_duration()?,
            None => Duration::ZERO,
        };
        step.trend = self.trend.clone();
        step.fail_rate = self.fail_rate.clone();
        Ok(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIXED: &str = r#"
name: storefront
vars:
  BASE_URL: "http://localhost:8000"
options:
  hard_timeout: 10m
  tick: 100ms
  max_workers: 500
executors:
  catalog_read:
    executor: constant-vus
    vus: 20
    duration: 2m
    requests:
      - url: "{{BASE_URL}}/api/store/products/"
        query: { limit: "20", offset: "0" }
        expect_status: 200
        think_time: 1s
  order_create:
    executor: ramping-arrival-rate
    startRate: 5
    timeUnit: 1s
    preAllocatedVUs: 50
    maxVUs: 200
    stages:
      - { duration: 30s, target: 10 }
      - { duration: 1m, target: 20 }
      - { duration: 30s, target: 0 }
    requests:
      - method: post
        url: "{{BASE_URL}}/api/store/order-requests/"
        json: { user: 1, cart_snapshot: [{ product_id: "{{PRODUCT_ID}}", quantity: 1 }] }
        expect_status: [201]
        trend: order_create_duration
        fail_rate: order_create_fail_rate
        think_time: 0.5
thresholds:
  http_req_failed: ["rate<0.02"]
  http_req_duration:
    - "p(95)<800"
    - { threshold: "p(99)<1200", abort_on_fail: true, delay_abort_eval: 10s }
"#;

    #[test]
    fn test_parse_mixed_scenarios() {
        let file = RunFile::parse(MIXED).unwrap();
        assert_eq!(file.name.as_deref(), Some("storefront"));
        assert_eq!(
            file.executors.keys().collect::<Vec<_>>(),
            vec!["catalog_read", "order_create"]
        );

        let catalog = &file.executors["catalog_read"];
        assert_eq!(catalog.executor, ExecutorType::FixedConcurrency);
        assert_eq!(
            catalog.kind("catalog_read").unwrap(),
            ExecutorKind::FixedConcurrency {
                vus: 20,
                duration: Duration::from_secs(120)
            }
        );

        let orders = &file.executors["order_create"];
        match orders.kind("order_create").unwrap() {
            ExecutorKind::RampingRate {
                start_rate,
                pre_allocated_vus,
                max_vus,
                stages,
                ..
            } => {
                assert_eq!(start_rate, 5.0);
                assert_eq!(pre_allocated_vus, 50);
                assert_eq!(max_vus, 200);
                assert_eq!(stages.len(), 3);
                assert_eq!(stages[1].duration, Duration::from_secs(60));
            }
            other => panic!("unexpected kind {other:?}"),
        }

        let steps = orders.steps("order_create").unwrap();
        assert_eq!(steps[0].method, Method::POST);
        assert_eq!(steps[0].expect_status, vec![201]);
        assert_eq!(steps[0].think_time, Duration::from_millis(500));
        assert!(steps[0]
            .headers
            .iter()
            .any(|(k, v)| k == "Content-Type" && v == "application/json"));
    }

    #[test]
    fn test_thresholds_and_options() {
        let file = RunFile::parse(MIXED).unwrap();
        let specs = file.threshold_specs().unwrap();
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[0].metric, "http_req_failed");
        assert!(!specs[1].abort_on_fail);
        assert!(specs[2].abort_on_fail);
        assert_eq!(specs[2].delay_abort_eval, Duration::from_secs(10));

        let options = file.engine_options().unwrap();
        assert_eq!(options.name, "storefront");
        assert_eq!(options.hard_timeout, Some(Duration::from_secs(600)));
        assert_eq!(options.tick, Duration::from_millis(100));
        assert_eq!(options.max_workers, 500);
    }

    #[test]
    fn test_build_engine() {
        let engine = RunFile::parse(MIXED).unwrap().build_engine().unwrap();
        assert_eq!(engine.executors().len(), 2);
        assert_eq!(engine.thresholds().len(), 3);
        assert_eq!(engine.planned_duration(), Duration::from_secs(120));
    }

    #[test]
    fn test_top_level_stages_shorthand() {
        let yaml = r#"
stages:
  - { duration: 30s, target: 10 }
  - { duration: 1m, target: 30 }
requests:
  - url: "http://localhost:8000/api/store/order-requests/"
    method: POST
    body: '{"user": 1}'
"#;
        let file = RunFile::parse(yaml).unwrap();
        let configs = file.executor_configs().unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].0, DEFAULT_EXECUTOR);
        match configs[0].1.kind(DEFAULT_EXECUTOR).unwrap() {
            ExecutorKind::RampingConcurrency { start_vus, stages } => {
                assert_eq!(start_vus, 1);
                assert_eq!(stages[1].target, 30.0);
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn test_missing_fields_are_config_errors() {
        let yaml = r#"
executors:
  broken:
    executor: constant-arrival-rate
    rate: 10
    duration: 1m
    requests: [{ url: "http://localhost/" }]
"#;
        let err = RunFile::parse(yaml).unwrap().build_engine().unwrap_err();
        assert!(err.to_string().contains("pre_allocated_vus"));

        let yaml = r#"
executors:
  empty:
    executor: constant-vus
    vus: 1
    duration: 1s
"#;
        let err = RunFile::parse(yaml).unwrap().build_engine().unwrap_err();
        assert!(err.to_string().contains("at least one request"));
    }

    #[test]
    fn test_unknown_executor_type_is_rejected() {
        let yaml = r#"
executors:
  x:
    executor: shared-iterations
    requests: [{ url: "http://localhost/" }]
"#;
        assert!(matches!(RunFile::parse(yaml), Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn test_huge_durations_are_config_errors() {
        let yaml = r#"
executors:
  forever:
    executor: fixed-concurrency
    vus: 1
    duration: 1e30
    requests: [{ url: "http://localhost/" }]
"#;
        let err = RunFile::parse(yaml).unwrap().build_engine().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDuration(_)), "{err}");

        let yaml = r#"
executors:
  late:
    executor: fixed-concurrency
    vus: 1
    duration: 1s
    start_time: 10000000000000000000
    requests: [{ url: "http://localhost/" }]
"#;
        let err = RunFile::parse(yaml).unwrap().build_engine().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidExecutor { .. }), "{err}");
    }

    #[test]
    fn test_unresolved_vars_are_listed_once() {
        let yaml = r#"
vars:
  BASE_URL: "http://localhost:8000"
requests:
  - url: "{{BASE_URL}}/api/store/products/{{VOLLEY_TEST_NO_PRODUCT}}/"
    headers: { Authorization: "Bearer {{VOLLEY_TEST_NO_TOKEN}}" }
    json: { product_id: "{{VOLLEY_TEST_NO_PRODUCT}}", quantity: "{{randint:1:50}}" }
stages: [{ duration: 1s, target: 1 }]
"#;
        let missing = RunFile::parse(yaml).unwrap().unresolved_vars().unwrap();
        assert_eq!(
            missing,
            vec![
                ("default".to_string(), "VOLLEY_TEST_NO_PRODUCT".to_string()),
                ("default".to_string(), "VOLLEY_TEST_NO_TOKEN".to_string()),
            ]
        );
    }

    #[test]
    fn test_no_executors() {
        let file = RunFile::parse("name: empty\n").unwrap();
        assert!(matches!(file.build_engine(), Err(ConfigError::NoExecutors)));
    }

    #[test]
    fn test_bad_threshold_is_rejected() {
        let yaml = r#"
requests: [{ url: "http://localhost/" }]
stages: [{ duration: 1s, target: 1 }]
thresholds:
  http_req_failed: ["p(95)<3"]
"#;
        let err = RunFile::parse(yaml).unwrap().build_engine().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidThreshold { .. }));
    }
}
