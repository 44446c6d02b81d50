//! Built-in iteration that runs a list of HTTP requests.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;
use tokio::time::Instant;
use url::Url;

use crate::engine::iteration::{Iteration, Observation};
use crate::engine::metrics::names;
use crate::error::IterationError;
use crate::variables::VariableContext;

pub fn build_client(timeout: Duration, insecure: bool) -> Result<Client> {
    let mut builder = Client::builder()
        .timeout(timeout)
        .user_agent(concat!("volley/", env!("CARGO_PKG_VERSION")));

    if insecure {
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder.build().context("Failed to create HTTP client")
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepBody {
    /// String leaves are templated; a leaf that is exactly one `{{VAR}}`
    /// becomes a number or boolean when the value parses as one.
    Json(Value),
    Raw(String),
}

/// One request of an HTTP iteration.
#[derive(Debug, Clone)]
pub struct HttpStep {
    pub name: String,
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<StepBody>,
    /// Statuses that pass the step's check. Empty means any status below 400.
    pub expect_status: Vec<u16>,
    /// Pause after the request, whatever its outcome.
    pub think_time: Duration,
    /// Extra trend fed with this step's duration.
    pub trend: Option<String>,
    /// Extra rate fed with `status >= 400` for this step.
    pub fail_rate: Option<String>,
}

impl HttpStep {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            name: format!("{method} {url}"),
            method,
            url,
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
            expect_status: Vec::new(),
            think_time: Duration::ZERO,
            trend: None,
            fail_rate: None,
        }
    }

    fn status_ok(&self, status: u16) -> bool {
        if self.expect_status.is_empty() {
            status < 400
        } else {
            self.expect_status.contains(&status)
        }
    }
}

pub struct HttpIteration {
    client: Client,
    steps: Arc<[HttpStep]>,
    vars: Arc<VariableContext>,
}

impl HttpIteration {
    pub fn new(client: Client, steps: Vec<HttpStep>, vars: Arc<VariableContext>) -> Self {
        Self {
            client,
            steps: steps.into(),
            vars,
        }
    }

    fn build_request(&self, step: &HttpStep) -> Result<reqwest::RequestBuilder> {
        let url_str = self.vars.substitute(&step.url);
        let mut url = Url::parse(&url_str).with_context(|| format!("Invalid URL: {}", url_str))?;

        if !step.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &step.query {
                pairs.append_pair(&self.vars.substitute(key), &self.vars.substitute(value));
            }
        }

        let mut req = self.client.request(step.method.clone(), url);
        for (key, value) in &step.headers {
            req = req.header(self.vars.substitute(key), self.vars.substitute(value));
        }

        match &step.body {
            Some(StepBody::Json(value)) => req = req.json(&render_json(value, &self.vars)),
            Some(StepBody::Raw(text)) => req = req.body(self.vars.substitute(text)),
            None => {}
        }
        Ok(req)
    }
}

#[async_trait]
impl Iteration for HttpIteration {
    async fn run(&self) -> Result<Vec<Observation>, IterationError> {
        let mut observations = Vec::with_capacity(self.steps.len() * 4);
        let mut failures = Vec::new();

        for step in self.steps.iter() {
            let request = self
                .build_request(step)
                .map_err(|err| IterationError::from(err).with_observations(observations.clone()))?;

            let start = Instant::now();
            let sent = request.send().await;
            let elapsed = start.elapsed();

            observations.push(Observation::counter(names::HTTP_REQS, 1.0));
            observations.push(Observation::duration(names::HTTP_REQ_DURATION, elapsed));
            if let Some(trend) = &step.trend {
                observations.push(Observation::duration(trend.clone(), elapsed));
            }

            let response = match sent {
                Ok(response) => response,
                Err(err) => {
                    observations.push(Observation::rate(names::HTTP_REQ_FAILED, true));
                    observations.push(Observation::rate(names::CHECKS, false));
                    if let Some(rate) = &step.fail_rate {
                        observations.push(Observation::rate(rate.clone(), true));
                    }
                    return Err(IterationError::new(format!("{}: {}", step.name, err))
                        .with_observations(observations));
                }
            };

            let status = response.status().as_u16();
            // Drain the body so the connection can be reused.
            let _ = response.bytes().await;

            let ok = step.status_ok(status);
            let failed = status >= 400;
            observations.push(Observation::rate(names::HTTP_REQ_FAILED, failed));
            observations.push(Observation::rate(names::CHECKS, ok));
            if let Some(rate) = &step.fail_rate {
                observations.push(Observation::rate(rate.clone(), failed));
            }
            if !ok {
                failures.push(format!("{}: unexpected status {}", step.name, status));
            }

            if !step.think_time.is_zero() {
                tokio::time::sleep(step.think_time).await;
            }
        }

        if failures.is_empty() {
            Ok(observations)
        } else {
            Err(IterationError::new(failures.join("; ")).with_observations(observations))
        }
    }
}

fn render_json(value: &Value, vars: &VariableContext) -> Value {
    match value {
        Value::String(s) => {
            let rendered = vars.substitute(s);
            let whole_template = s.trim().starts_with("{{")
                && s.trim().ends_with("}}")
                && s.matches("{{").count() == 1;
            if whole_template && rendered != *s {
                if let Ok(n) = rendered.parse::<i64>() {
                    return Value::Number(n.into());
                }
                if let Some(n) = rendered
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                {
                    return Value::Number(n);
                }
                if let Ok(b) = rendered.parse::<bool>() {
                    return Value::Bool(b);
                }
            }
            Value::String(rendered)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| render_json(v, vars)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_json(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}
