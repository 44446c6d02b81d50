use anyhow::Result;
use mockito::{Matcher, Server};
use serde_json::json;
use std::fs;
use tempfile::TempDir;
use tokio::net::TcpListener;

use volley::config::RunFile;
use volley::engine::{names, MetricSummary, ThresholdStatus};
use volley::{ConfigError, RunStatus};

fn write_run_file(dir: &TempDir, content: &str) -> Result<std::path::PathBuf> {
    let path = dir.path().join("volley.yaml");
    fs::write(&path, content)?;
    Ok(path)
}

fn rate(report: &volley::RunReport, metric: &str) -> (Option<f64>, u64) {
    match &report.metrics[metric] {
        MetricSummary::Rate { rate, total, .. } => (*rate, *total),
        other => panic!("{metric} is not a rate: {other:?}"),
    }
}

fn threshold_status(report: &volley::RunReport, metric: &str) -> ThresholdStatus {
    report
        .thresholds
        .iter()
        .find(|t| t.metric == metric)
        .map(|t| t.status)
        .unwrap_or_else(|| panic!("no threshold on {metric}"))
}

#[tokio::test]
async fn test_run_file_against_store_api() -> Result<()> {
    let mut server = Server::new_async().await;
    let products = server
        .mock("GET", "/api/store/products/")
        .match_query(Matcher::UrlEncoded("limit".into(), "20".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"count": 1}"#)
        .expect_at_least(2)
        .create_async()
        .await;
    let orders = server
        .mock("POST", "/api/store/order-requests/")
        .match_body(Matcher::Json(json!({
            "cart_snapshot": [{"product_id": 7, "quantity": 1}]
        })))
        .with_status(201)
        .with_body(r#"{"id": 1}"#)
        .expect(5)
        .create_async()
        .await;

    let temp_dir = TempDir::new()?;
    let path = write_run_file(
        &temp_dir,
        &format!(
            r#"
name: storefront
vars:
  BASE_URL: "{}"
  PRODUCT_ID: "7"
executors:
  catalog_read:
    executor: constant-vus
    vus: 2
    duration: 1s
    requests:
      - url: "{{{{BASE_URL}}}}/api/store/products/"
        query: {{ limit: "20" }}
        expect_status: 200
        think_time: 100ms
  order_create:
    executor: constant-arrival-rate
    rate: 5
    duration: 1s
    preAllocatedVUs: 2
    requests:
      - name: create order
        method: POST
        url: "{{{{BASE_URL}}}}/api/store/order-requests/"
        json:
          cart_snapshot: [{{ product_id: "{{{{PRODUCT_ID}}}}", quantity: 1 }}]
        expect_status: 201
        trend: order_create_duration
        fail_rate: order_create_failed
thresholds:
  http_req_failed: ["rate<0.01"]
  checks: ["rate>0.99"]
  order_create_duration: ["p(95)<5000"]
  order_create_failed: ["rate==0"]
"#,
            server.url()
        ),
    )?;

    let engine = RunFile::load(&path)?.build_engine()?;
    let report = engine.retain_records(true).run().await?;

    products.assert_async().await;
    orders.assert_async().await;

    assert_eq!(report.name, "storefront");
    assert_eq!(report.status, RunStatus::Passed, "{:#?}", report.thresholds);
    assert!(report
        .thresholds
        .iter()
        .all(|t| t.status == ThresholdStatus::Passed));

    let order_summary = report
        .executors
        .iter()
        .find(|e| &*e.name == "order_create")
        .expect("order executor summary");
    assert_eq!(order_summary.scheduled, 5);
    assert_eq!(order_summary.completed, 5);

    match &report.metrics["order_create_duration"] {
        MetricSummary::Trend { count, .. } => assert_eq!(*count, 5),
        other => panic!("unexpected summary {other:?}"),
    }
    let (failed, total) = rate(&report, names::HTTP_REQ_FAILED);
    assert_eq!(failed, Some(0.0));
    assert!(total > 5);

    let out = report.write_json(temp_dir.path())?;
    let written: serde_json::Value = serde_json::from_str(&fs::read_to_string(out)?)?;
    assert_eq!(written["status"], "PASSED");
    assert_eq!(
        written["records"].as_array().map(Vec::len),
        report.records.as_ref().map(Vec::len)
    );
    Ok(())
}

#[tokio::test]
async fn test_random_templates_reach_the_wire() -> Result<()> {
    let mut server = Server::new_async().await;
    let stock = server
        .mock("PATCH", Matcher::Regex(r"^/api/store/products/[123]/$".to_string()))
        .match_body(Matcher::Regex(r#"^\{"stock":([1-9]|[1-4][0-9]|50)\}$"#.to_string()))
        .with_status(200)
        .expect(4)
        .create_async()
        .await;

    let temp_dir = TempDir::new()?;
    let path = write_run_file(
        &temp_dir,
        &format!(
            r#"
vars:
  PRODUCT_IDS: "1,2,3"
executors:
  restock:
    executor: constant-rate
    rate: 4
    duration: 1s
    pre_allocated_vus: 2
    requests:
      - method: PATCH
        url: "{}/api/store/products/{{{{random:PRODUCT_IDS}}}}/"
        json: {{ stock: "{{{{randint:1:50}}}}" }}
        expect_status: 200
thresholds:
  checks: ["rate==1"]
"#,
            server.url()
        ),
    )?;

    let report = RunFile::load(&path)?.build_engine()?.run().await?;

    stock.assert_async().await;
    assert_eq!(report.status, RunStatus::Passed, "{:#?}", report.thresholds);
    Ok(())
}

#[tokio::test]
async fn test_unavailable_endpoint_fails_thresholds() -> Result<()> {
    let mut server = Server::new_async().await;
    let unavailable = server
        .mock("GET", "/api/store/unavailable/")
        .with_status(503)
        .with_body(r#"{"detail": "unavailable"}"#)
        .expect_at_least(1)
        .create_async()
        .await;
    let products = server
        .mock("GET", "/api/store/products/")
        .with_status(200)
        .expect_at_least(1)
        .create_async()
        .await;

    let temp_dir = TempDir::new()?;
    let path = write_run_file(
        &temp_dir,
        &format!(
            r#"
executors:
  flaky:
    executor: fixed-concurrency
    vus: 1
    duration: 500ms
    requests:
      - url: "{base}/api/store/unavailable/"
        expect_status: [200, 204]
      - url: "{base}/api/store/products/"
        think_time: 50ms
thresholds:
  http_req_failed: ["rate<0.1"]
"#,
            base = server.url()
        ),
    )?;

    let report = RunFile::load(&path)?.build_engine()?.run().await?;

    unavailable.assert_async().await;
    products.assert_async().await;

    // Every iteration fails its first request but still runs the second.
    let (failed, total) = rate(&report, names::HTTP_REQ_FAILED);
    assert_eq!(failed, Some(0.5));
    assert!(total >= 2);
    assert_eq!(rate(&report, names::ITERATION_FAILED).0, Some(1.0));
    assert_eq!(report.thresholds[0].status, ThresholdStatus::Failed);
    assert_eq!(report.status, RunStatus::Failed);
    assert!(!report.passed());
    Ok(())
}

/// A 200 where 201 is expected is a failed check, not a failed request.
#[tokio::test]
async fn test_unexpected_success_status_only_fails_checks() -> Result<()> {
    let mut server = Server::new_async().await;
    let orders = server
        .mock("POST", "/api/store/order-requests/")
        .with_status(200)
        .with_body(r#"{"id": 1}"#)
        .expect(3)
        .create_async()
        .await;

    let temp_dir = TempDir::new()?;
    let path = write_run_file(
        &temp_dir,
        &format!(
            r#"
executors:
  order_create:
    executor: constant-rate
    rate: 3
    duration: 1s
    pre_allocated_vus: 1
    max_vus: 3
    requests:
      - method: POST
        url: "{}/api/store/order-requests/"
        json: {{ user: 1 }}
        expect_status: 201
thresholds:
  http_req_failed: ["rate<0.01"]
  checks: ["rate>0.99"]
"#,
            server.url()
        ),
    )?;

    let report = RunFile::load(&path)?.build_engine()?.run().await?;

    orders.assert_async().await;
    assert_eq!(rate(&report, names::HTTP_REQ_FAILED), (Some(0.0), 3));
    assert_eq!(rate(&report, names::CHECKS), (Some(0.0), 3));
    assert_eq!(rate(&report, names::ITERATION_FAILED), (Some(1.0), 3));
    assert_eq!(threshold_status(&report, names::HTTP_REQ_FAILED), ThresholdStatus::Passed);
    assert_eq!(threshold_status(&report, names::CHECKS), ThresholdStatus::Failed);
    assert_eq!(report.status, RunStatus::Failed);
    Ok(())
}

#[tokio::test]
async fn test_connection_refused_is_an_iteration_failure() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let base = format!("http://{}", listener.local_addr()?);
    drop(listener);

    let temp_dir = TempDir::new()?;
    let path = write_run_file(
        &temp_dir,
        &format!(
            r#"
options:
  request_timeout: 2s
executors:
  down:
    executor: constant-rate
    rate: 4
    duration: 500ms
    pre_allocated_vus: 2
    requests:
      - url: "{base}/api/store/products/"
      - url: "{base}/api/store/order-requests/"
        method: POST
"#
        ),
    )?;

    let report = RunFile::load(&path)?.build_engine()?.run().await?;

    // The transport error ends the iteration at its first request.
    let (failed, total) = rate(&report, names::HTTP_REQ_FAILED);
    assert_eq!(failed, Some(1.0));
    assert_eq!(total, 2);
    assert_eq!(rate(&report, names::ITERATION_FAILED), (Some(1.0), 2));
    assert_eq!(report.status, RunStatus::Passed);
    Ok(())
}

#[test]
fn test_load_reports_bad_files() -> Result<()> {
    let temp_dir = TempDir::new()?;

    let missing = RunFile::load(&temp_dir.path().join("missing.yaml")).unwrap_err();
    assert!(matches!(missing, ConfigError::Io(_)));

    let path = write_run_file(
        &temp_dir,
        r#"
executors:
  orders:
    executor: ramping-arrival-rate
    preAllocatedVUs: 10
    maxVUs: 5
    stages:
      - { duration: 10s, target: 5 }
    requests:
      - url: "http://localhost:8000/api/store/order-requests/"
"#,
    )?;
    let err = RunFile::load(&path)?.build_engine().unwrap_err();
    assert!(err.to_string().contains("max_vus"), "{err}");

    let path = write_run_file(
        &temp_dir,
        r#"
executors:
  a:
    executor: fixed-concurrency
    vus: 1
    duration: 1s
    requests: []
"#,
    )?;
    let err = RunFile::load(&path)?.build_engine().unwrap_err();
    assert!(err.to_string().contains("at least one request"), "{err}");
    Ok(())
}
