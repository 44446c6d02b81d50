use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use owo_colors::OwoColorize;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::engine::iteration::{duration_ms, IterationRecord};
use crate::engine::metrics::{ExecutorTally, MetricSummary};
use crate::engine::monitor::AbortCause;
use crate::engine::scheduler::ExecutorStats;
use crate::engine::threshold::{ThresholdResult, ThresholdStatus};
use crate::utils::format_duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Passed,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Passed => write!(f, "PASSED"),
            RunStatus::Failed => write!(f, "FAILED"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSummary {
    pub name: Arc<str>,
    pub kind: String,
    pub scheduled: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub dropped: u64,
    pub max_workers: usize,
    pub allocated_workers: usize,
    pub peak_busy_workers: usize,
    pub interrupted: bool,
}

impl ExecutorSummary {
    pub fn new(stats: &ExecutorStats, tally: ExecutorTally) -> Self {
        Self {
            name: Arc::clone(&stats.name),
            kind: stats.kind.clone(),
            scheduled: stats.scheduled,
            completed: tally.completed,
            failed: tally.failed,
            cancelled: tally.cancelled,
            dropped: tally.dropped,
            max_workers: stats.pool.max_workers,
            allocated_workers: stats.pool.allocated,
            peak_busy_workers: stats.pool.peak_busy,
            interrupted: stats.interrupted,
        }
    }
}

/// Result of a whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub name: String,
    pub started_at: DateTime<Utc>,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub status: RunStatus,
    pub aborted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_cause: Option<AbortCause>,
    pub timed_out: bool,
    pub metrics: IndexMap<String, MetricSummary>,
    pub executors: Vec<ExecutorSummary>,
    pub thresholds: Vec<ThresholdResult>,
    /// Present only when the run retained raw records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records: Option<Vec<IterationRecord>>,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.status == RunStatus::Passed
    }

    pub fn status_for(thresholds: &[ThresholdResult], aborted: bool) -> RunStatus {
        if aborted || thresholds.iter().any(ThresholdResult::failed) {
            RunStatus::Failed
        } else {
            RunStatus::Passed
        }
    }

    /// Write the report as pretty JSON.
    ///
    /// A directory target gets a timestamped file name inside it.
    pub fn write_json(&self, target: &Path) -> Result<PathBuf> {
        let path = if target.is_dir() {
            let timestamp = self.started_at.format("%Y%m%d_%H%M%S");
            target.join(format!("volley_report_{}.json", timestamp))
        } else {
            if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            target.to_path_buf()
        };

        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;

        Ok(path)
    }

    pub fn print_summary(&self) {
        println!();
        println!("{}", "=".repeat(60).dimmed());
        println!("{} {}", "Run".bright_white(), self.name.bold());
        println!("{}", "=".repeat(60).dimmed());
        println!("  Duration: {}", format_duration(self.duration).bright_white());
        if let Some(cause) = &self.abort_cause {
            println!("  {} Aborted: {}", "⚠".yellow(), cause);
        } else if self.aborted {
            println!("  {} Stopped before the schedule ended", "⚠".yellow());
        }
        if self.timed_out {
            println!("  {} Hard timeout reached", "⚠".yellow());
        }

        println!();
        println!("{}", "Executors:".bright_white());
        for e in &self.executors {
            println!(
                "  {} ({}): {} completed, {} failed, {} cancelled, {} dropped, peak {}/{} workers",
                e.name.bold(),
                e.kind.dimmed(),
                e.completed.to_string().green(),
                colored_count(e.failed),
                e.cancelled,
                colored_count(e.dropped),
                e.peak_busy_workers,
                e.max_workers
            );
        }

        println!();
        println!("{}", "Metrics:".bright_white());
        let width = self.metrics.keys().map(|k| k.len()).max().unwrap_or(0);
        for (name, summary) in &self.metrics {
            println!("  {:<width$}  {}", name, format_summary(summary));
        }

        if !self.thresholds.is_empty() {
            println!();
            println!("{}", "Thresholds:".bright_white());
            for t in &self.thresholds {
                let observed = t
                    .observed
                    .map(|v| format!("{v:.3}"))
                    .unwrap_or_else(|| "-".to_string());
                let mark = match t.status {
                    ThresholdStatus::Passed => "✓".green().to_string(),
                    ThresholdStatus::Failed => "✗".red().to_string(),
                    ThresholdStatus::NoData => "·".dimmed().to_string(),
                };
                let note = if t.status == ThresholdStatus::NoData {
                    " (no data)"
                } else {
                    ""
                };
                println!(
                    "  {} {} {} (observed {}){}",
                    mark, t.metric, t.expression, observed, note
                );
            }
        }

        println!();
        match self.status {
            RunStatus::Passed => println!("{} {}", "✅".green(), "PASSED".green().bold()),
            RunStatus::Failed => println!("{} {}", "❌".red(), "FAILED".red().bold()),
        }
        println!("{}", "=".repeat(60).dimmed());
    }
}

fn colored_count(n: u64) -> String {
    if n > 0 {
        n.to_string().red().to_string()
    } else {
        n.to_string()
    }
}

fn opt(v: Option<f64>) -> String {
    v.map(|v| format!("{v:.2}")).unwrap_or_else(|| "-".to_string())
}

fn format_summary(summary: &MetricSummary) -> String {
    match summary {
        MetricSummary::Trend {
            count,
            avg,
            min,
            med,
            max,
            p90,
            p95,
            p99,
        } => format!(
            "avg={} min={} med={} max={} p(90)={} p(95)={} p(99)={} n={}",
            opt(*avg),
            opt(*min),
            opt(*med),
            opt(*max),
            opt(*p90),
            opt(*p95),
            opt(*p99),
            count
        ),
        MetricSummary::Rate {
            rate,
            matches,
            total,
        } => match rate {
            Some(r) => format!("{:.2}% ({} of {})", r * 100.0, matches, total),
            None => "no samples".to_string(),
        },
        MetricSummary::Counter { count, rate } => format!("{} ({:.2}/s)", count, rate),
    }
}
