use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use volley::engine::{Checkpoint, RunPhase};

pub fn create_progress_bar(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("▕{bar:25}▏ {percent:>3}% • {elapsed_precise} • {wide_msg}")
            .expect("Invalid progress template")
            .progress_chars("█░ "),
    );
    pb
}

fn describe(checkpoint: &Checkpoint) -> String {
    let mut msg = format!(
        "{} it • {:.1} it/s",
        checkpoint.totals.completed, checkpoint.iterations_per_sec
    );
    if let Some(p95) = checkpoint.p95_iteration_ms {
        msg.push_str(&format!(" • p95 {:.0}ms", p95));
    }
    if checkpoint.totals.failed > 0 {
        msg.push_str(&format!(" • {} failed", checkpoint.totals.failed));
    }
    if checkpoint.totals.dropped > 0 {
        msg.push_str(&format!(" • {} dropped", checkpoint.totals.dropped));
    }
    let crossed = checkpoint.thresholds.iter().filter(|t| t.failed()).count();
    if crossed > 0 {
        msg.push_str(&format!(" • {} threshold(s) crossed", crossed));
    }
    if checkpoint.phase == Some(RunPhase::Draining) {
        msg.push_str(" • draining");
    }
    msg
}

/// Drive a progress bar from run checkpoints until the run completes.
pub fn track_run(
    mut checkpoints: watch::Receiver<Checkpoint>,
    planned: Duration,
) -> JoinHandle<()> {
    let pb = create_progress_bar(planned.as_millis().max(1) as u64);
    tokio::spawn(async move {
        while checkpoints.changed().await.is_ok() {
            let checkpoint = checkpoints.borrow_and_update().clone();
            pb.set_position(checkpoint.elapsed.as_millis() as u64);
            pb.set_message(describe(&checkpoint));
            if checkpoint.phase == Some(RunPhase::Completed) {
                break;
            }
        }
        pb.finish_and_clear();
    })
}
