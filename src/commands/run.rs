use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use std::path::PathBuf;

use volley::config::RunFile;
use volley::report::RunStatus;
use volley::utils::format_duration;

use crate::ui::progress::track_run;

pub struct RunOptions {
    pub file: PathBuf,
    pub out: Option<PathBuf>,
    pub retain_records: bool,
    pub quiet: bool,
}

pub async fn handle_run(options: RunOptions) -> Result<()> {
    let run_file = RunFile::load(&options.file)
        .with_context(|| format!("Failed to load run file {}", options.file.display()))?;

    let mut engine = run_file
        .build_engine()
        .with_context(|| format!("Invalid run file {}", options.file.display()))?;
    if options.retain_records {
        engine = engine.retain_records(true);
    }

    let planned = engine.planned_duration();
    println!(
        "{} Running {} ({} executor(s), {} threshold(s), {})",
        "→".cyan(),
        engine.options().name.bright_white(),
        engine.executors().len(),
        engine.thresholds().len(),
        format_duration(planned)
    );

    // First Ctrl-C drains gracefully, the second cancels in-flight iterations.
    let control = engine.control();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!(
                "{} Stopping, waiting for in-flight iterations (Ctrl-C again to cancel)",
                "⚠".yellow()
            );
            control.stop();
            if tokio::signal::ctrl_c().await.is_ok() {
                control.cancel();
            }
        }
    });

    let progress = (!options.quiet).then(|| track_run(engine.subscribe(), planned));
    let report = engine.run().await?;
    if let Some(progress) = progress {
        let _ = progress.await;
    }

    if !options.quiet {
        report.print_summary();
    }

    if let Some(out) = &options.out {
        let path = report.write_json(out)?;
        println!("{} Report saved to {}", "✔".green(), path.display());
    }

    match report.status {
        RunStatus::Passed => {
            println!("{} Run passed in {}", "✔".green().bold(), format_duration(report.duration));
            Ok(())
        }
        RunStatus::Failed => {
            let crossed: Vec<String> = report
                .thresholds
                .iter()
                .filter(|t| t.failed())
                .map(|t| format!("{} {}", t.metric, t.expression))
                .collect();
            if crossed.is_empty() {
                anyhow::bail!("Run failed: aborted before completion");
            }
            anyhow::bail!("Run failed: thresholds crossed: {}", crossed.join(", "))
        }
    }
}
