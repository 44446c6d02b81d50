use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use std::path::PathBuf;

use volley::config::RunFile;
use volley::utils::format_duration;

pub async fn handle_validate(file: PathBuf) -> Result<()> {
    let run_file = RunFile::load(&file)
        .with_context(|| format!("Failed to load run file {}", file.display()))?;
    let engine = run_file
        .build_engine()
        .with_context(|| format!("Invalid run file {}", file.display()))?;

    println!("{} {} is valid", "✔".green().bold(), file.display());
    println!();
    println!("{}", "Executors:".bright_white());
    for spec in engine.executors() {
        let start = if spec.start_time.is_zero() {
            String::new()
        } else {
            format!(", starts at {}", format_duration(spec.start_time))
        };
        println!(
            "  {} ({}): {}, up to {} workers{}",
            spec.name.bold(),
            spec.kind.label().dimmed(),
            format_duration(spec.kind.duration()),
            spec.kind.max_workers(),
            start
        );
    }

    if !engine.thresholds().is_empty() {
        println!();
        println!("{}", "Thresholds:".bright_white());
        for t in engine.thresholds() {
            let abort = if t.abort_on_fail { " (abort on fail)" } else { "" };
            println!("  {} {}{}", t.metric, t.expr, abort);
        }
    }

    let unresolved = run_file.unresolved_vars()?;
    if !unresolved.is_empty() {
        println!();
        for (executor, name) in &unresolved {
            println!(
                "{} {}: {{{{{}}}}} is not defined and will be sent as-is",
                "⚠".yellow(),
                executor,
                name
            );
        }
    }

    println!();
    println!(
        "Planned duration: {}",
        format_duration(engine.planned_duration()).bright_white()
    );
    Ok(())
}
