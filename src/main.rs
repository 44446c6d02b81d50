use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell as CompShell};
use owo_colors::OwoColorize;
use std::path::PathBuf;

mod commands;
mod ui;

use commands::*;

#[derive(Parser)]
#[command(name = "volley")]
#[command(version)]
#[command(about = "Configurable load generation that lives next to your API")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a load test described by a YAML run file
    Run {
        /// Run file
        file: PathBuf,
        /// Write the JSON report to this file or directory
        #[arg(long = "out")]
        out: Option<PathBuf>,
        /// Include every iteration record in the report
        #[arg(long = "retain-records")]
        retain_records: bool,
        /// No progress bar or console summary
        #[arg(short, long = "quiet")]
        quiet: bool,
    },
    /// Check a run file without sending any traffic
    Validate {
        /// Run file
        file: PathBuf,
    },
    /// Generate shell completions (internal)
    #[command(hide = true)]
    Completions {
        /// Shell: bash, zsh, fish
        shell: String,
    },
    /// Generate man page (internal)
    #[command(hide = true)]
    Man,
}

pub fn print_banner() {
    let version = env!("CARGO_PKG_VERSION");
    if atty::is(atty::Stream::Stdout) {
        println!(
            "{} {}  {}",
            "volley".cyan().bold(),
            format!("v{version}").dimmed(),
            "load generation that lives next to your API".dimmed()
        );
    } else {
        println!("volley v{version}");
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if !matches!(cli.command, Commands::Completions { .. } | Commands::Man) {
        init_tracing();
    }
    if matches!(cli.command, Commands::Run { quiet: false, .. }) {
        print_banner();
    }

    match cli.command {
        Commands::Run {
            file,
            out,
            retain_records,
            quiet,
        } => {
            run::handle_run(run::RunOptions {
                file,
                out,
                retain_records,
                quiet,
            })
            .await?;
        }
        Commands::Validate { file } => {
            validate::handle_validate(file).await?;
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            let sh = match shell.as_str() {
                "bash" => CompShell::Bash,
                "zsh" => CompShell::Zsh,
                "fish" => CompShell::Fish,
                "powershell" | "pwsh" => CompShell::PowerShell,
                "elvish" => CompShell::Elvish,
                other => {
                    eprintln!(
                        "Unsupported shell: {} (use bash|zsh|fish|powershell|elvish)",
                        other
                    );
                    std::process::exit(2);
                }
            };
            generate(sh, &mut cmd, name, &mut std::io::stdout());
        }
        Commands::Man => {
            let cmd = Cli::command();
            let man = clap_mangen::Man::new(cmd);
            man.render(&mut std::io::stdout())?;
        }
    }

    Ok(())
}
