//! Maestro CLI - multi-agent task orchestration

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::Colorize;

use maestro::config::EngineConfig;
use maestro::error::{EngineError, FixSuggestion};

#[derive(Parser)]
#[command(name = "maestro")]
#[command(about = "Maestro - orchestrate a task graph across role-bound agents")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a run directory (maestro.yaml + tasks/*.yaml)
    Run {
        /// Path to the run directory
        dir: PathBuf,

        /// Override the configured executor (mock, command)
        #[arg(short, long)]
        executor: Option<String>,

        /// Override the global concurrency cap
        #[arg(short, long)]
        max_parallel: Option<usize>,

        /// State directory (defaults to <dir>/state)
        #[arg(short, long)]
        state_dir: Option<PathBuf>,
    },

    /// Validate task definitions and the dependency graph, then exit
    Validate {
        /// Path to the run directory
        dir: PathBuf,
    },

    /// Print the persisted metrics snapshot for a state directory
    Status {
        /// State directory of a current or finished run
        state_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Run {
            dir,
            executor,
            max_parallel,
            state_dir,
        } => run(dir, executor, max_parallel, state_dir).await,
        Commands::Validate { dir } => validate(dir),
        Commands::Status { state_dir } => status(state_dir),
    };

    std::process::exit(code);
}

fn report(error: &EngineError) {
    eprintln!("{} {}", "Error:".red().bold(), error);
    if let Some(suggestion) = error.fix_suggestion() {
        eprintln!("  {} {}", "Fix:".yellow(), suggestion);
    }
}

async fn run(
    dir: PathBuf,
    executor: Option<String>,
    max_parallel: Option<usize>,
    state_dir: Option<PathBuf>,
) -> i32 {
    let mut config = match EngineConfig::load(&dir) {
        Ok(config) => config,
        Err(e) => {
            report(&e.into());
            return 3;
        }
    };
    if let Some(executor) = executor {
        config.executor = executor;
    }
    if let Some(max_parallel) = max_parallel {
        config.max_parallel = max_parallel;
    }

    let state_dir = state_dir.unwrap_or_else(|| dir.join("state"));

    println!(
        "{} executor: {} | parallel: {} | state: {}",
        "→".cyan(),
        config.executor.cyan().bold(),
        config.max_parallel,
        state_dir.display()
    );

    let scheduler = match maestro::engine::bootstrap(&dir, &state_dir, config.clone()) {
        Ok(scheduler) => scheduler,
        Err(e) => {
            report(&e);
            // Load-time violations are validation failures; anything else is
            // an unrecoverable setup error.
            return match e {
                EngineError::Load(_) | EngineError::Graph(_) | EngineError::Config(_) => 3,
                _ => 3,
            };
        }
    };

    // Ctrl-C cancels the run; the scheduler drains within its window.
    let cancel = scheduler.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{} cancellation requested, draining…", "!".yellow().bold());
            cancel.cancel();
        }
    });

    match scheduler.run().await {
        Ok(outcome) => {
            let line = format!(
                "done={} failed={} cancelled={} of {}",
                outcome.done, outcome.failed, outcome.cancelled, outcome.total
            );
            if outcome.failed == 0 && !outcome.forced_shutdown {
                println!("{} {}", "✓".green().bold(), line);
            } else {
                println!("{} {}", "✗".red().bold(), line);
            }
            outcome.exit_code(&config)
        }
        Err(e) => {
            report(&e);
            3
        }
    }
}

fn validate(dir: PathBuf) -> i32 {
    match maestro::engine::validate_run_dir(&dir) {
        Ok(count) => {
            println!(
                "{} {} task definitions valid, graph is acyclic",
                "✓".green().bold(),
                count
            );
            0
        }
        Err(e) => {
            report(&e);
            3
        }
    }
}

fn status(state_dir: PathBuf) -> i32 {
    match read_snapshot(&state_dir) {
        Ok(raw) => {
            println!("{raw}");
            0
        }
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            3
        }
    }
}

fn read_snapshot(state_dir: &std::path::Path) -> anyhow::Result<String> {
    use anyhow::Context;
    let path = state_dir.join("metrics.json");
    std::fs::read_to_string(&path)
        .with_context(|| format!("no metrics snapshot at {}", path.display()))
}
