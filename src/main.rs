use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

mod cmd;

#[derive(Parser)]
#[command(name = "foundry")]
#[command(version, about = "Turn tracked issues into pull requests with AI coding agents")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize .foundry/ with a default foundry.toml and database
    Init {
        /// Overwrite an existing foundry.toml with defaults
        #[arg(long)]
        force: bool,
    },
    /// Add a card
    Add {
        title: String,

        #[arg(short, long, default_value = "")]
        description: String,

        /// Create the card as ready instead of draft
        #[arg(long)]
        ready: bool,
    },
    /// Mark a card ready for the worker pool
    Ready { card: i64 },
    /// Run the worker pool and sync scheduler until Ctrl-C
    Run {
        /// Override workers.max_workers (clamped to 1-8)
        #[arg(long)]
        max_workers: Option<usize>,

        /// Do not start the sync scheduler
        #[arg(long)]
        no_sync: bool,
    },
    /// Show slots, cards and recent jobs
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Cancel a queued or running job
    Cancel { job: i64 },
    /// Remove worktrees whose cleanup delay has elapsed
    Cleanup,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

/// Console logging to stderr plus a daily JSON-lines log file once
/// `.foundry/logs` exists. The returned guard flushes the file writer on drop.
fn init_logging(verbose: bool, project_dir: &Path) -> Option<WorkerGuard> {
    let default = if verbose { "debug" } else { "info" };
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter());

    let log_dir = project_dir.join(".foundry").join("logs");
    if log_dir.is_dir() {
        let appender = tracing_appender::rolling::daily(&log_dir, "foundry.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let file = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .with_ansi(false)
            .with_filter(filter());
        tracing_subscriber::registry().with(console).with(file).init();
        Some(guard)
    } else {
        tracing_subscriber::registry().with(console).init();
        None
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let _log_guard = init_logging(cli.verbose, &project_dir);

    match &cli.command {
        Commands::Init { force } => cmd::cmd_init(&project_dir, *force).await?,
        Commands::Add {
            title,
            description,
            ready,
        } => cmd::cmd_add(&project_dir, title, description, *ready).await?,
        Commands::Ready { card } => cmd::cmd_ready(&project_dir, *card).await?,
        Commands::Run {
            max_workers,
            no_sync,
        } => cmd::cmd_run(project_dir, *max_workers, *no_sync).await?,
        Commands::Status { json } => cmd::cmd_status(&project_dir, *json).await?,
        Commands::Cancel { job } => cmd::cmd_cancel(&project_dir, *job).await?,
        Commands::Cleanup => cmd::cmd_cleanup(&project_dir).await?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
