//! Orchestra CLI - compile, run and inspect goal-driven plans
//!
//! This CLI lets developers exercise the engine from a terminal:
//! - Dry-run the compiler and print the execution waves of a plan
//! - Run a goal against scripted demo capabilities, streaming lifecycle events
//! - Resume an interrupted run from its snapshot
//! - Inspect a snapshot file

use clap::{Parser, Subcommand};
use orchestra_engine::EngineConfig;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod demo;
mod output;

use output::OutputFormat;

/// Orchestra CLI application
#[derive(Parser)]
#[command(name = "orchestra")]
#[command(about = "Orchestra - Goal-driven workflow orchestration", long_about = None)]
#[command(version)]
struct Cli {
    /// Engine configuration file path
    #[arg(short, long, env = "ORCHESTRA_CONFIG")]
    config: Option<String>,

    /// Log level
    #[arg(long, env = "ORCHESTRA_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long, env = "ORCHESTRA_LOG_JSON")]
    json_logs: bool,

    /// Output format (table, json)
    #[arg(short, long, default_value = "table")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands
#[derive(Subcommand)]
enum Commands {
    /// Compile a goal and print the plan without running it
    Plan {
        /// Catalog file: step templates and demo capabilities
        #[arg(long)]
        catalog: PathBuf,

        /// Goal file
        #[arg(long)]
        goal: PathBuf,
    },

    /// Compile and execute a goal
    Run {
        /// Catalog file: step templates and demo capabilities
        #[arg(long)]
        catalog: PathBuf,

        /// Goal file
        #[arg(long, required_unless_present = "resume")]
        goal: Option<PathBuf>,

        /// Directory where plan snapshots are written
        #[arg(long, env = "ORCHESTRA_SNAPSHOT_DIR")]
        snapshot_dir: Option<PathBuf>,

        /// Resume the plan with this id from the snapshot directory
        #[arg(long, requires = "snapshot_dir")]
        resume: Option<String>,
    },

    /// Print step statuses and blackboard versions from a snapshot file
    Inspect {
        /// Snapshot file
        snapshot: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing; stdout is reserved for command output
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| cli.log_level.clone().into());

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    match cli.command {
        Commands::Plan { catalog, goal } => {
            let config = load_config(cli.config.as_deref())?;
            commands::plan::execute(&catalog, &goal, config, cli.output)
        }
        Commands::Run {
            catalog,
            goal,
            snapshot_dir,
            resume,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let args = commands::run::RunArgs {
                catalog,
                goal,
                snapshot_dir,
                resume,
            };
            commands::run::execute(args, config, cli.output).await
        }
        Commands::Inspect { snapshot } => commands::inspect::execute(&snapshot, cli.output).await,
    }
}

fn load_config(path: Option<&str>) -> anyhow::Result<EngineConfig> {
    use anyhow::Context;

    EngineConfig::load(path).context("loading engine configuration")
}
