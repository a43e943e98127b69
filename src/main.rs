use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use cutover::config::{CutoverConfig, LogFormat};
use cutover::ui::UiMode;

mod cmd;

#[derive(Parser)]
#[command(name = "cutover")]
#[command(version, about = "Migration and deployment execution engine")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Process log format on stderr (pretty or json). Overrides cutover.toml.
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a plan with live progress
    Run {
        /// Plan file (.yaml, .yml or .json)
        plan: PathBuf,
        /// Maximum phases running at once
        #[arg(long, env = "CUTOVER_MAX_PARALLEL")]
        max_parallel: Option<usize>,
        /// Roll back automatically when the execution fails
        #[arg(long)]
        auto_rollback: bool,
        /// Progress display: full, minimal or json
        #[arg(long, default_value = "full")]
        ui: UiMode,
        /// Stream every update as a JSON line (same as --ui json)
        #[arg(long)]
        json: bool,
    },
    /// Validate a plan and preview its execution waves
    Validate {
        /// Plan file (.yaml, .yml or .json)
        plan: PathBuf,
    },
    /// Serve the HTTP API and WebSocket feed
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Permissive CORS for a locally served dashboard
        #[arg(long)]
        dev: bool,
    },
    /// List recorded executions, newest first
    History {
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Show one execution in detail
    Show {
        /// Execution id or a unique prefix of one
        id: String,
        /// Print the full record as JSON
        #[arg(long)]
        json: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default cutover.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let max_parallel = match &cli.command {
        Commands::Run { max_parallel, .. } => *max_parallel,
        _ => None,
    };
    let mut config = CutoverConfig::with_cli_args(project_dir, cli.verbose, max_parallel)?;
    if let Some(format) = cli.log_format {
        config.toml.logging.format = format;
    }
    let _log_guard = cutover::logging::init(
        &config.toml.logging,
        config.log_dir().as_deref(),
        cli.verbose,
    )?;

    match &cli.command {
        Commands::Run {
            plan,
            max_parallel,
            auto_rollback,
            ui,
            json,
        } => {
            let options = cmd::RunOptions {
                plan: plan.clone(),
                max_parallel: *max_parallel,
                auto_rollback: *auto_rollback,
                ui: if *json { UiMode::Json } else { *ui },
            };
            cmd::cmd_run(&config, options).await?;
        }
        Commands::Validate { plan } => cmd::cmd_validate(&config, plan)?,
        Commands::Serve { host, port, dev } => {
            cmd::cmd_serve(&config, host.clone(), *port, *dev).await?;
        }
        Commands::History { limit } => cmd::cmd_history(&config, *limit).await?,
        Commands::Show { id, json } => cmd::cmd_show(&config, id, *json).await?,
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
    }

    Ok(())
}
