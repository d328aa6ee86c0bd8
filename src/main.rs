use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use runway::config::RunwayConfig;
use runway::logging::{self, LogOptions};
use runway_common::RunKind;

mod cmd;

#[derive(Parser)]
#[command(name = "runway")]
#[command(version, about = "Durable run orchestrator with approval gates")]
pub struct Cli {
    /// Path to runway.toml (defaults to .runway/runway.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// SQLite database path; overrides the config file and RUNWAY_DB_PATH
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the database and its schema
    InitDb,
    /// Create a run
    Submit {
        #[arg(long)]
        kind: RunKind,
        /// Project id, as configured under [projects]
        #[arg(long)]
        project: String,
        #[arg(long, default_value = "")]
        intent: String,
        /// Execute the run in the foreground after creating it
        #[arg(long)]
        execute: bool,
    },
    /// Execute or resume one run in the foreground, printing its events
    Execute { run_id: String },
    /// Resume every unfinished run and wait for them
    Resume,
    /// Show a run with its steps and approvals
    Status { run_id: String },
    /// List recent runs
    Runs {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// List approval requests
    Approvals {
        /// Only approvals of this run
        #[arg(long)]
        run: Option<String>,
        /// Include resolved approvals
        #[arg(long)]
        all: bool,
    },
    /// Approve a pending approval request
    Approve {
        approval_id: String,
        #[arg(long)]
        by: String,
    },
    /// Reject a pending approval request, canceling its run
    Reject {
        approval_id: String,
        #[arg(long)]
        by: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Request cancellation of a run
    Cancel { run_id: String },
    /// Serve the HTTP API and event websocket
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = RunwayConfig::resolve(cli.config.as_deref())?;
    if let Some(db) = &cli.db {
        config.database.path = db.clone();
    }

    let _log_guard = logging::init(LogOptions {
        verbose: cli.verbose,
        json: cli.log_json,
        dir: config.logging.dir.as_deref(),
    })?;
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }

    match cli.command {
        Commands::InitDb => cmd::cmd_init_db(&config)?,
        Commands::Submit {
            kind,
            project,
            intent,
            execute,
        } => cmd::cmd_submit(&config, kind, &project, &intent, execute).await?,
        Commands::Execute { run_id } => cmd::cmd_execute(&config, &run_id).await?,
        Commands::Resume => cmd::cmd_resume(&config).await?,
        Commands::Status { run_id } => cmd::cmd_status(&config, &run_id).await?,
        Commands::Runs { limit } => cmd::cmd_runs(&config, limit).await?,
        Commands::Approvals { run, all } => {
            cmd::cmd_approvals(&config, run.as_deref(), all).await?
        }
        Commands::Approve { approval_id, by } => {
            cmd::cmd_approve(&config, &approval_id, &by).await?
        }
        Commands::Reject {
            approval_id,
            by,
            reason,
        } => cmd::cmd_reject(&config, &approval_id, &by, reason).await?,
        Commands::Cancel { run_id } => cmd::cmd_cancel(&config, &run_id).await?,
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            cmd::cmd_serve(&config).await?
        }
    }

    Ok(())
}
