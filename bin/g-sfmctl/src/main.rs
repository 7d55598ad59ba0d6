//! ---
//! sfm_section: "03-operator-cli"
//! sfm_subsection: "binary"
//! sfm_type: "source"
//! sfm_scope: "code"
//! sfm_description: "Operator CLI driving fleet backup, update, shutdown, and start runs."
//! sfm_version: "v0.0.0-prealpha"
//! sfm_owner: "tbd"
//! ---
//! Scheduler-facing entrypoint. Every run finishes with a stable exit code
//! taken from the run's outcome, so cron/systemd units and monitoring can
//! key off the code without parsing logs.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use g_sfm_common::config::GlobalConfig;
use g_sfm_common::logging::init_tracing;
use g_sfm_engine::{CommandAdapter, FleetContext, OperationKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    disable_version_flag = true,
    about = "Game server fleet manager control utility",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(
        short = 'V',
        long = "version",
        action = ArgAction::SetTrue,
        help = "Print version information and exit"
    )]
    version: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Back up every backup-enabled profile")]
    AutoBackup,
    #[command(about = "Refresh caches and roll updates across the fleet")]
    AutoUpdate,
    #[command(about = "Scheduled shutdown of one profile, honouring its enable flag and grace period")]
    AutoShutdown {
        profile: String,
        #[arg(long, help = "Restart the server after it stopped")]
        restart: bool,
    },
    #[command(about = "Update every profile tracking one release branch")]
    BranchUpdate { branch: String },
    #[command(about = "Back up one profile now")]
    Backup { profile: String },
    #[command(about = "Refresh caches and update one profile now")]
    Update { profile: String },
    #[command(about = "Graceful shutdown of one profile")]
    Shutdown {
        profile: String,
        #[arg(long, help = "Restart the server after it stopped")]
        restart: bool,
    },
    #[command(about = "Immediate stop of one profile, no countdown")]
    Stop { profile: String },
    #[command(about = "Start one profile's server")]
    Start { profile: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.version {
        println!("g-sfmctl {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/g-sfm.toml"));
    candidates.push(PathBuf::from("g-sfm.toml"));

    let loaded = GlobalConfig::load_with_source(&candidates)?;
    let config = loaded.config;
    init_tracing("g-sfmctl", &config.logging)?;
    info!(config_path = %loaded.source.display(), "configuration loaded");

    let cancel = CancellationToken::new();
    let context = Arc::new(FleetContext::new(config).with_cancellation(cancel.clone()));
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling the run");
            cancel.cancel();
        }
    });

    let adapter = CommandAdapter::new(context.clone());
    let outcome = match cli.command {
        Commands::AutoBackup => context.run_auto_backup().await,
        Commands::AutoUpdate => context.run_auto_update().await,
        Commands::AutoShutdown { profile, restart } => {
            let kind = if restart {
                OperationKind::Restart
            } else {
                OperationKind::Shutdown
            };
            context.run_auto_shutdown(&profile, kind, true).await
        }
        Commands::BranchUpdate { branch } => context.run_branch_update(&branch).await,
        Commands::Backup { profile } => adapter.dispatch(&profile, OperationKind::Backup).await,
        Commands::Update { profile } => adapter.dispatch(&profile, OperationKind::Update).await,
        Commands::Shutdown { profile, restart } => {
            let kind = if restart {
                OperationKind::Restart
            } else {
                OperationKind::Shutdown
            };
            adapter.dispatch(&profile, kind).await
        }
        Commands::Stop { profile } => adapter.dispatch(&profile, OperationKind::Stop).await,
        Commands::Start { profile } => adapter.dispatch(&profile, OperationKind::Start).await,
    };

    info!(outcome = %outcome, code = outcome.code(), "run finished");
    std::process::exit(outcome.code());
}
