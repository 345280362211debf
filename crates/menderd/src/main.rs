//! menderd: runs the mender resilience engine against an agent's state.
//!
//! One-shot commands print their report as JSON on stdout; logs go to
//! stderr. `run` stays in the foreground, checking health and taking
//! backups on the `[schedule]` intervals from `mender.toml` until Ctrl-C.
//!
//! # Usage
//!
//! ```text
//! menderd check --only disk_space
//! menderd --root /srv/agent backup
//! menderd restore ~/.mender/backups/mender_backup_20260301_140502
//! menderd run
//! ```

mod scheduler;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use mender_core::{AppPaths, HealingSettings};
use mender_heal::{Resilience, DEFAULT_RECENT_ACTIONS};
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::scheduler::MaintenanceScheduler;

const DEFAULT_FILTER: &str = "info,menderd=debug,mender=debug";

#[derive(Parser)]
#[command(name = "menderd", about = "Mender resilience daemon")]
struct Cli {
    /// State root (defaults to ~/.mender).
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the health checks (all of them, or one by name).
    Check {
        #[arg(long)]
        only: Option<String>,
    },
    /// Verify and repair directories, config document and database.
    Repair,
    /// Snapshot the state files into a new backup.
    Backup,
    /// Restore state files from a backup directory.
    Restore { path: PathBuf },
    /// Purge old logs and compact the database.
    Cleanup,
    /// Engine statistics, error patterns and recent actions.
    Stats {
        #[arg(long, default_value_t = DEFAULT_RECENT_ACTIONS)]
        actions: usize,
    },
    /// List backups, newest first.
    Backups,
    /// Initialize, then run scheduled health checks and backups until Ctrl-C.
    Run,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let paths = match cli.root {
        Some(root) => AppPaths::from_root(root),
        None => AppPaths::home_default()?,
    };
    let settings = HealingSettings::load_or_default(&paths.settings_file())
        .with_context(|| format!("reading {}", paths.settings_file().display()))?;
    let engine = Resilience::builder(paths).settings(settings).build();

    match cli.command {
        Command::Repair => {
            let report = engine.initialize();
            let actions = engine.recent_actions(DEFAULT_RECENT_ACTIONS);
            print_json(&json!({ "report": report, "actions": actions }))
        }
        Command::Check { only } => {
            engine.initialize();
            let report = match only {
                Some(name) => engine.run_check(&name)?,
                None => engine.health_check(),
            };
            if !report.overall_healthy {
                warn!("health check reported problems");
            }
            print_json(&report)
        }
        Command::Backup => {
            engine.initialize();
            let path = engine.backup()?;
            print_json(&json!({ "path": path }))
        }
        Command::Restore { path } => {
            engine.initialize();
            if !engine.restore(&path) {
                anyhow::bail!("restore from {} failed", path.display());
            }
            print_json(&json!({ "restored": path }))
        }
        Command::Cleanup => {
            engine.initialize();
            print_json(&engine.cleanup())
        }
        Command::Stats { actions } => {
            engine.initialize();
            print_json(&json!({
                "stats": engine.stats(),
                "error_patterns": engine.error_patterns(),
                "suggestions": engine.suggest_fixes(),
                "recent_actions": engine.recent_actions(actions),
            }))
        }
        Command::Backups => {
            let backups = engine.list_backups();
            print_json(&backups)
        }
        Command::Run => run(engine).await,
    }
}

async fn run(engine: Resilience) -> anyhow::Result<()> {
    info!(root = ?engine.paths().config_dir, "mender daemon starting");
    let report = engine.initialize();
    if report.database.data_lost() {
        warn!("database was unrecoverable and has been reset");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = MaintenanceScheduler::from_settings(engine.clone(), &engine.settings().schedule);
    let handle = tokio::spawn(async move { scheduler.run(shutdown_rx).await });

    tokio::signal::ctrl_c()
        .await
        .context("installing Ctrl-C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let summary = handle.await?;
    info!(
        health_checks = summary.health_checks,
        backups = summary.backups,
        "mender daemon stopped"
    );
    Ok(())
}
