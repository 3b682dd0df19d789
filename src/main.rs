//! Batchline KPI Worker
//!
//! Startup sequence:
//! 1. Optional data reset (`--reset-db` / `RESET_DB`)
//! 2. Single-writer lock in the data directory
//! 3. Open the sled store and load the recipe catalog
//! 4. Recover programs left open by a previous run
//! 5. Activate the first schedule entry (or the default assignment)
//! 6. Poll until Ctrl+C, then flush

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use batchline_kpi::companion::notifier_from_config;
use batchline_kpi::config::WorkerConfig;
use batchline_kpi::lifecycle::{LifecycleManager, ProgramSchedule};
use batchline_kpi::pipeline::{StoreSource, WorkerLoop};
use batchline_kpi::storage::{ProcessLock, SledStore};

#[derive(Parser, Debug)]
#[command(name = "batchline-worker")]
#[command(about = "Batching line KPI aggregation worker")]
#[command(version)]
struct CliArgs {
    /// Worker config TOML (overrides BATCHLINE_CONFIG and ./batchline.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory (overrides config and BATCHLINE_DATA_DIR)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Wipe the data directory before starting
    #[arg(long)]
    reset_db: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

/// Check if database reset is requested via CLI flag or `RESET_DB` env var.
fn should_reset_db(cli_flag: bool) -> bool {
    if cli_flag {
        return true;
    }
    if let Ok(val) = std::env::var("RESET_DB") {
        let val_lower = val.to_lowercase();
        return val_lower == "true" || val_lower == "1" || val_lower == "yes";
    }
    false
}

/// Remove the data directory and all its contents.
fn reset_data_directory(data_path: &Path) -> Result<()> {
    if !data_path.exists() {
        info!("Data directory does not exist, nothing to reset");
        return Ok(());
    }

    warn!("RESET_DB requested, wiping {}", data_path.display());
    if let Ok(entries) = std::fs::read_dir(data_path) {
        for entry in entries.flatten() {
            let path = entry.path();
            let file_type = if path.is_dir() { "DIR " } else { "FILE" };
            warn!("    {} {}", file_type, path.display());
        }
    }

    std::fs::remove_dir_all(data_path).context("Failed to remove data directory")?;
    info!("Data directory removed");
    Ok(())
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(args: &CliArgs) -> Result<WorkerConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let mut config = WorkerConfig::load_from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?;
            config.apply_env_overrides();
            config
        }
        None => WorkerConfig::load(),
    };
    if let Some(dir) = &args.data_dir {
        config.worker.data_dir.clone_from(dir);
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_json);

    let config = load_config(&args)?;
    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }
    let data_dir = config.worker.data_dir.clone();

    if should_reset_db(args.reset_db) {
        reset_data_directory(&data_dir)?;
    }

    let lock = ProcessLock::acquire(&data_dir)?;
    let store = Arc::new(SledStore::open(config.worker.db_path())?);

    let mut manager = LifecycleManager::new(Arc::clone(&store), config.worker.max_gap_minutes)?;
    let report = manager.recover()?;
    if !report.failed.is_empty() {
        warn!(
            failed = report.failed.len(),
            "[Worker] Some programs could not be recovered; they stay open for the next start"
        );
    }

    let schedule = match &config.schedule.path {
        Some(path) => Some(ProgramSchedule::load(path, config.schedule.wrap_minutes)?),
        None => None,
    };

    let notifier = notifier_from_config(&config.companion)?;
    info!(
        companion = notifier.name(),
        backend = %config.companion.backend_url,
        "[Worker] Companion notifications configured"
    );

    let now = Utc::now();
    let source = StoreSource::resume(Arc::clone(&store), now)?;

    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("[Worker] Received Ctrl+C, initiating shutdown...");
        shutdown_token.cancel();
    });

    let mut worker = WorkerLoop::new(
        manager,
        source,
        notifier,
        cancel_token,
        config.worker.poll_interval(),
    );
    if let Some(schedule) = schedule {
        worker = worker.with_schedule(schedule);
    }
    worker.start(now, &config.schedule.default_gate_names())?;

    worker.run().await;

    store.flush()?;
    drop(lock);
    info!("[Worker] Shutdown complete");
    Ok(())
}
