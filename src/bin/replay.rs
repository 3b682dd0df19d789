//! Batchline Event Replay
//!
//! Feeds a recorded event log through the KPI engine offline and prints the
//! per-program totals.
//!
//! Usage:
//!   batchline-replay --events events.json
//!   batchline-replay --events events.json --schedule schedule.json --db ./replay-db --summary-json

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use batchline_kpi::config::defaults::MAX_GAP_MINUTES;
use batchline_kpi::lifecycle::ScheduleFile;
use batchline_kpi::replay::{run_replay, EventLog};
use batchline_kpi::storage::{KpiStore, MemoryStore, SledStore};
use batchline_kpi::types::Gate;

#[derive(Parser, Debug)]
#[command(name = "batchline-replay")]
#[command(about = "Replay recorded batching-line events through the KPI engine")]
#[command(version)]
struct CliArgs {
    /// Event log JSON ({"pieces": [...], "batches": [...]})
    #[arg(long)]
    events: PathBuf,

    /// Program schedule JSON; entries switch programs at their timestamps
    #[arg(long)]
    schedule: Option<PathBuf>,

    /// Persist results to a sled database in this directory (default: in memory)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Gate assignment used without a schedule, as GATE=RECIPE (repeatable)
    #[arg(long = "assign", value_name = "GATE=RECIPE", value_parser = parse_assignment)]
    assign: Vec<(Gate, String)>,

    /// Most empty minute windows emitted for one gap
    #[arg(long, default_value_t = MAX_GAP_MINUTES)]
    max_gap_minutes: u32,

    /// Print the summary as JSON instead of text
    #[arg(long)]
    summary_json: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

fn parse_assignment(raw: &str) -> Result<(Gate, String), String> {
    let (gate, recipe) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected GATE=RECIPE, got '{raw}'"))?;
    let gate = gate
        .trim()
        .parse::<Gate>()
        .map_err(|_| format!("'{gate}' is not a gate number"))?;
    Ok((gate, recipe.trim().to_string()))
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_json);

    let log = EventLog::load(&args.events)?;
    info!(
        pieces = log.pieces.len(),
        batches = log.batches.len(),
        "[Replay] Loaded {}",
        args.events.display()
    );

    let schedule = match &args.schedule {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read schedule {}", path.display()))?;
            let file: ScheduleFile = serde_json::from_str(&raw)
                .with_context(|| format!("Invalid schedule {}", path.display()))?;
            file.assignments
        }
        None => Vec::new(),
    };
    let default_assignment: BTreeMap<Gate, String> = args.assign.into_iter().collect();

    let store: Arc<dyn KpiStore> = match &args.db {
        Some(dir) => Arc::new(SledStore::open(dir).context("Failed to open replay database")?),
        None => Arc::new(MemoryStore::new()),
    };

    let summary = run_replay(
        store,
        log,
        &schedule,
        &default_assignment,
        args.max_gap_minutes,
    )?;

    if args.summary_json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print!("{summary}");
    }
    Ok(())
}
