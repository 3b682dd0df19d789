//! Offline replay of recorded events
//!
//! Loads an event log into a store and drives the same lifecycle manager the
//! worker uses, switching programs at the schedule's absolute timestamps
//! instead of on a wall-clock timer. The last program is finalized at the
//! last event's timestamp.
//!
//! Input format:
//!
//! ```json
//! {"pieces":  [{"timestamp": "2025-05-01T08:00:01Z", "weight_g": 121.5, "gate": 3}],
//!  "batches": [{"id": 1, "gate": 3, "weight_g": 1012.0, "pieces": 8,
//!               "completed_at": "2025-05-01T08:00:40Z"}]}
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::kpi::{merge_events, EngineEvent};
use crate::lifecycle::{LifecycleManager, ScheduleEntry};
use crate::storage::KpiStore;
use crate::types::{
    BatchEvent, ConfigSource, Gate, PieceEvent, Program, ProgramStats, RecipeStats,
};

/// Recorded raw events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventLog {
    #[serde(default)]
    pub pieces: Vec<PieceEvent>,
    #[serde(default)]
    pub batches: Vec<BatchEvent>,
}

impl EventLog {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read event log {}", path.display()))?;
        let log: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid event log {}", path.display()))?;
        Ok(log)
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty() && self.batches.is_empty()
    }
}

// ============================================================================
// Summary
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgramSummary {
    pub program: Program,
    pub stats: ProgramStats,
    pub recipes: Vec<RecipeStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplaySummary {
    pub pieces: usize,
    pub batches: usize,
    pub late_events: u64,
    pub programs: Vec<ProgramSummary>,
}

impl fmt::Display for ReplaySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Replayed {} pieces, {} batches ({} late)",
            self.pieces, self.batches, self.late_events
        )?;
        for summary in &self.programs {
            let p = &summary.stats;
            writeln!(f)?;
            writeln!(
                f,
                "{} [{}]  {} -> {}",
                summary.program.name,
                summary.program.id,
                summary.program.start_ts.format("%Y-%m-%d %H:%M:%S"),
                summary
                    .program
                    .end_ts
                    .map_or_else(|| "open".to_string(), |t| t.format("%Y-%m-%d %H:%M:%S").to_string()),
            )?;
            writeln!(
                f,
                "  batches {:.2}  batched {:.1} g  giveaway {:.1} g  items {}  rejects {} ({:.1} g)",
                p.total_batches,
                p.total_batched_weight_g,
                p.total_giveaway_weight_g,
                p.total_items_batched,
                p.total_items_rejected,
                p.total_reject_weight_g
            )?;
            for r in &summary.recipes {
                writeln!(
                    f,
                    "    {:<28} gates {:<8} batches {:>8.2}  giveaway {:>10.1} g  eligible rejects {}",
                    r.recipe_name, r.gates_assigned, r.total_batches, r.total_giveaway_weight_g, r.total_items_rejected
                )?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Replay `log` into `store`.
///
/// With a schedule, each entry's assignment activates at its timestamp and
/// the entry's `program_id` names the program. The first program starts at
/// the earlier of the first entry and the first event. Without a schedule,
/// one program runs `default_assignment` from the first event.
pub fn run_replay<S: KpiStore + ?Sized>(
    store: Arc<S>,
    log: EventLog,
    schedule: &[ScheduleEntry],
    default_assignment: &BTreeMap<Gate, String>,
    max_gap_minutes: u32,
) -> Result<ReplaySummary> {
    let mut summary = ReplaySummary {
        pieces: log.pieces.len(),
        batches: log.batches.len(),
        ..ReplaySummary::default()
    };

    for piece in &log.pieces {
        store.put_piece(piece).context("Failed to store piece")?;
    }
    for batch in &log.batches {
        store.put_batch(batch).context("Failed to store batch")?;
    }

    let events = merge_events(log.pieces, log.batches);
    let (Some(first_ts), Some(last_ts)) = (
        events.first().map(EngineEvent::timestamp),
        events.last().map(EngineEvent::timestamp),
    ) else {
        info!("[Replay] Event log is empty");
        return Ok(summary);
    };

    let mut entries: Vec<&ScheduleEntry> = schedule.iter().collect();
    entries.sort_by_key(|e| e.timestamp);

    let mut manager = LifecycleManager::new(Arc::clone(&store), max_gap_minutes)?;
    manager.recover()?;

    let mut program_ids = Vec::new();
    let mut upcoming = entries.into_iter().peekable();
    let mut current_label = match upcoming.next() {
        Some(entry) => {
            let start = entry.timestamp.min(first_ts);
            program_ids.push(activate(&mut manager, &entry.gate_names()?, start, Some(&entry.program_id))?);
            Some(entry.program_id.as_str())
        }
        None => {
            program_ids.push(activate(&mut manager, default_assignment, first_ts, None)?);
            None
        }
    };

    let mut chunk_pieces = Vec::new();
    let mut chunk_batches = Vec::new();
    for event in events {
        let ts = event.timestamp();
        while let Some(entry) = upcoming.next_if(|e| e.timestamp <= ts) {
            manager.ingest(
                std::mem::take(&mut chunk_pieces),
                std::mem::take(&mut chunk_batches),
            );
            let names = entry.gate_names()?;
            if current_label == Some(entry.program_id.as_str()) {
                manager
                    .reassign(&names, entry.timestamp, ConfigSource::Schedule)
                    .with_context(|| format!("Failed to re-assign gates at {}", entry.timestamp))?;
            } else {
                program_ids.push(activate(&mut manager, &names, entry.timestamp, Some(&entry.program_id))?);
                current_label = Some(entry.program_id.as_str());
            }
        }
        match event {
            EngineEvent::Piece(p) => chunk_pieces.push(p),
            EngineEvent::Batch(b) => chunk_batches.push(b),
        }
    }
    manager.ingest(chunk_pieces, chunk_batches);
    summary.late_events = manager.engine().late_events();
    manager
        .end_active(last_ts, None)
        .context("Failed to finalize last program")?;

    for id in program_ids {
        let program = store
            .get_program(id)?
            .with_context(|| format!("Program {id} missing after replay"))?;
        let stats = store.program_stats(id)?.unwrap_or_default();
        let recipes = store.recipe_stats(id)?;
        summary.programs.push(ProgramSummary {
            program,
            stats,
            recipes,
        });
    }

    info!(
        pieces = summary.pieces,
        batches = summary.batches,
        programs = summary.programs.len(),
        "[Replay] Complete"
    );
    Ok(summary)
}

fn activate<S: KpiStore + ?Sized>(
    manager: &mut LifecycleManager<S>,
    names: &BTreeMap<Gate, String>,
    at: DateTime<Utc>,
    label: Option<&str>,
) -> Result<u64> {
    manager
        .switch_program(names, at, label, ConfigSource::Schedule)
        .with_context(|| format!("Failed to start program at {at}"))?;
    manager
        .active()
        .map(|a| a.program.id)
        .context("No active program after switch")
}
