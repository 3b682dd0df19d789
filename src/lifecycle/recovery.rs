//! Startup recovery of programs left open by a crash
//!
//! Every program without an end timestamp is closed at its last recorded
//! batch (or its start, if it has none) and finalized with the same
//! full-history recompute as a normal switch. A program whose run configs
//! were never persisted gets a gate map rebuilt from the `(gate, recipe)`
//! pairs stamped on its own batches. Failures are contained per program.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::totals::finalize_program;
use crate::recipe::RecipeCatalog;
use crate::storage::{KpiStore, Sequence, StorageError};
use crate::types::{ConfigSource, GateAssignment, Program, ProgramId, ProgramStats, RunConfig};

/// Outcome of one recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Finalized with their persisted run configs.
    pub recovered: Vec<ProgramId>,
    /// Finalized with a gate map rebuilt from batch records.
    pub reconstructed: Vec<ProgramId>,
    /// Nothing attributable; closed with zero totals.
    pub empty: Vec<ProgramId>,
    pub failed: Vec<(ProgramId, String)>,
}

impl RecoveryReport {
    pub fn total(&self) -> usize {
        self.recovered.len() + self.reconstructed.len() + self.empty.len() + self.failed.len()
    }
}

enum Recovered {
    WithConfigs,
    Reconstructed,
    Empty,
}

/// Close every open program. Only listing programs can fail the pass as a
/// whole; per-program errors are recorded in the report.
pub fn recover_open_programs<S: KpiStore + ?Sized>(
    store: &S,
    catalog: &RecipeCatalog,
    max_gap_minutes: u32,
) -> Result<RecoveryReport, StorageError> {
    let mut programs = store.list_programs()?;
    programs.sort_by_key(|p| (p.start_ts, p.id));

    let mut report = RecoveryReport::default();
    for (idx, program) in programs.iter().enumerate() {
        if !program.is_open() {
            continue;
        }
        // A later program bounds this one's event span.
        let until = programs[idx + 1..]
            .iter()
            .map(|p| p.start_ts)
            .find(|start| *start > program.start_ts);

        warn!(
            program_id = program.id,
            program = %program.name,
            "[Recovery] Program has no end timestamp; recovering"
        );
        match recover_program(store, catalog, program, until, max_gap_minutes) {
            Ok(Recovered::WithConfigs) => report.recovered.push(program.id),
            Ok(Recovered::Reconstructed) => report.reconstructed.push(program.id),
            Ok(Recovered::Empty) => report.empty.push(program.id),
            Err(e) => {
                warn!(program_id = program.id, "[Recovery] Failed: {}", e);
                report.failed.push((program.id, e.to_string()));
            }
        }
    }

    if report.total() > 0 {
        info!(
            recovered = report.recovered.len(),
            reconstructed = report.reconstructed.len(),
            empty = report.empty.len(),
            failed = report.failed.len(),
            "[Recovery] Pass complete"
        );
    }
    Ok(report)
}

fn recover_program<S: KpiStore + ?Sized>(
    store: &S,
    catalog: &RecipeCatalog,
    program: &Program,
    until: Option<DateTime<Utc>>,
    max_gap_minutes: u32,
) -> Result<Recovered, StorageError> {
    let batches = store.program_batches(program.id, program.start_ts, until)?;
    let end_ts = batches
        .iter()
        .map(|b| b.completed_at)
        .max()
        .unwrap_or(program.start_ts);

    let mut configs = store.run_configs(program.id)?;
    let mut outcome = Recovered::WithConfigs;

    if configs.is_empty() {
        // Batches are in time order, so the latest pair for a gate wins.
        let assignment: GateAssignment = batches
            .iter()
            .filter_map(|b| b.recipe_id.map(|r| (b.gate, r)))
            .collect();

        if assignment.is_empty() {
            warn!(
                program_id = program.id,
                batches = batches.len(),
                "[Recovery] No attributable batches; closing with empty totals"
            );
            close_empty(store, program, end_ts)?;
            return Ok(Recovered::Empty);
        }

        let config = RunConfig {
            id: store.next_id(Sequence::RunConfig)?,
            program_id: program.id,
            name: format!("{}-reconstructed", program.name),
            source: ConfigSource::Reconstructed,
            activated_at: program.start_ts,
            assignment,
        };
        info!(
            program_id = program.id,
            gates = config.assignment.len(),
            "[Recovery] Rebuilt gate map from batch records"
        );
        store.put_run_config(&config)?;
        configs.push(config);
        outcome = Recovered::Reconstructed;
    }

    finalize_program(store, catalog, program, end_ts, until, &configs, max_gap_minutes)?;
    Ok(outcome)
}

fn close_empty<S: KpiStore + ?Sized>(
    store: &S,
    program: &Program,
    end_ts: DateTime<Utc>,
) -> Result<(), StorageError> {
    store.put_program_stats(&ProgramStats {
        program_id: program.id,
        start_ts: Some(program.start_ts),
        end_ts: Some(end_ts),
        ..ProgramStats::default()
    })?;
    store.put_program(&Program {
        end_ts: Some(end_ts),
        ..program.clone()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::types::BatchEvent;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 1, 8, 0, 0).unwrap()
    }

    fn open_program(store: &MemoryStore, id: ProgramId, start: DateTime<Utc>) -> Program {
        let program = Program {
            id,
            name: Program::name_for(start),
            start_ts: start,
            end_ts: None,
        };
        store.put_program(&program).unwrap();
        program
    }

    #[test]
    fn test_reconstructs_assignment_from_batches() {
        let store = MemoryStore::new();
        let mut catalog = RecipeCatalog::new();
        let (id, _) = catalog.resolve_name("R_100_140_1000_0_NA_NA").unwrap();
        open_program(&store, 1, t0());
        let last = t0() + Duration::minutes(2);
        for (bid, ts) in [(1, t0()), (2, t0() + Duration::minutes(1)), (3, last)] {
            store
                .put_batch(&BatchEvent::new(bid, 1, 1100.0, 9, ts).with_recipe(id).with_program(1))
                .unwrap();
        }

        let report = recover_open_programs(&store, &catalog, 120).unwrap();
        assert_eq!(report.reconstructed, vec![1]);

        let program = store.get_program(1).unwrap().unwrap();
        assert_eq!(program.end_ts, Some(last));
        let configs = store.run_configs(1).unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].source, ConfigSource::Reconstructed);
        let stats = store.recipe_stats(1).unwrap();
        assert_eq!(stats[0].total_batches, 3.0);
        assert!((stats[0].total_giveaway_weight_g - 300.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_program_closed_at_start() {
        let store = MemoryStore::new();
        let catalog = RecipeCatalog::new();
        open_program(&store, 1, t0());
        let report = recover_open_programs(&store, &catalog, 120).unwrap();
        assert_eq!(report.empty, vec![1]);
        let program = store.get_program(1).unwrap().unwrap();
        assert_eq!(program.end_ts, Some(t0()));
        let stats = store.program_stats(1).unwrap().unwrap();
        assert_eq!(stats.total_batches, 0.0);
    }

    #[test]
    fn test_closed_programs_untouched() {
        let store = MemoryStore::new();
        let catalog = RecipeCatalog::new();
        store
            .put_program(&Program {
                id: 1,
                name: "done".to_string(),
                start_ts: t0(),
                end_ts: Some(t0() + Duration::hours(1)),
            })
            .unwrap();
        let report = recover_open_programs(&store, &catalog, 120).unwrap();
        assert_eq!(report, RecoveryReport::default());
    }

    #[test]
    fn test_next_program_bounds_history() {
        let store = MemoryStore::new();
        let mut catalog = RecipeCatalog::new();
        let (id, _) = catalog.resolve_name("R_100_140_1000_0_NA_NA").unwrap();
        open_program(&store, 1, t0());
        open_program(&store, 2, t0() + Duration::hours(1));
        // Unstamped batches: one in each program's span.
        store
            .put_batch(&BatchEvent::new(1, 1, 1000.0, 8, t0() + Duration::minutes(5)).with_recipe(id))
            .unwrap();
        store
            .put_batch(&BatchEvent::new(2, 1, 1000.0, 8, t0() + Duration::minutes(65)).with_recipe(id))
            .unwrap();

        let report = recover_open_programs(&store, &catalog, 120).unwrap();
        assert_eq!(report.reconstructed, vec![1, 2]);
        assert_eq!(
            store.get_program(1).unwrap().unwrap().end_ts,
            Some(t0() + Duration::minutes(5))
        );
        assert_eq!(store.recipe_stats(1).unwrap()[0].total_batches, 1.0);
        assert_eq!(store.recipe_stats(2).unwrap()[0].total_batches, 1.0);
    }

    #[test]
    fn test_failure_is_contained() {
        let store = MemoryStore::new();
        let catalog = RecipeCatalog::new();
        open_program(&store, 1, t0());
        store.fail_writes(true);
        let report = recover_open_programs(&store, &catalog, 120).unwrap();
        assert_eq!(report.failed.len(), 1);
        store.fail_writes(false);
        let again = recover_open_programs(&store, &catalog, 120).unwrap();
        assert_eq!(again.empty, vec![1]);
    }
}
