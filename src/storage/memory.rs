//! In-memory store
//!
//! Thread-safe via `RwLock`. Not durable; data is lost when dropped. Writes
//! can be switched off to exercise the transient-failure paths.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use super::{piece_identity, KpiStore, Sequence, StorageError};
use crate::kpi::DwellStats;
use crate::recipe::Recipe;
use crate::types::{
    BatchEvent, BatchId, CombinedMinuteRow, CumulativeRow, DwellSample, Gate, MinuteKey,
    PieceEvent, Program, ProgramId, ProgramStats, RecipeId, RecipeMinuteRow, RecipeStats,
    RunConfig, RunConfigId,
};

#[derive(Debug, Default)]
struct Tables {
    program_seq: u64,
    run_config_seq: u64,
    recipe_seq: u64,
    recipes: BTreeMap<RecipeId, Recipe>,
    programs: BTreeMap<ProgramId, Program>,
    run_configs: BTreeMap<(ProgramId, RunConfigId), RunConfig>,
    pieces: BTreeMap<(i64, Vec<u8>), PieceEvent>,
    batches: BTreeMap<BatchId, BatchEvent>,
    recipe_minutes: BTreeMap<(ProgramId, RecipeId, MinuteKey), RecipeMinuteRow>,
    combined_minutes: BTreeMap<(ProgramId, MinuteKey), CombinedMinuteRow>,
    cumulative: BTreeMap<(ProgramId, RecipeId, MinuteKey), CumulativeRow>,
    dwell_stats: BTreeMap<(ProgramId, Gate), DwellStats>,
    dwell_samples: BTreeMap<(ProgramId, Gate, i64), DwellSample>,
    program_stats: BTreeMap<ProgramId, ProgramStats>,
    recipe_stats: BTreeMap<(ProgramId, RecipeId), RecipeStats>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with [`StorageError::Unavailable`].
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StorageError> {
        self.tables
            .read()
            .map_err(|e| StorageError::Unavailable(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("writes disabled".to_string()));
        }
        self.tables
            .write()
            .map_err(|e| StorageError::Unavailable(e.to_string()))
    }
}

fn in_range(ts: DateTime<Utc>, from: DateTime<Utc>, until: Option<DateTime<Utc>>) -> bool {
    ts >= from && until.map_or(true, |u| ts < u)
}

impl KpiStore for MemoryStore {
    fn next_id(&self, seq: Sequence) -> Result<u64, StorageError> {
        let mut tables = self.write()?;
        let counter = match seq {
            Sequence::Program => &mut tables.program_seq,
            Sequence::RunConfig => &mut tables.run_config_seq,
            Sequence::Recipe => &mut tables.recipe_seq,
        };
        *counter += 1;
        Ok(*counter)
    }

    fn put_recipe(&self, recipe: &Recipe) -> Result<(), StorageError> {
        self.write()?.recipes.insert(recipe.id, recipe.clone());
        Ok(())
    }

    fn load_recipes(&self) -> Result<Vec<Recipe>, StorageError> {
        Ok(self.read()?.recipes.values().cloned().collect())
    }

    fn put_program(&self, program: &Program) -> Result<(), StorageError> {
        self.write()?.programs.insert(program.id, program.clone());
        Ok(())
    }

    fn get_program(&self, id: ProgramId) -> Result<Option<Program>, StorageError> {
        Ok(self.read()?.programs.get(&id).cloned())
    }

    fn list_programs(&self) -> Result<Vec<Program>, StorageError> {
        Ok(self.read()?.programs.values().cloned().collect())
    }

    fn put_run_config(&self, config: &RunConfig) -> Result<(), StorageError> {
        self.write()?
            .run_configs
            .insert((config.program_id, config.id), config.clone());
        Ok(())
    }

    fn run_configs(&self, program_id: ProgramId) -> Result<Vec<RunConfig>, StorageError> {
        let tables = self.read()?;
        let mut configs: Vec<RunConfig> = tables
            .run_configs
            .range((program_id, 0)..=(program_id, RunConfigId::MAX))
            .map(|(_, c)| c.clone())
            .collect();
        configs.sort_by_key(|c| (c.activated_at, c.id));
        Ok(configs)
    }

    fn put_piece(&self, piece: &PieceEvent) -> Result<(), StorageError> {
        let key = (piece.timestamp.timestamp_micros(), piece_identity(piece));
        self.write()?.pieces.insert(key, piece.clone());
        Ok(())
    }

    fn put_batch(&self, batch: &BatchEvent) -> Result<(), StorageError> {
        self.write()?.batches.insert(batch.id, batch.clone());
        Ok(())
    }

    fn pieces_between(
        &self,
        from: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<PieceEvent>, StorageError> {
        let tables = self.read()?;
        Ok(tables
            .pieces
            .range((from.timestamp_micros(), Vec::new())..)
            .map(|(_, p)| p)
            .take_while(|p| until.map_or(true, |u| p.timestamp < u))
            .cloned()
            .collect())
    }

    fn batches_after(&self, cursor: Option<BatchId>) -> Result<Vec<BatchEvent>, StorageError> {
        let tables = self.read()?;
        let batches = match cursor {
            Some(id) => tables
                .batches
                .range((std::ops::Bound::Excluded(id), std::ops::Bound::Unbounded))
                .map(|(_, b)| b.clone())
                .collect(),
            None => tables.batches.values().cloned().collect(),
        };
        Ok(batches)
    }

    fn batches_between(
        &self,
        from: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<BatchEvent>, StorageError> {
        let tables = self.read()?;
        let mut batches: Vec<BatchEvent> = tables
            .batches
            .values()
            .filter(|b| in_range(b.completed_at, from, until))
            .cloned()
            .collect();
        batches.sort_by_key(|b| (b.completed_at, b.id));
        Ok(batches)
    }

    fn latest_batch_id(&self) -> Result<Option<BatchId>, StorageError> {
        Ok(self.read()?.batches.keys().next_back().copied())
    }

    fn put_recipe_minute(&self, program_id: ProgramId, row: &RecipeMinuteRow) -> Result<(), StorageError> {
        self.write()?
            .recipe_minutes
            .insert((program_id, row.recipe_id, row.minute), row.clone());
        Ok(())
    }

    fn put_combined_minute(&self, program_id: ProgramId, row: &CombinedMinuteRow) -> Result<(), StorageError> {
        self.write()?
            .combined_minutes
            .insert((program_id, row.minute), row.clone());
        Ok(())
    }

    fn put_cumulative(&self, program_id: ProgramId, row: &CumulativeRow) -> Result<(), StorageError> {
        self.write()?
            .cumulative
            .insert((program_id, row.recipe_id, row.minute), row.clone());
        Ok(())
    }

    fn put_dwell_stats(&self, program_id: ProgramId, gate: Gate, stats: &DwellStats) -> Result<(), StorageError> {
        self.write()?.dwell_stats.insert((program_id, gate), *stats);
        Ok(())
    }

    fn put_dwell_sample(&self, program_id: ProgramId, sample: &DwellSample) -> Result<(), StorageError> {
        let key = (program_id, sample.gate, sample.batch_timestamp.timestamp_micros());
        self.write()?.dwell_samples.insert(key, sample.clone());
        Ok(())
    }

    fn put_program_stats(&self, stats: &ProgramStats) -> Result<(), StorageError> {
        self.write()?.program_stats.insert(stats.program_id, stats.clone());
        Ok(())
    }

    fn put_recipe_stats(&self, stats: &RecipeStats) -> Result<(), StorageError> {
        self.write()?
            .recipe_stats
            .insert((stats.program_id, stats.recipe_id), stats.clone());
        Ok(())
    }

    fn recipe_minutes(&self, program_id: ProgramId) -> Result<Vec<RecipeMinuteRow>, StorageError> {
        let tables = self.read()?;
        let mut rows: Vec<RecipeMinuteRow> = tables
            .recipe_minutes
            .iter()
            .filter(|((p, _, _), _)| *p == program_id)
            .map(|(_, r)| r.clone())
            .collect();
        rows.sort_by_key(|r| (r.minute, r.recipe_id));
        Ok(rows)
    }

    fn combined_minutes(&self, program_id: ProgramId) -> Result<Vec<CombinedMinuteRow>, StorageError> {
        let tables = self.read()?;
        Ok(tables
            .combined_minutes
            .iter()
            .filter(|((p, _), _)| *p == program_id)
            .map(|(_, r)| r.clone())
            .collect())
    }

    fn cumulative_rows(&self, program_id: ProgramId) -> Result<Vec<CumulativeRow>, StorageError> {
        let tables = self.read()?;
        let mut rows: Vec<CumulativeRow> = tables
            .cumulative
            .iter()
            .filter(|((p, _, _), _)| *p == program_id)
            .map(|(_, r)| r.clone())
            .collect();
        rows.sort_by_key(|r| (r.minute, r.recipe_id));
        Ok(rows)
    }

    fn dwell_stats(&self, program_id: ProgramId) -> Result<Vec<(Gate, DwellStats)>, StorageError> {
        let tables = self.read()?;
        Ok(tables
            .dwell_stats
            .iter()
            .filter(|((p, _), _)| *p == program_id)
            .map(|(&(_, gate), s)| (gate, *s))
            .collect())
    }

    fn dwell_samples(&self, program_id: ProgramId) -> Result<Vec<DwellSample>, StorageError> {
        let tables = self.read()?;
        let mut samples: Vec<DwellSample> = tables
            .dwell_samples
            .iter()
            .filter(|((p, _, _), _)| *p == program_id)
            .map(|(_, s)| s.clone())
            .collect();
        samples.sort_by_key(|s| (s.batch_timestamp, s.gate));
        Ok(samples)
    }

    fn program_stats(&self, program_id: ProgramId) -> Result<Option<ProgramStats>, StorageError> {
        Ok(self.read()?.program_stats.get(&program_id).cloned())
    }

    fn recipe_stats(&self, program_id: ProgramId) -> Result<Vec<RecipeStats>, StorageError> {
        let tables = self.read()?;
        Ok(tables
            .recipe_stats
            .range((program_id, 0)..=(program_id, RecipeId::MAX))
            .map(|(_, s)| s.clone())
            .collect())
    }

    fn backend_name(&self) -> &'static str {
        "in-memory"
    }
}
