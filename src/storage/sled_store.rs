//! Sled-backed KPI store
//!
//! One named tree per table. Values are serde_json; keys are big-endian
//! composites so prefix scans return rows in program, then minute or time
//! order.

use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use super::{ordered_i64, piece_identity, time_key, KpiStore, Sequence, StorageError};
use crate::kpi::DwellStats;
use crate::recipe::Recipe;
use crate::types::{
    BatchEvent, BatchId, CombinedMinuteRow, CumulativeRow, DwellSample, Gate, MinuteKey,
    PieceEvent, Program, ProgramId, ProgramStats, RecipeMinuteRow, RecipeStats, RunConfig,
};

const TREE_SEQUENCES: &str = "sequences";
const TREE_RECIPES: &str = "recipes";
const TREE_PROGRAMS: &str = "programs";
const TREE_RUN_CONFIGS: &str = "run_configs";
const TREE_PIECES: &str = "pieces";
const TREE_BATCHES: &str = "batches";
const TREE_BATCHES_BY_TIME: &str = "batches_by_time";
const TREE_RECIPE_MINUTES: &str = "kpi_recipe_minute";
const TREE_COMBINED_MINUTES: &str = "kpi_combined_minute";
const TREE_CUMULATIVE: &str = "kpi_cumulative";
const TREE_DWELL_STATS: &str = "gate_dwell_stats";
const TREE_DWELL_SAMPLES: &str = "gate_dwell_samples";
const TREE_PROGRAM_STATS: &str = "program_stats";
const TREE_RECIPE_STATS: &str = "recipe_stats";

/// Durable store. Cheap to clone; clones share the database handle.
#[derive(Clone)]
pub struct SledStore {
    db: Arc<sled::Db>,
    sequences: sled::Tree,
    recipes: sled::Tree,
    programs: sled::Tree,
    run_configs: sled::Tree,
    pieces: sled::Tree,
    batches: sled::Tree,
    batches_by_time: sled::Tree,
    recipe_minutes: sled::Tree,
    combined_minutes: sled::Tree,
    cumulative: sled::Tree,
    dwell_stats: sled::Tree,
    dwell_samples: sled::Tree,
    program_stats: sled::Tree,
    recipe_stats: sled::Tree,
}

impl SledStore {
    /// Open or create the store under `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path_ref = path.as_ref();
        let db = sled::open(path_ref)?;
        info!("KPI store opened at {:?}", path_ref);
        Self::from_db(db)
    }

    /// Throwaway store that is deleted on drop.
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StorageError> {
        Ok(Self {
            sequences: db.open_tree(TREE_SEQUENCES)?,
            recipes: db.open_tree(TREE_RECIPES)?,
            programs: db.open_tree(TREE_PROGRAMS)?,
            run_configs: db.open_tree(TREE_RUN_CONFIGS)?,
            pieces: db.open_tree(TREE_PIECES)?,
            batches: db.open_tree(TREE_BATCHES)?,
            batches_by_time: db.open_tree(TREE_BATCHES_BY_TIME)?,
            recipe_minutes: db.open_tree(TREE_RECIPE_MINUTES)?,
            combined_minutes: db.open_tree(TREE_COMBINED_MINUTES)?,
            cumulative: db.open_tree(TREE_CUMULATIVE)?,
            dwell_stats: db.open_tree(TREE_DWELL_STATS)?,
            dwell_samples: db.open_tree(TREE_DWELL_SAMPLES)?,
            program_stats: db.open_tree(TREE_PROGRAM_STATS)?,
            recipe_stats: db.open_tree(TREE_RECIPE_STATS)?,
            db: Arc::new(db),
        })
    }

    /// Flush dirty pages to disk.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn key(parts: &[&[u8]]) -> Vec<u8> {
    parts.concat()
}

fn minute_key(minute: MinuteKey) -> [u8; 8] {
    ordered_i64(minute.index())
}

fn put<T: Serialize>(tree: &sled::Tree, key: impl AsRef<[u8]>, value: &T) -> Result<(), StorageError> {
    tree.insert(key.as_ref(), serde_json::to_vec(value)?)?;
    Ok(())
}

fn get<T: DeserializeOwned>(tree: &sled::Tree, key: impl AsRef<[u8]>) -> Result<Option<T>, StorageError> {
    match tree.get(key.as_ref())? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

fn scan_prefix<T: DeserializeOwned>(tree: &sled::Tree, prefix: impl AsRef<[u8]>) -> Result<Vec<T>, StorageError> {
    tree.scan_prefix(prefix.as_ref())
        .map(|item| {
            let (_, value) = item?;
            Ok(serde_json::from_slice(&value)?)
        })
        .collect()
}

fn batch_index_key(batch: &BatchEvent) -> Vec<u8> {
    key(&[&time_key(batch.completed_at), &batch.id.to_be_bytes()])
}

fn time_range(from: DateTime<Utc>, until: Option<DateTime<Utc>>) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    let start = Bound::Included(time_key(from).to_vec());
    let end = until.map_or(Bound::Unbounded, |u| Bound::Excluded(time_key(u).to_vec()));
    (start, end)
}

impl KpiStore for SledStore {
    fn next_id(&self, seq: Sequence) -> Result<u64, StorageError> {
        let next = self.sequences.update_and_fetch(seq.key(), |old| {
            let current = old
                .and_then(|bytes| <[u8; 8]>::try_from(bytes).ok())
                .map_or(0, u64::from_be_bytes);
            Some((current + 1).to_be_bytes().to_vec())
        })?;
        next.and_then(|bytes| <[u8; 8]>::try_from(&bytes[..]).ok())
            .map(u64::from_be_bytes)
            .ok_or_else(|| StorageError::Corrupt {
                tree: TREE_SEQUENCES,
                reason: format!("sequence '{}' is not an 8-byte counter", seq.key()),
            })
    }

    fn put_recipe(&self, recipe: &Recipe) -> Result<(), StorageError> {
        put(&self.recipes, recipe.id.to_be_bytes(), recipe)
    }

    fn load_recipes(&self) -> Result<Vec<Recipe>, StorageError> {
        scan_prefix(&self.recipes, b"")
    }

    fn put_program(&self, program: &Program) -> Result<(), StorageError> {
        put(&self.programs, program.id.to_be_bytes(), program)
    }

    fn get_program(&self, id: ProgramId) -> Result<Option<Program>, StorageError> {
        get(&self.programs, id.to_be_bytes())
    }

    fn list_programs(&self) -> Result<Vec<Program>, StorageError> {
        scan_prefix(&self.programs, b"")
    }

    fn put_run_config(&self, config: &RunConfig) -> Result<(), StorageError> {
        let k = key(&[&config.program_id.to_be_bytes(), &config.id.to_be_bytes()]);
        put(&self.run_configs, k, config)
    }

    fn run_configs(&self, program_id: ProgramId) -> Result<Vec<RunConfig>, StorageError> {
        let mut configs: Vec<RunConfig> = scan_prefix(&self.run_configs, program_id.to_be_bytes())?;
        configs.sort_by_key(|c| (c.activated_at, c.id));
        Ok(configs)
    }

    fn put_piece(&self, piece: &PieceEvent) -> Result<(), StorageError> {
        let k = key(&[&time_key(piece.timestamp), &piece_identity(piece)]);
        put(&self.pieces, k, piece)
    }

    fn put_batch(&self, batch: &BatchEvent) -> Result<(), StorageError> {
        let id_key = batch.id.to_be_bytes();
        if let Some(previous) = get::<BatchEvent>(&self.batches, id_key)? {
            if previous.completed_at != batch.completed_at {
                self.batches_by_time.remove(batch_index_key(&previous))?;
            }
        }
        put(&self.batches, id_key, batch)?;
        self.batches_by_time.insert(batch_index_key(batch), id_key.to_vec())?;
        Ok(())
    }

    fn pieces_between(
        &self,
        from: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<PieceEvent>, StorageError> {
        self.pieces
            .range(time_range(from, until))
            .map(|item| {
                let (_, value) = item?;
                Ok(serde_json::from_slice(&value)?)
            })
            .collect()
    }

    fn batches_after(&self, cursor: Option<BatchId>) -> Result<Vec<BatchEvent>, StorageError> {
        let start = cursor.map_or(Bound::Unbounded, |id| Bound::Excluded(id.to_be_bytes()));
        self.batches
            .range((start, Bound::Unbounded))
            .map(|item| {
                let (_, value) = item?;
                Ok(serde_json::from_slice(&value)?)
            })
            .collect()
    }

    fn batches_between(
        &self,
        from: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<BatchEvent>, StorageError> {
        let mut out = Vec::new();
        for item in self.batches_by_time.range(time_range(from, until)) {
            let (_, id_key) = item?;
            match get::<BatchEvent>(&self.batches, &id_key)? {
                Some(batch) => out.push(batch),
                None => {
                    return Err(StorageError::Corrupt {
                        tree: TREE_BATCHES_BY_TIME,
                        reason: "index entry without batch record".to_string(),
                    })
                }
            }
        }
        Ok(out)
    }

    fn latest_batch_id(&self) -> Result<Option<BatchId>, StorageError> {
        match self.batches.last()? {
            Some((_, value)) => {
                let batch: BatchEvent = serde_json::from_slice(&value)?;
                Ok(Some(batch.id))
            }
            None => Ok(None),
        }
    }

    fn put_recipe_minute(&self, program_id: ProgramId, row: &RecipeMinuteRow) -> Result<(), StorageError> {
        let k = key(&[
            &program_id.to_be_bytes(),
            &minute_key(row.minute),
            &row.recipe_id.to_be_bytes(),
        ]);
        put(&self.recipe_minutes, k, row)
    }

    fn put_combined_minute(&self, program_id: ProgramId, row: &CombinedMinuteRow) -> Result<(), StorageError> {
        let k = key(&[&program_id.to_be_bytes(), &minute_key(row.minute)]);
        put(&self.combined_minutes, k, row)
    }

    fn put_cumulative(&self, program_id: ProgramId, row: &CumulativeRow) -> Result<(), StorageError> {
        let k = key(&[
            &program_id.to_be_bytes(),
            &minute_key(row.minute),
            &row.recipe_id.to_be_bytes(),
        ]);
        put(&self.cumulative, k, row)
    }

    fn put_dwell_stats(&self, program_id: ProgramId, gate: Gate, stats: &DwellStats) -> Result<(), StorageError> {
        let k = key(&[&program_id.to_be_bytes(), &gate.to_be_bytes()]);
        put(&self.dwell_stats, k, &(gate, stats))
    }

    fn put_dwell_sample(&self, program_id: ProgramId, sample: &DwellSample) -> Result<(), StorageError> {
        let k = key(&[
            &program_id.to_be_bytes(),
            &time_key(sample.batch_timestamp),
            &sample.gate.to_be_bytes(),
        ]);
        put(&self.dwell_samples, k, sample)
    }

    fn put_program_stats(&self, stats: &ProgramStats) -> Result<(), StorageError> {
        put(&self.program_stats, stats.program_id.to_be_bytes(), stats)
    }

    fn put_recipe_stats(&self, stats: &RecipeStats) -> Result<(), StorageError> {
        let k = key(&[&stats.program_id.to_be_bytes(), &stats.recipe_id.to_be_bytes()]);
        put(&self.recipe_stats, k, stats)
    }

    fn recipe_minutes(&self, program_id: ProgramId) -> Result<Vec<RecipeMinuteRow>, StorageError> {
        scan_prefix(&self.recipe_minutes, program_id.to_be_bytes())
    }

    fn combined_minutes(&self, program_id: ProgramId) -> Result<Vec<CombinedMinuteRow>, StorageError> {
        scan_prefix(&self.combined_minutes, program_id.to_be_bytes())
    }

    fn cumulative_rows(&self, program_id: ProgramId) -> Result<Vec<CumulativeRow>, StorageError> {
        scan_prefix(&self.cumulative, program_id.to_be_bytes())
    }

    fn dwell_stats(&self, program_id: ProgramId) -> Result<Vec<(Gate, DwellStats)>, StorageError> {
        scan_prefix(&self.dwell_stats, program_id.to_be_bytes())
    }

    fn dwell_samples(&self, program_id: ProgramId) -> Result<Vec<DwellSample>, StorageError> {
        scan_prefix(&self.dwell_samples, program_id.to_be_bytes())
    }

    fn program_stats(&self, program_id: ProgramId) -> Result<Option<ProgramStats>, StorageError> {
        get(&self.program_stats, program_id.to_be_bytes())
    }

    fn recipe_stats(&self, program_id: ProgramId) -> Result<Vec<RecipeStats>, StorageError> {
        scan_prefix(&self.recipe_stats, program_id.to_be_bytes())
    }

    fn backend_name(&self) -> &'static str {
        "sled"
    }
}
