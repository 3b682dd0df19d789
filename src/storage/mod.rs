//! KPI Storage
//!
//! The store is the single source of truth for idempotency: raw events are
//! read from it, and every output row is an upsert keyed by program plus the
//! row's natural key, so re-processing after a restart overwrites instead of
//! duplicating.
//!
//! Two backends implement [`KpiStore`]:
//! - [`SledStore`]: durable, one sled tree per table
//! - [`MemoryStore`]: `RwLock`-guarded maps for tests and dry runs

pub mod lockfile;
mod memory;
mod sled_store;

pub use lockfile::ProcessLock;
pub use memory::MemoryStore;
pub use sled_store::SledStore;

use chrono::{DateTime, Utc};

use crate::kpi::DwellStats;
use crate::recipe::Recipe;
use crate::types::{
    BatchEvent, BatchId, CombinedMinuteRow, CumulativeRow, DwellSample, Gate, PieceEvent, Program,
    ProgramId, ProgramStats, RecipeMinuteRow, RecipeStats, RunConfig,
};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt record in {tree}: {reason}")]
    Corrupt { tree: &'static str, reason: String },
}

// ============================================================================
// Store Trait
// ============================================================================

/// Monotonic id sequences persisted with the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sequence {
    Program,
    RunConfig,
    Recipe,
}

impl Sequence {
    const fn key(self) -> &'static str {
        match self {
            Sequence::Program => "program",
            Sequence::RunConfig => "run_config",
            Sequence::Recipe => "recipe",
        }
    }
}

/// Storage operations used by the lifecycle manager, the poll loop and the
/// replay driver.
///
/// Time ranges are half-open: `from` inclusive, `until` exclusive, and
/// `until == None` is unbounded.
pub trait KpiStore: Send + Sync {
    /// Next value of `seq`, starting at 1.
    fn next_id(&self, seq: Sequence) -> Result<u64, StorageError>;

    // --- Recipes ---

    fn put_recipe(&self, recipe: &Recipe) -> Result<(), StorageError>;
    fn load_recipes(&self) -> Result<Vec<Recipe>, StorageError>;

    // --- Programs and run configs ---

    fn put_program(&self, program: &Program) -> Result<(), StorageError>;
    fn get_program(&self, id: ProgramId) -> Result<Option<Program>, StorageError>;
    /// All programs in id order.
    fn list_programs(&self) -> Result<Vec<Program>, StorageError>;

    fn put_run_config(&self, config: &RunConfig) -> Result<(), StorageError>;
    /// Run configs of a program ordered by activation time, then id.
    fn run_configs(&self, program_id: ProgramId) -> Result<Vec<RunConfig>, StorageError>;

    // --- Raw events ---

    /// Insert or replace a piece record. A piece is identified by its
    /// timestamp plus `piece_id`, or plus gate and weight when it has no id,
    /// so storing the same log twice keeps one copy.
    fn put_piece(&self, piece: &PieceEvent) -> Result<(), StorageError>;
    /// Insert or replace a batch record by id.
    fn put_batch(&self, batch: &BatchEvent) -> Result<(), StorageError>;
    /// Pieces in `[from, until)` ordered by time, then identity.
    fn pieces_between(
        &self,
        from: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<PieceEvent>, StorageError>;
    /// Batches with id strictly greater than `cursor`, in id order.
    fn batches_after(&self, cursor: Option<BatchId>) -> Result<Vec<BatchEvent>, StorageError>;
    /// Batches completed in `[from, until)` ordered by time, then id.
    fn batches_between(
        &self,
        from: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<BatchEvent>, StorageError>;
    fn latest_batch_id(&self) -> Result<Option<BatchId>, StorageError>;

    /// A program's batch history: batches in `[from, until)` that carry its id
    /// or carry no program id at all.
    fn program_batches(
        &self,
        program_id: ProgramId,
        from: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<BatchEvent>, StorageError> {
        Ok(self
            .batches_between(from, until)?
            .into_iter()
            .filter(|b| b.program_id.map_or(true, |p| p == program_id))
            .collect())
    }

    // --- KPI outputs (upserts) ---

    fn put_recipe_minute(&self, program_id: ProgramId, row: &RecipeMinuteRow) -> Result<(), StorageError>;
    fn put_combined_minute(&self, program_id: ProgramId, row: &CombinedMinuteRow) -> Result<(), StorageError>;
    fn put_cumulative(&self, program_id: ProgramId, row: &CumulativeRow) -> Result<(), StorageError>;
    fn put_dwell_stats(&self, program_id: ProgramId, gate: Gate, stats: &DwellStats) -> Result<(), StorageError>;
    fn put_dwell_sample(&self, program_id: ProgramId, sample: &DwellSample) -> Result<(), StorageError>;
    fn put_program_stats(&self, stats: &ProgramStats) -> Result<(), StorageError>;
    fn put_recipe_stats(&self, stats: &RecipeStats) -> Result<(), StorageError>;

    fn recipe_minutes(&self, program_id: ProgramId) -> Result<Vec<RecipeMinuteRow>, StorageError>;
    fn combined_minutes(&self, program_id: ProgramId) -> Result<Vec<CombinedMinuteRow>, StorageError>;
    fn cumulative_rows(&self, program_id: ProgramId) -> Result<Vec<CumulativeRow>, StorageError>;
    fn dwell_stats(&self, program_id: ProgramId) -> Result<Vec<(Gate, DwellStats)>, StorageError>;
    fn dwell_samples(&self, program_id: ProgramId) -> Result<Vec<DwellSample>, StorageError>;
    fn program_stats(&self, program_id: ProgramId) -> Result<Option<ProgramStats>, StorageError>;
    fn recipe_stats(&self, program_id: ProgramId) -> Result<Vec<RecipeStats>, StorageError>;

    /// Backend name for logging.
    fn backend_name(&self) -> &'static str;
}

// ============================================================================
// Key Encoding
// ============================================================================

/// Order-preserving 8-byte encoding of a signed value (sign bit flipped).
#[allow(clippy::cast_sign_loss)]
pub(crate) const fn ordered_i64(value: i64) -> [u8; 8] {
    ((value as u64) ^ (1 << 63)).to_be_bytes()
}

/// Microsecond timestamp key; sorts chronologically.
pub(crate) fn time_key(ts: DateTime<Utc>) -> [u8; 8] {
    ordered_i64(ts.timestamp_micros())
}

/// Key suffix that tells pieces with the same timestamp apart.
pub(crate) fn piece_identity(piece: &PieceEvent) -> Vec<u8> {
    match &piece.piece_id {
        Some(id) => [&[1u8][..], id.as_bytes()].concat(),
        None => [
            &[0u8][..],
            &piece.gate.to_be_bytes(),
            &piece.weight_g.to_bits().to_be_bytes(),
        ]
        .concat(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_ordered_i64_preserves_order() {
        let values = [i64::MIN, -60, -1, 0, 1, 60, i64::MAX];
        for pair in values.windows(2) {
            assert!(ordered_i64(pair[0]) < ordered_i64(pair[1]));
        }
    }

    #[test]
    fn test_piece_identity_prefers_piece_id() {
        let at = Utc.with_ymd_and_hms(2025, 5, 1, 8, 0, 0).unwrap();
        let plain = PieceEvent::new(at, 120.0, 1);
        assert_eq!(piece_identity(&plain), piece_identity(&plain.clone()));
        assert_ne!(piece_identity(&plain), piece_identity(&PieceEvent::new(at, 120.0, 2)));

        let tagged = PieceEvent {
            piece_id: Some("p-17".to_string()),
            ..plain.clone()
        };
        let reweighed = PieceEvent {
            weight_g: 121.0,
            ..tagged.clone()
        };
        assert_eq!(piece_identity(&tagged), piece_identity(&reweighed));
    }

    #[test]
    fn test_time_key_sorts_before_epoch() {
        let before = Utc.with_ymd_and_hms(1969, 12, 31, 23, 59, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2025, 5, 1, 8, 0, 0).unwrap();
        assert!(time_key(before) < time_key(after));
    }
}
