//! KPI output rows: per-minute, cumulative, dwell and lifetime records
//!
//! Every row is persisted as an idempotent upsert keyed by program plus the
//! row's natural key (recipe or gate, and minute or timestamp).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::events::{Gate, MinuteKey, ProgramId, RecipeId};

// ============================================================================
// Per-Minute Rows
// ============================================================================

/// Throughput and giveaway of one recipe during one closed minute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeMinuteRow {
    pub minute: MinuteKey,
    pub recipe_id: RecipeId,
    pub recipe_name: String,
    /// All pieces routed to the recipe's gates, batched or not.
    pub piece_count: u64,
    pub weight_sum_g: f64,
    pub batch_count: u64,
    /// Percent; 0 when no batch closed this minute.
    pub giveaway_pct: f64,
}

/// All-recipe totals for one closed minute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedMinuteRow {
    pub minute: MinuteKey,
    /// Pieces on non-reject gates.
    pub piece_count: u64,
    pub weight_sum_g: f64,
    pub batch_count: u64,
    /// Weighted ratio `Σgiveaway / Σ(actual + giveaway)` over recipes with batches, in percent.
    pub giveaway_pct: f64,
    pub rejects_this_minute: u64,
    pub reject_weight_this_minute_g: f64,
    /// Running reject totals for the active program, including this minute.
    pub total_rejects_count: u64,
    pub total_rejects_weight_g: f64,
}

/// Program-to-date totals of one recipe, re-emitted every minute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CumulativeRow {
    pub minute: MinuteKey,
    pub recipe_id: RecipeId,
    pub recipe_name: String,
    /// Filled-batch equivalents rounded for display.
    pub total_batches: u64,
    pub filled_batches: f64,
    pub actual_weight_g: f64,
    pub giveaway_weight_g: f64,
    pub giveaway_per_batch_g: f64,
    pub giveaway_pct_avg: f64,
}

// ============================================================================
// Dwell
// ============================================================================

/// Time between two consecutive batch completions on the same gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DwellSample {
    pub gate: Gate,
    pub dwell_seconds: f64,
    pub batch_timestamp: DateTime<Utc>,
}

// ============================================================================
// Lifetime Totals
// ============================================================================

/// Lifetime totals of one recipe within one program.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecipeStats {
    pub program_id: ProgramId,
    pub recipe_id: RecipeId,
    pub recipe_name: String,
    /// Comma-joined ascending gate numbers.
    pub gates_assigned: String,
    pub total_batches: f64,
    pub total_batched_weight_g: f64,
    pub total_giveaway_weight_g: f64,
    pub total_actual_weight_g: f64,
    pub total_items_batched: u64,
    /// Pieces inside the recipe's piece bounds that went to other gates.
    pub total_items_rejected: u64,
    pub total_reject_weight_g: f64,
}

/// Lifetime totals of one program.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgramStats {
    pub program_id: ProgramId,
    pub start_ts: Option<DateTime<Utc>>,
    pub end_ts: Option<DateTime<Utc>>,
    pub total_batches: f64,
    pub total_batched_weight_g: f64,
    pub total_giveaway_weight_g: f64,
    pub total_items_batched: u64,
    /// Reject-gate pieces over the program span.
    pub total_items_rejected: u64,
    pub total_reject_weight_g: f64,
}
