//! Input events and time bucketing: PieceEvent, BatchEvent, MinuteKey

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Physical discharge point on the line.
pub type Gate = u32;

/// Gate 0 is the reject path.
pub const REJECT_GATE: Gate = 0;

pub type RecipeId = u64;
pub type ProgramId = u64;
pub type RunConfigId = u64;
pub type BatchId = u64;

// ============================================================================
// Minute Buckets
// ============================================================================

/// Floor-to-minute bucket, stored as whole minutes since the Unix epoch.
///
/// Ordering matches wall-clock ordering, and the big-endian encoding of the
/// inner value sorts chronologically (used for storage keys).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MinuteKey(i64);

impl MinuteKey {
    /// Bucket containing `ts`.
    pub fn of(ts: DateTime<Utc>) -> Self {
        Self(ts.timestamp().div_euclid(60))
    }

    pub const fn from_index(index: i64) -> Self {
        Self(index)
    }

    pub const fn index(self) -> i64 {
        self.0
    }

    /// First instant of the bucket.
    pub fn start(self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.0.saturating_mul(60), 0).unwrap_or_default()
    }

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub const fn prev(self) -> Self {
        Self(self.0 - 1)
    }

    /// Number of whole minutes from `earlier` to `self` (negative if `earlier` is later).
    pub const fn minutes_since(self, earlier: Self) -> i64 {
        self.0 - earlier.0
    }
}

impl std::fmt::Display for MinuteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.start().format("%Y-%m-%dT%H:%MZ"))
    }
}

// ============================================================================
// Piece Events
// ============================================================================

/// A single weighed piece routed to a gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PieceEvent {
    #[serde(alias = "time")]
    pub timestamp: DateTime<Utc>,
    pub weight_g: f64,
    /// Missing gate means the piece was rejected.
    #[serde(default)]
    pub gate: Gate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub piece_id: Option<String>,
}

impl PieceEvent {
    pub fn new(timestamp: DateTime<Utc>, weight_g: f64, gate: Gate) -> Self {
        Self {
            timestamp,
            weight_g,
            gate,
            piece_id: None,
        }
    }

    pub const fn is_reject(&self) -> bool {
        self.gate == REJECT_GATE
    }

    pub fn minute(&self) -> MinuteKey {
        MinuteKey::of(self.timestamp)
    }
}

// ============================================================================
// Batch Events
// ============================================================================

/// Completion of one accumulation cycle on a gate.
///
/// `id` is assigned by ingestion and increases monotonically; the worker
/// polls with it as a cursor. `recipe_id` and `program_id` are stamped by
/// ingestion when known and are what recovery falls back on.
/// `window_minute` is the minute window the live aggregation counted the
/// batch in, which differs from its completion minute when it arrived after
/// that minute had closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEvent {
    pub id: BatchId,
    pub gate: Gate,
    pub weight_g: f64,
    #[serde(alias = "piece_count")]
    pub pieces: u32,
    #[serde(alias = "timestamp")]
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipe_id: Option<RecipeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program_id: Option<ProgramId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_minute: Option<MinuteKey>,
}

impl BatchEvent {
    pub fn new(id: BatchId, gate: Gate, weight_g: f64, pieces: u32, completed_at: DateTime<Utc>) -> Self {
        Self {
            id,
            gate,
            weight_g,
            pieces,
            completed_at,
            recipe_id: None,
            program_id: None,
            window_minute: None,
        }
    }

    pub const fn with_recipe(mut self, recipe_id: RecipeId) -> Self {
        self.recipe_id = Some(recipe_id);
        self
    }

    pub const fn with_program(mut self, program_id: ProgramId) -> Self {
        self.program_id = Some(program_id);
        self
    }

    pub const fn is_reject(&self) -> bool {
        self.gate == REJECT_GATE
    }

    pub const fn with_window(mut self, minute: MinuteKey) -> Self {
        self.window_minute = Some(minute);
        self
    }

    /// Minute window this batch belongs to: the stamped window when there
    /// is one, otherwise its completion minute.
    pub fn minute(&self) -> MinuteKey {
        self.window_minute
            .unwrap_or_else(|| MinuteKey::of(self.completed_at))
    }
}
