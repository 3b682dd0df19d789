//! Batchline KPI: windowed aggregation and program lifecycle for batching lines
//!
//! Pieces are weighed and routed to gates; a gate closes a batch when its
//! recipe's target is reached. This crate turns those raw events into
//! per-minute giveaway and throughput rows, running cumulative totals per
//! recipe, gate dwell statistics and lifetime totals per program.
//!
//! ## Architecture
//!
//! - **kpi**: pure aggregation engine shared by the worker, the end-of-program
//!   recompute and the offline replay
//! - **lifecycle**: programs, run configs, schedule, recovery
//! - **storage**: `KpiStore` trait with sled and in-memory backends
//! - **pipeline**: the worker's poll loop
//! - **companion**: best-effort HTTP notifications

pub mod companion;
pub mod config;
pub mod kpi;
pub mod lifecycle;
pub mod pipeline;
pub mod recipe;
pub mod replay;
pub mod storage;
pub mod types;

// Re-export configuration
pub use config::WorkerConfig;

// Re-export commonly used types
pub use types::{
    BatchEvent, CombinedMinuteRow, CumulativeRow, GateAssignment, MinuteKey, PieceEvent, Program,
    ProgramStats, RecipeMinuteRow, RecipeStats, RunConfig,
};

// Re-export the engine and lifecycle entry points
pub use kpi::KpiEngine;
pub use lifecycle::{LifecycleManager, Notification};
pub use recipe::{Recipe, RecipeCatalog, RecipeSpec};

// Re-export storage
pub use storage::{KpiStore, MemoryStore, SledStore, StorageError};
