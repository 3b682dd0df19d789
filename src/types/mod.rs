//! Shared data structures for batching-line KPI aggregation
//!
//! This module defines the core types flowing through the engine:
//! - Input: PieceEvent, BatchEvent (materialized by ingestion)
//! - Scoping: Program, RunConfig, GateAssignment
//! - Output: per-minute recipe/combined rows, cumulative rows, lifetime stats

mod events;
mod program;
mod kpi;

pub use events::*;
pub use program::*;
pub use kpi::*;
