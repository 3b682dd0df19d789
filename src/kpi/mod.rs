//! Windowed KPI aggregation
//!
//! Pure computation only: batch evaluation, minute windows, per-minute and
//! cumulative records, and dwell statistics. Persistence and scheduling live
//! in [`crate::lifecycle`].

pub mod cumulative;
pub mod dwell;
pub mod engine;
pub mod evaluator;
pub mod minute;
pub mod window;

pub use cumulative::{CumulativeRecipeState, CumulativeTracker};
pub use dwell::{DwellStats, DwellTracker};
pub use engine::{merge_events, BatchOutcome, EngineEvent, KpiEngine, MinuteReport};
pub use evaluator::{evaluate_batch, giveaway_pct, giveaway_weight, BatchFill, FillSummary};
pub use minute::MinuteKpis;
pub use window::{MinuteWindow, WindowAggregator};
