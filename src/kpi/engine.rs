//! KPI Engine
//!
//! Single owner of the window, cumulative, dwell and reject state of one
//! program. The live worker, the full-history recompute and the offline
//! replay driver all feed events through this type, so the three paths
//! share one implementation of the aggregation math.
//!
//! The engine is pure: it performs no I/O and returns the records to persist.

use chrono::{DateTime, Utc};
use tracing::debug;

use super::cumulative::CumulativeTracker;
use super::dwell::DwellTracker;
use super::minute::MinuteKpis;
use super::window::{MinuteWindow, WindowAggregator};
use crate::recipe::RecipeCatalog;
use crate::types::{
    BatchEvent, CombinedMinuteRow, CumulativeRow, DwellSample, GateAssignment, MinuteKey,
    PieceEvent, RecipeMinuteRow,
};

/// One raw event in engine feed order.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Piece(PieceEvent),
    Batch(BatchEvent),
}

impl EngineEvent {
    pub const fn timestamp(&self) -> DateTime<Utc> {
        match self {
            EngineEvent::Piece(p) => p.timestamp,
            EngineEvent::Batch(b) => b.completed_at,
        }
    }

    fn order_key(&self) -> (MinuteKey, DateTime<Utc>, u8, u64) {
        match self {
            EngineEvent::Piece(p) => (p.minute(), p.timestamp, 0, 0),
            EngineEvent::Batch(b) => (b.minute(), b.completed_at, 1, b.id),
        }
    }
}

/// Merge pieces and batches into feed order: by minute window, then time,
/// pieces before batches at equal instants, batches by id. A batch stamped
/// with a later window sorts into that window. The sort is stable, so pieces
/// keep their stored order. Live ingest, recompute and replay all use this
/// order, which is what makes their results agree.
pub fn merge_events(pieces: Vec<PieceEvent>, batches: Vec<BatchEvent>) -> Vec<EngineEvent> {
    let mut events: Vec<EngineEvent> = pieces
        .into_iter()
        .map(EngineEvent::Piece)
        .chain(batches.into_iter().map(EngineEvent::Batch))
        .collect();
    events.sort_by_key(EngineEvent::order_key);
    events
}

/// Everything emitted when one minute window closes.
#[derive(Debug, Clone, PartialEq)]
pub struct MinuteReport {
    pub minute: MinuteKey,
    pub recipe_rows: Vec<RecipeMinuteRow>,
    pub combined: CombinedMinuteRow,
    pub cumulative_rows: Vec<CumulativeRow>,
}

/// Result of ingesting one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub reports: Vec<MinuteReport>,
    pub dwell: Option<DwellSample>,
}

#[derive(Debug)]
pub struct KpiEngine {
    windows: WindowAggregator,
    cumulative: CumulativeTracker,
    dwell: DwellTracker,
    assignment: GateAssignment,
    rejects_count: u64,
    rejects_weight_g: f64,
    max_gap_minutes: u32,
}

impl KpiEngine {
    pub fn new(max_gap_minutes: u32) -> Self {
        Self {
            windows: WindowAggregator::new(max_gap_minutes),
            cumulative: CumulativeTracker::new(),
            dwell: DwellTracker::new(),
            assignment: GateAssignment::new(),
            rejects_count: 0,
            rejects_weight_g: 0.0,
            max_gap_minutes,
        }
    }

    pub const fn assignment(&self) -> &GateAssignment {
        &self.assignment
    }

    /// Replace the gate map. Callers flush first so the open window is
    /// evaluated under the assignment it was collected with.
    pub fn set_assignment(&mut self, assignment: GateAssignment) {
        self.assignment = assignment;
    }

    /// Start a new program: all program-scoped state goes back to zero.
    pub fn reset(&mut self, assignment: GateAssignment) {
        self.windows = WindowAggregator::new(self.max_gap_minutes);
        self.cumulative.reset();
        self.dwell.reset();
        self.rejects_count = 0;
        self.rejects_weight_g = 0.0;
        self.assignment = assignment;
    }

    pub fn ingest(&mut self, event: EngineEvent, catalog: &RecipeCatalog) -> BatchOutcome {
        match event {
            EngineEvent::Piece(piece) => BatchOutcome {
                reports: self.ingest_piece(piece, catalog),
                dwell: None,
            },
            EngineEvent::Batch(batch) => self.ingest_batch(batch, catalog),
        }
    }

    pub fn ingest_piece(&mut self, piece: PieceEvent, catalog: &RecipeCatalog) -> Vec<MinuteReport> {
        let closed = self.windows.add_piece(piece);
        self.close_all(closed, catalog)
    }

    pub fn ingest_batch(&mut self, batch: BatchEvent, catalog: &RecipeCatalog) -> BatchOutcome {
        let dwell = self.dwell.observe_batch(&batch);
        let closed = self.windows.add_batch(batch);
        BatchOutcome {
            reports: self.close_all(closed, catalog),
            dwell,
        }
    }

    /// Wall-clock rollover: close every minute before `minute`.
    pub fn advance_to(&mut self, minute: MinuteKey, catalog: &RecipeCatalog) -> Vec<MinuteReport> {
        let closed = self.windows.advance_to(minute);
        self.close_all(closed, catalog)
    }

    /// Close the open window, if any.
    pub fn flush(&mut self, catalog: &RecipeCatalog) -> Option<MinuteReport> {
        let window = self.windows.flush()?;
        Some(self.close(&window, catalog))
    }

    pub const fn cumulative(&self) -> &CumulativeTracker {
        &self.cumulative
    }

    pub const fn dwell(&self) -> &DwellTracker {
        &self.dwell
    }

    /// `(count, weight)` of reject-gate pieces in closed windows.
    pub const fn reject_totals(&self) -> (u64, f64) {
        (self.rejects_count, self.rejects_weight_g)
    }

    pub fn open_minute(&self) -> Option<MinuteKey> {
        self.windows.open_minute()
    }

    /// Window an event completed in `minute` would be counted in now.
    pub fn window_for(&self, minute: MinuteKey) -> MinuteKey {
        self.windows.window_for(minute)
    }

    pub const fn late_events(&self) -> u64 {
        self.windows.late_events()
    }

    fn close_all(&mut self, windows: Vec<MinuteWindow>, catalog: &RecipeCatalog) -> Vec<MinuteReport> {
        windows.iter().map(|w| self.close(w, catalog)).collect()
    }

    fn close(&mut self, window: &MinuteWindow, catalog: &RecipeCatalog) -> MinuteReport {
        let kpis = MinuteKpis::compute(window, &self.assignment, catalog);
        self.rejects_count += kpis.rejects;
        self.rejects_weight_g += kpis.reject_weight_g;
        let cumulative_rows = self.cumulative.record_minute(kpis.minute, &kpis.fills, catalog);
        debug!(
            minute = %kpis.minute,
            pieces = kpis.piece_count,
            batches = kpis.batch_count,
            rejects = kpis.rejects,
            "[Engine] Closed minute"
        );
        MinuteReport {
            minute: kpis.minute,
            combined: kpis.combined_row(self.rejects_count, self.rejects_weight_g),
            recipe_rows: kpis.recipe_rows,
            cumulative_rows,
        }
    }
}
