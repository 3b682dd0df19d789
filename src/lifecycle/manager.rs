//! Program Lifecycle Manager
//!
//! Owns the active program, its run config and the [`KpiEngine`]. All window,
//! cumulative and dwell mutation goes through here, from a single task.
//!
//! ```text
//! NoProgram -> Active(program, config) -> Active(program, config')   reassign
//!                  |
//!                  +-> Ended(program) -> Active(next, ...)            switch
//! ```
//!
//! Output rows are queued and written after each step. A failed write stays
//! queued and is retried on the next call, so a store outage never loses
//! rows or blocks aggregation.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::recovery::{recover_open_programs, RecoveryReport};
use super::schedule::ScheduleError;
use super::totals::{finalize_program, ProgramTotals};
use crate::config::MAX_PENDING_WRITES;
use crate::kpi::{merge_events, DwellStats, EngineEvent, KpiEngine, MinuteReport};
use crate::recipe::{Recipe, RecipeCatalog, RecipeSpec};
use crate::storage::{KpiStore, Sequence, StorageError};
use crate::types::{
    BatchEvent, CombinedMinuteRow, ConfigSource, CumulativeRow, DwellSample, Gate, GateAssignment,
    MinuteKey, PieceEvent, Program, ProgramId, RecipeId, RecipeMinuteRow, RunConfig, REJECT_GATE,
};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("No active program")]
    NoActiveProgram,

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),
}

// ============================================================================
// Notifications
// ============================================================================

/// Side effects for the companion service, dispatched by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A batch closed on `gate`; its in-memory accumulation can be dropped.
    GateReset { gate: Gate, timestamp: DateTime<Utc> },
    /// A new gate map is active.
    ReloadAssignments,
}

// ============================================================================
// Pending Writes
// ============================================================================

#[derive(Debug, Clone)]
enum PendingWrite {
    Batch(BatchEvent),
    RecipeMinute(ProgramId, RecipeMinuteRow),
    CombinedMinute(ProgramId, CombinedMinuteRow),
    Cumulative(ProgramId, CumulativeRow),
    DwellSample(ProgramId, DwellSample),
    DwellStats(ProgramId, Gate, DwellStats),
}

impl PendingWrite {
    fn apply<S: KpiStore + ?Sized>(&self, store: &S) -> Result<(), StorageError> {
        match self {
            PendingWrite::Batch(batch) => store.put_batch(batch),
            PendingWrite::RecipeMinute(program, row) => store.put_recipe_minute(*program, row),
            PendingWrite::CombinedMinute(program, row) => store.put_combined_minute(*program, row),
            PendingWrite::Cumulative(program, row) => store.put_cumulative(*program, row),
            PendingWrite::DwellSample(program, sample) => store.put_dwell_sample(*program, sample),
            PendingWrite::DwellStats(program, gate, stats) => store.put_dwell_stats(*program, *gate, stats),
        }
    }
}

// ============================================================================
// Manager
// ============================================================================

/// A program whose switch went through but whose finalize failed.
#[derive(Debug, Clone)]
struct DeferredEnd {
    program: Program,
    end_ts: DateTime<Utc>,
    until: Option<DateTime<Utc>>,
}

/// The running program and the config currently applied to it.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveProgram {
    pub program: Program,
    pub config: RunConfig,
}

pub struct LifecycleManager<S: KpiStore + ?Sized> {
    store: Arc<S>,
    catalog: RecipeCatalog,
    engine: KpiEngine,
    active: Option<ActiveProgram>,
    pending: VecDeque<PendingWrite>,
    deferred: Vec<DeferredEnd>,
    max_gap_minutes: u32,
}

impl<S: KpiStore + ?Sized> LifecycleManager<S> {
    /// Load the recipe catalog from the store.
    pub fn new(store: Arc<S>, max_gap_minutes: u32) -> Result<Self, LifecycleError> {
        let catalog = RecipeCatalog::from_recipes(store.load_recipes()?);
        info!(
            recipes = catalog.len(),
            backend = store.backend_name(),
            "[Lifecycle] Recipe catalog loaded"
        );
        Ok(Self {
            store,
            catalog,
            engine: KpiEngine::new(max_gap_minutes),
            active: None,
            pending: VecDeque::new(),
            deferred: Vec::new(),
            max_gap_minutes,
        })
    }

    pub const fn catalog(&self) -> &RecipeCatalog {
        &self.catalog
    }

    pub const fn active(&self) -> Option<&ActiveProgram> {
        self.active.as_ref()
    }

    pub const fn engine(&self) -> &KpiEngine {
        &self.engine
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Rows waiting for the store to accept them.
    pub fn pending_writes(&self) -> usize {
        self.pending.len()
    }

    /// Close programs a previous run left open. Call before the first switch.
    pub fn recover(&mut self) -> Result<RecoveryReport, LifecycleError> {
        Ok(recover_open_programs(
            self.store.as_ref(),
            &self.catalog,
            self.max_gap_minutes,
        )?)
    }

    /// Map gate numbers to catalogued recipes, creating unseen ones.
    ///
    /// Unparseable names and the reject gate are skipped with a warning;
    /// those gates stay outside recipe-scoped aggregation.
    pub fn resolve_assignment(
        &mut self,
        names: &BTreeMap<Gate, String>,
    ) -> Result<GateAssignment, LifecycleError> {
        let mut assignment = GateAssignment::new();
        for (&gate, name) in names {
            if gate == REJECT_GATE {
                warn!("[Lifecycle] Ignoring recipe '{}' on reject gate", name);
                continue;
            }
            let spec: RecipeSpec = match name.parse() {
                Ok(spec) => spec,
                Err(e) => {
                    warn!(gate, "[Lifecycle] Gate excluded: {}", e);
                    continue;
                }
            };
            let recipe_id = match self.catalog.id_of(&spec) {
                Some(id) => id,
                None => self.register_recipe(spec)?,
            };
            assignment.assign(gate, recipe_id);
        }
        Ok(assignment)
    }

    /// Allocate a persisted id, write the recipe, then catalogue it. A failed
    /// write leaves the catalog untouched so the next call retries.
    fn register_recipe(&mut self, spec: RecipeSpec) -> Result<RecipeId, StorageError> {
        // Ids already taken by recipes stored before the sequence existed are skipped.
        let id = loop {
            let id = self.store.next_id(Sequence::Recipe)?;
            if self.catalog.get(id).is_none() {
                break id;
            }
        };
        let recipe = Recipe {
            id,
            name: spec.canonical_name(),
            spec,
        };
        self.store.put_recipe(&recipe)?;
        info!(recipe_id = id, recipe = %recipe.name, "[Lifecycle] New recipe");
        Ok(self.catalog.insert(recipe))
    }

    /// End the active program (if any) and start a new one with `names`.
    ///
    /// `label` names the program; it defaults to `program_YYYYMMDD_HHMMSS`.
    /// The new program and its run config are written before anything is
    /// ended, so on error the previous program stays active and the switch
    /// can be retried. A finalize that fails after that point is retried on
    /// later rollovers.
    pub fn switch_program(
        &mut self,
        names: &BTreeMap<Gate, String>,
        now: DateTime<Utc>,
        label: Option<&str>,
        source: ConfigSource,
    ) -> Result<Vec<Notification>, LifecycleError> {
        let assignment = self.resolve_assignment(names)?;

        let name = label.map_or_else(|| Program::name_for(now), str::to_string);
        let program = Program {
            id: self.store.next_id(Sequence::Program)?,
            name,
            start_ts: now,
            end_ts: None,
        };
        let config = RunConfig {
            id: self.store.next_id(Sequence::RunConfig)?,
            program_id: program.id,
            name: format!("{}-{}", program.name, source),
            source,
            activated_at: now,
            assignment,
        };
        self.store.put_program(&program)?;
        self.store.put_run_config(&config)?;

        if let Some(previous) = self.active.take() {
            if let Some(report) = self.engine.flush(&self.catalog) {
                self.queue_report(previous.program.id, report);
            }
            self.persist_pending();
            if let Err(e) = self.close_program(&previous, now, Some(now)) {
                warn!(
                    program_id = previous.program.id,
                    "[Lifecycle] Finalize failed, will retry: {}", e
                );
                self.deferred.push(DeferredEnd {
                    program: previous.program,
                    end_ts: now,
                    until: Some(now),
                });
            }
        }

        info!(
            program_id = program.id,
            program = %program.name,
            gates = config.assignment.len(),
            "[Lifecycle] Program started"
        );
        self.engine.reset(config.assignment.clone());
        self.active = Some(ActiveProgram { program, config });
        Ok(vec![Notification::ReloadAssignments])
    }

    /// Apply a new gate map within the active program. Cumulative, dwell
    /// and reject state carry over.
    pub fn reassign(
        &mut self,
        names: &BTreeMap<Gate, String>,
        now: DateTime<Utc>,
        source: ConfigSource,
    ) -> Result<Vec<Notification>, LifecycleError> {
        let program_id = self
            .active
            .as_ref()
            .map(|a| a.program.id)
            .ok_or(LifecycleError::NoActiveProgram)?;
        let assignment = self.resolve_assignment(names)?;

        let config = RunConfig {
            id: self.store.next_id(Sequence::RunConfig)?,
            program_id,
            name: format!("reassign-{}", now.format("%Y%m%d_%H%M%S")),
            source,
            activated_at: now,
            assignment,
        };
        self.store.put_run_config(&config)?;

        if let Some(report) = self.engine.flush(&self.catalog) {
            self.queue_report(program_id, report);
        }
        self.engine.set_assignment(config.assignment.clone());
        if let Some(active) = self.active.as_mut() {
            active.config = config;
        }
        info!(program_id, "[Lifecycle] Gate assignment changed");
        self.persist_pending();
        Ok(vec![Notification::ReloadAssignments])
    }

    /// Feed one poll's worth of events, merged into time order.
    pub fn ingest(&mut self, pieces: Vec<PieceEvent>, batches: Vec<BatchEvent>) -> Vec<Notification> {
        let Some(active) = self.active.as_ref() else {
            if !pieces.is_empty() || !batches.is_empty() {
                debug!(
                    pieces = pieces.len(),
                    batches = batches.len(),
                    "[Lifecycle] No active program; events dropped"
                );
            }
            return Vec::new();
        };
        let program_id = active.program.id;

        let mut notifications = Vec::new();
        for event in merge_events(pieces, batches) {
            let event = match event {
                EngineEvent::Batch(batch) => {
                    let batch = self.stamp_batch(program_id, batch);
                    if !batch.is_reject() {
                        notifications.push(Notification::GateReset {
                            gate: batch.gate,
                            timestamp: batch.completed_at,
                        });
                    }
                    EngineEvent::Batch(batch)
                }
                piece => piece,
            };

            let outcome = self.engine.ingest(event, &self.catalog);
            for report in outcome.reports {
                self.queue_report(program_id, report);
            }
            if let Some(sample) = outcome.dwell {
                if let Some(stats) = self.engine.dwell().stats(sample.gate) {
                    self.queue(PendingWrite::DwellStats(program_id, sample.gate, *stats));
                }
                self.queue(PendingWrite::DwellSample(program_id, sample));
            }
        }

        self.persist_pending();
        notifications
    }

    /// Close every minute before `now`'s minute. Returns the number of
    /// windows emitted.
    pub fn roll_over(&mut self, now: DateTime<Utc>) -> usize {
        self.retry_deferred();
        let Some(program_id) = self.active.as_ref().map(|a| a.program.id) else {
            return 0;
        };
        let reports = self.engine.advance_to(MinuteKey::of(now), &self.catalog);
        let closed = reports.len();
        for report in reports {
            self.queue_report(program_id, report);
        }
        self.persist_pending();
        closed
    }

    /// End the active program at `end_ts`, finalizing over `[start, until)`.
    ///
    /// The recomputed totals are authoritative; a divergence from the
    /// incremental state is logged.
    pub fn end_active(
        &mut self,
        end_ts: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Option<ProgramTotals>, LifecycleError> {
        let Some(active) = self.active.clone() else {
            return Ok(None);
        };
        if let Some(report) = self.engine.flush(&self.catalog) {
            self.queue_report(active.program.id, report);
        }
        self.persist_pending();

        let totals = self.close_program(&active, end_ts, until)?;
        self.active = None;
        Ok(Some(totals))
    }

    /// Programs whose finalize is waiting for the store.
    pub fn deferred_ends(&self) -> usize {
        self.deferred.len()
    }

    fn close_program(
        &self,
        active: &ActiveProgram,
        end_ts: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
    ) -> Result<ProgramTotals, LifecycleError> {
        let configs = self.store.run_configs(active.program.id)?;
        let totals = finalize_program(
            self.store.as_ref(),
            &self.catalog,
            &active.program,
            end_ts,
            until,
            &configs,
            self.max_gap_minutes,
        )?;
        self.check_agreement(active.program.id, &totals);

        info!(
            program_id = active.program.id,
            program = %active.program.name,
            late_events = self.engine.late_events(),
            "[Lifecycle] Program ended"
        );
        Ok(totals)
    }

    fn retry_deferred(&mut self) {
        if self.deferred.is_empty() {
            return;
        }
        let deferred = std::mem::take(&mut self.deferred);
        for end in deferred {
            let result = self
                .store
                .run_configs(end.program.id)
                .and_then(|configs| {
                    finalize_program(
                        self.store.as_ref(),
                        &self.catalog,
                        &end.program,
                        end.end_ts,
                        end.until,
                        &configs,
                        self.max_gap_minutes,
                    )
                });
            if let Err(e) = result {
                debug!(program_id = end.program.id, "[Lifecycle] Deferred finalize failed again: {}", e);
                self.deferred.push(end);
            }
        }
    }

    /// Flush the open window and drain queued writes. The program stays
    /// open; recovery closes it on the next start.
    pub fn shutdown(&mut self) {
        if let Some(program_id) = self.active.as_ref().map(|a| a.program.id) {
            if let Some(report) = self.engine.flush(&self.catalog) {
                self.queue_report(program_id, report);
            }
        }
        self.persist_pending();
        if !self.pending.is_empty() {
            warn!(
                pending = self.pending.len(),
                "[Lifecycle] Shutting down with unwritten rows"
            );
        }
    }

    /// Record the program and recipe ids on a batch that ingestion left
    /// unstamped; recovery relies on them. The minute window the batch is
    /// counted in is recorded too, so the full-history recompute buckets a
    /// late batch the same way.
    fn stamp_batch(&mut self, program_id: ProgramId, mut batch: BatchEvent) -> BatchEvent {
        let mut changed = false;
        if batch.window_minute.is_none() {
            let window = self.engine.window_for(MinuteKey::of(batch.completed_at));
            batch.window_minute = Some(window);
            changed = true;
        }
        if batch.program_id.is_none() {
            batch.program_id = Some(program_id);
            changed = true;
        }
        if batch.recipe_id.is_none() {
            if let Some(recipe_id) = self.engine.assignment().recipe_for(batch.gate) {
                batch.recipe_id = Some(recipe_id);
                changed = true;
            }
        }
        if changed {
            self.queue(PendingWrite::Batch(batch.clone()));
        }
        batch
    }

    fn check_agreement(&self, program_id: ProgramId, totals: &ProgramTotals) {
        let incremental = self.engine.cumulative().states();
        let same_keys = incremental.len() == totals.cumulative.len()
            && incremental.keys().eq(totals.cumulative.keys());
        let same_values = same_keys
            && incremental.iter().all(|(id, live)| {
                totals.cumulative.get(id).is_some_and(|full| {
                    live.filled_batches.to_bits() == full.filled_batches.to_bits()
                        && live.actual_weight_g.to_bits() == full.actual_weight_g.to_bits()
                        && live.giveaway_weight_g.to_bits() == full.giveaway_weight_g.to_bits()
                })
            });
        if !same_values {
            warn!(
                program_id,
                incremental_recipes = incremental.len(),
                recomputed_recipes = totals.cumulative.len(),
                "[Lifecycle] Incremental totals differ from full-history recompute; using recompute"
            );
        }
    }

    fn queue_report(&mut self, program_id: ProgramId, report: MinuteReport) {
        for row in report.recipe_rows {
            self.queue(PendingWrite::RecipeMinute(program_id, row));
        }
        self.queue(PendingWrite::CombinedMinute(program_id, report.combined));
        for row in report.cumulative_rows {
            self.queue(PendingWrite::Cumulative(program_id, row));
        }
    }

    fn queue(&mut self, write: PendingWrite) {
        if self.pending.len() >= MAX_PENDING_WRITES {
            self.pending.pop_front();
            warn!("[Lifecycle] Write queue full; dropped oldest row");
        }
        self.pending.push_back(write);
    }

    /// Write queued rows in order, stopping at the first failure.
    fn persist_pending(&mut self) {
        while let Some(write) = self.pending.front() {
            if let Err(e) = write.apply(self.store.as_ref()) {
                warn!(
                    pending = self.pending.len(),
                    "[Lifecycle] Store write failed, will retry: {}", e
                );
                return;
            }
            self.pending.pop_front();
        }
    }
}
