//! Worker poll loop.
//!
//! Each tick, in order:
//! 1. poll new pieces and batches from the source
//! 2. feed them to the lifecycle manager (merged into time order)
//! 3. close every minute before the current one
//! 4. switch program if the schedule says so
//!
//! Nothing in a tick is fatal: source and store failures are logged and the
//! next tick retries.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::source::EventSource;
use crate::companion::{dispatch, CompanionNotifier};
use crate::lifecycle::{LifecycleError, LifecycleManager, ProgramSchedule};
use crate::storage::KpiStore;
use crate::types::{ConfigSource, Gate};

/// Counters for one worker run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub ticks: u64,
    pub pieces: u64,
    pub batches: u64,
    pub windows_closed: u64,
    pub program_switches: u64,
    pub errors: u64,
}

/// Owns the lifecycle manager and drives it from an [`EventSource`].
///
/// Built with [`new()`](WorkerLoop::new), optionally given a schedule with
/// [`with_schedule()`](WorkerLoop::with_schedule), started with
/// [`start()`](WorkerLoop::start) and consumed by [`run()`](WorkerLoop::run).
pub struct WorkerLoop<S: KpiStore + ?Sized, E: EventSource> {
    manager: LifecycleManager<S>,
    source: E,
    schedule: Option<ProgramSchedule>,
    notifier: Arc<dyn CompanionNotifier>,
    cancel_token: CancellationToken,
    poll_interval: Duration,
    stats: LoopStats,
}

impl<S: KpiStore + ?Sized, E: EventSource> WorkerLoop<S, E> {
    pub fn new(
        manager: LifecycleManager<S>,
        source: E,
        notifier: Arc<dyn CompanionNotifier>,
        cancel_token: CancellationToken,
        poll_interval: Duration,
    ) -> Self {
        Self {
            manager,
            source,
            schedule: None,
            notifier,
            cancel_token,
            poll_interval,
            stats: LoopStats::default(),
        }
    }

    pub fn with_schedule(mut self, schedule: ProgramSchedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub const fn manager(&self) -> &LifecycleManager<S> {
        &self.manager
    }

    pub const fn stats(&self) -> LoopStats {
        self.stats
    }

    /// Activate the first schedule entry, or `default_assignment` when
    /// there is no schedule.
    pub fn start(
        &mut self,
        now: DateTime<Utc>,
        default_assignment: &BTreeMap<Gate, String>,
    ) -> Result<(), LifecycleError> {
        let names = match self.schedule.as_mut() {
            Some(schedule) => {
                let entry = schedule.start(now);
                info!(entry = %entry.program_id, "[Worker] Starting from schedule");
                entry.gate_names()?
            }
            None => {
                if default_assignment.is_empty() {
                    warn!("[Worker] No schedule and no default assignment; all gates unassigned");
                }
                default_assignment.clone()
            }
        };
        let notes = self.manager.switch_program(&names, now, None, ConfigSource::Schedule)?;
        dispatch(&self.notifier, notes);
        Ok(())
    }

    /// One poll cycle at `now`.
    pub async fn tick(&mut self, now: DateTime<Utc>) {
        self.stats.ticks += 1;

        let pieces = match self.source.poll_pieces(now).await {
            Ok(p) => p,
            Err(e) => {
                warn!(source = self.source.source_name(), "[Worker] Piece poll failed: {}", e);
                self.stats.errors += 1;
                Vec::new()
            }
        };
        let batches = match self.source.poll_batches().await {
            Ok(b) => b,
            Err(e) => {
                warn!(source = self.source.source_name(), "[Worker] Batch poll failed: {}", e);
                self.stats.errors += 1;
                Vec::new()
            }
        };
        self.stats.pieces += pieces.len() as u64;
        self.stats.batches += batches.len() as u64;

        let notes = self.manager.ingest(pieces, batches);
        dispatch(&self.notifier, notes);

        let closed = self.manager.roll_over(now);
        self.stats.windows_closed += closed as u64;
        if closed > 0 {
            debug!(closed, pending = self.manager.pending_writes(), "[Worker] Minutes closed");
        }

        self.switch_if_due(now);
    }

    /// Activate the next schedule entry once it is due. An entry with the
    /// same `program_id` as the current one re-assigns gates within the
    /// running program; any other entry starts a new program.
    fn switch_if_due(&mut self, now: DateTime<Utc>) {
        let Some(schedule) = self.schedule.as_ref() else {
            return;
        };
        if !schedule.is_due(now) {
            return;
        }
        let entry = schedule.peek_next().clone();
        let same_program = schedule.current().program_id == entry.program_id;
        let result = entry.gate_names().map_err(LifecycleError::from).and_then(|names| {
            if same_program {
                self.manager.reassign(&names, now, ConfigSource::Schedule)
            } else {
                self.manager.switch_program(&names, now, None, ConfigSource::Schedule)
            }
        });

        match result {
            Ok(notes) => {
                if let Some(schedule) = self.schedule.as_mut() {
                    schedule.advance(now);
                }
                if same_program {
                    info!(entry = %entry.program_id, "[Worker] Scheduled gate re-assignment");
                } else {
                    self.stats.program_switches += 1;
                    info!(entry = %entry.program_id, "[Worker] Scheduled program switch");
                }
                dispatch(&self.notifier, notes);
            }
            Err(e) => {
                // Schedule not advanced; the switch is retried next tick.
                warn!(entry = %entry.program_id, "[Worker] Program switch failed: {}", e);
                self.stats.errors += 1;
            }
        }
    }

    /// Tick every poll interval until cancelled, then flush.
    ///
    /// The active program is left open; the next start's recovery closes it.
    pub async fn run(mut self) -> LoopStats {
        info!(
            source = self.source.source_name(),
            interval_secs = self.poll_interval.as_secs(),
            "[Worker] Poll loop started"
        );

        loop {
            self.tick(Utc::now()).await;

            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("[Worker] Shutdown signal received");
                    break;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        self.manager.shutdown();
        info!(
            ticks = self.stats.ticks,
            pieces = self.stats.pieces,
            batches = self.stats.batches,
            windows_closed = self.stats.windows_closed,
            switches = self.stats.program_switches,
            errors = self.stats.errors,
            unfinalized = self.manager.deferred_ends(),
            "[Worker] Poll loop stopped"
        );
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::companion::DisabledNotifier;
    use crate::lifecycle::ScheduleEntry;
    use crate::pipeline::StoreSource;
    use crate::storage::MemoryStore;
    use crate::types::{BatchEvent, PieceEvent};
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 1, 8, 0, 0).unwrap()
    }

    fn names() -> BTreeMap<Gate, String> {
        BTreeMap::from([(1, "R_100_140_1000_0_NA_NA".to_string())])
    }

    fn worker(store: &Arc<MemoryStore>) -> WorkerLoop<MemoryStore, StoreSource<MemoryStore>> {
        let manager = LifecycleManager::new(Arc::clone(store), 120).unwrap();
        let source = StoreSource::new(Arc::clone(store), t0(), None);
        WorkerLoop::new(
            manager,
            source,
            Arc::new(DisabledNotifier),
            CancellationToken::new(),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn test_tick_ingests_and_closes_minutes() {
        let store = Arc::new(MemoryStore::new());
        let mut worker = worker(&store);
        worker.start(t0(), &names()).unwrap();
        let program_id = worker.manager().active().unwrap().program.id;

        store.put_piece(&PieceEvent::new(t0() + ChronoDuration::seconds(5), 120.0, 1)).unwrap();
        store
            .put_batch(&BatchEvent::new(1, 1, 1100.0, 9, t0() + ChronoDuration::seconds(40)))
            .unwrap();

        worker.tick(t0() + ChronoDuration::seconds(50)).await;
        assert_eq!(worker.stats().pieces, 1);
        assert_eq!(worker.stats().batches, 1);
        assert_eq!(worker.stats().windows_closed, 0);

        worker.tick(t0() + ChronoDuration::seconds(70)).await;
        assert_eq!(worker.stats().windows_closed, 1);
        assert_eq!(store.combined_minutes(program_id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_schedule_switches_programs() {
        let store = Arc::new(MemoryStore::new());
        let entries = vec![
            ScheduleEntry {
                program_id: "a".to_string(),
                timestamp: t0(),
                gate_assignments: BTreeMap::from([("1".to_string(), "R_100_140_1000_0_NA_NA".to_string())]),
            },
            ScheduleEntry {
                program_id: "b".to_string(),
                timestamp: t0() + ChronoDuration::minutes(10),
                gate_assignments: BTreeMap::from([("1".to_string(), "R_50_60_0_0_exact_10".to_string())]),
            },
        ];
        let mut worker = worker(&store).with_schedule(ProgramSchedule::from_entries(entries, 60).unwrap());
        worker.start(t0(), &BTreeMap::new()).unwrap();
        let first = worker.manager().active().unwrap().program.id;

        worker.tick(t0() + ChronoDuration::minutes(5)).await;
        assert_eq!(worker.stats().program_switches, 0);
        worker.tick(t0() + ChronoDuration::minutes(10)).await;
        assert_eq!(worker.stats().program_switches, 1);

        assert!(store.get_program(first).unwrap().unwrap().end_ts.is_some());
        assert_ne!(worker.manager().active().unwrap().program.id, first);
    }

    #[tokio::test]
    async fn test_same_program_entry_reassigns_gates() {
        let store = Arc::new(MemoryStore::new());
        let entries = vec![
            ScheduleEntry {
                program_id: "shift".to_string(),
                timestamp: t0(),
                gate_assignments: BTreeMap::from([("1".to_string(), "R_100_140_1000_0_NA_NA".to_string())]),
            },
            ScheduleEntry {
                program_id: "shift".to_string(),
                timestamp: t0() + ChronoDuration::minutes(10),
                gate_assignments: BTreeMap::from([
                    ("1".to_string(), "R_100_140_1000_0_NA_NA".to_string()),
                    ("2".to_string(), "R_50_60_0_0_exact_10".to_string()),
                ]),
            },
        ];
        let mut worker = worker(&store).with_schedule(ProgramSchedule::from_entries(entries, 60).unwrap());
        worker.start(t0(), &BTreeMap::new()).unwrap();
        let program_id = worker.manager().active().unwrap().program.id;

        worker.tick(t0() + ChronoDuration::minutes(10)).await;
        assert_eq!(worker.stats().program_switches, 0);
        let active = worker.manager().active().unwrap();
        assert_eq!(active.program.id, program_id);
        assert_eq!(active.config.assignment.len(), 2);
        assert_eq!(store.run_configs(program_id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let store = Arc::new(MemoryStore::new());
        let mut worker = worker(&store);
        worker.start(t0(), &names()).unwrap();
        let token = worker.cancel_token.clone();
        token.cancel();
        let stats = worker.run().await;
        assert_eq!(stats.ticks, 1);
    }
}
