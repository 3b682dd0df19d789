//! Crash Recovery Integration Tests
//!
//! Runs a worker against a sled store in a temp dir, drops it without
//! ending the program (a crash), reopens the store and checks that startup
//! recovery closes the program with the same totals a clean end would give.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use batchline_kpi::lifecycle::LifecycleManager;
use batchline_kpi::storage::{KpiStore, ProcessLock, SledStore};
use batchline_kpi::types::{BatchEvent, ConfigSource, Gate, PieceEvent, Program, REJECT_GATE};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 5, 1, 6, 0, 0).unwrap()
}

fn names() -> BTreeMap<Gate, String> {
    BTreeMap::from([
        (1, "R_100_140_1000_0_NA_NA".to_string()),
        (2, "R_50_60_0_0_exact_10".to_string()),
    ])
}

fn events() -> (Vec<PieceEvent>, Vec<BatchEvent>) {
    let pieces = vec![
        PieceEvent::new(t0() + Duration::seconds(3), 120.0, 1),
        PieceEvent::new(t0() + Duration::seconds(4), 55.0, 2),
        PieceEvent::new(t0() + Duration::seconds(5), 130.0, REJECT_GATE),
    ];
    let batches = vec![
        BatchEvent::new(1, 1, 1200.0, 9, t0() + Duration::seconds(40)),
        BatchEvent::new(2, 2, 600.0, 10, t0() + Duration::minutes(2)),
        BatchEvent::new(3, 1, 1050.0, 8, t0() + Duration::minutes(4)),
    ];
    (pieces, batches)
}

/// Run until the crash point and return the program id.
fn run_and_crash(db: &Path) -> u64 {
    let store = Arc::new(SledStore::open(db).unwrap());
    let mut manager = LifecycleManager::new(Arc::clone(&store), 120).unwrap();
    manager
        .switch_program(&names(), t0(), None, ConfigSource::Schedule)
        .unwrap();
    let (pieces, batches) = events();
    for piece in &pieces {
        store.put_piece(piece).unwrap();
    }
    for batch in &batches {
        store.put_batch(batch).unwrap();
    }
    manager.ingest(pieces, batches);
    manager.roll_over(t0() + Duration::minutes(3));
    let program_id = manager.active().unwrap().program.id;
    store.flush().unwrap();
    program_id
}

#[test]
fn crashed_program_is_recovered_on_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("kpi.sled");
    let program_id = run_and_crash(&db);

    let store = Arc::new(SledStore::open(&db).unwrap());
    assert!(store.get_program(program_id).unwrap().unwrap().is_open());

    let mut manager = LifecycleManager::new(Arc::clone(&store), 120).unwrap();
    assert_eq!(manager.catalog().len(), 2, "catalog reloaded from the store");
    let report = manager.recover().unwrap();
    assert_eq!(report.recovered, vec![program_id]);

    let program = store.get_program(program_id).unwrap().unwrap();
    assert_eq!(program.end_ts, Some(t0() + Duration::minutes(4)));

    let stats = store.program_stats(program_id).unwrap().unwrap();
    // 200 g + 0 g + 50 g on the weight recipe, 100 g on the count recipe
    assert_eq!(stats.total_giveaway_weight_g, 350.0);
    assert_eq!(stats.total_items_rejected, 1);
    assert_eq!(stats.total_reject_weight_g, 130.0);
    assert_eq!(store.recipe_stats(program_id).unwrap().len(), 2);

    // A second pass has nothing left to do.
    let again = manager.recover().unwrap();
    assert_eq!(again.total(), 0);
}

#[test]
fn program_without_configs_is_reconstructed_from_batches() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("kpi.sled");

    let recipe_id = {
        let store = Arc::new(SledStore::open(&db).unwrap());
        let mut manager = LifecycleManager::new(Arc::clone(&store), 120).unwrap();
        let assignment = manager
            .resolve_assignment(&BTreeMap::from([(3, "R_100_140_1000_0_NA_NA".to_string())]))
            .unwrap();
        let recipe_id = assignment.recipe_for(3).unwrap();

        // Program row written, crash before its run config was persisted.
        store
            .put_program(&Program {
                id: 9,
                name: Program::name_for(t0()),
                start_ts: t0(),
                end_ts: None,
            })
            .unwrap();
        for (id, minute) in [(1_u64, 0_i64), (2, 1), (3, 5)] {
            store
                .put_batch(
                    &BatchEvent::new(id, 3, 1100.0, 9, t0() + Duration::minutes(minute))
                        .with_recipe(recipe_id)
                        .with_program(9),
                )
                .unwrap();
        }
        store.flush().unwrap();
        recipe_id
    };

    let store = Arc::new(SledStore::open(&db).unwrap());
    let mut manager = LifecycleManager::new(Arc::clone(&store), 120).unwrap();
    let report = manager.recover().unwrap();
    assert_eq!(report.reconstructed, vec![9]);

    let configs = store.run_configs(9).unwrap();
    assert_eq!(configs.len(), 1);
    assert_eq!(configs[0].assignment.recipe_for(3), Some(recipe_id));

    let recipes = store.recipe_stats(9).unwrap();
    assert_eq!(recipes[0].total_batches, 3.0);
    assert_eq!(recipes[0].gates_assigned, "3");
    assert_eq!(
        store.get_program(9).unwrap().unwrap().end_ts,
        Some(t0() + Duration::minutes(5))
    );
}

#[test]
fn restart_starts_new_program_after_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("kpi.sled");
    let crashed = run_and_crash(&db);

    let store = Arc::new(SledStore::open(&db).unwrap());
    let mut manager = LifecycleManager::new(Arc::clone(&store), 120).unwrap();
    manager.recover().unwrap();
    manager
        .switch_program(&names(), t0() + Duration::hours(1), None, ConfigSource::Schedule)
        .unwrap();

    let active = manager.active().unwrap();
    assert!(active.program.id > crashed, "program ids keep increasing across restarts");
    assert!(manager.engine().cumulative().states().is_empty());
    assert_eq!(store.list_programs().unwrap().len(), 2);
}

#[test]
fn lock_file_lives_in_data_dir_and_is_released() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");
    let lock = ProcessLock::acquire(&data_dir).unwrap();
    assert!(lock.path().exists());
    let path = lock.path().to_path_buf();
    drop(lock);
    assert!(!path.exists());
}
