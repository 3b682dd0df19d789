//! Full-history program totals
//!
//! When a program ends, its totals are recomputed from stored events rather
//! than taken from the incremental stream. The recompute drives a fresh
//! [`KpiEngine`] with the same merged event order and applies each run
//! config at its activation instant, so for the same events it reproduces
//! the incremental cumulative state exactly.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tracing::info;

use crate::kpi::{merge_events, CumulativeRecipeState, KpiEngine};
use crate::recipe::RecipeCatalog;
use crate::storage::{KpiStore, StorageError};
use crate::types::{
    BatchEvent, Gate, PieceEvent, Program, ProgramId, ProgramStats, RecipeId, RecipeStats,
    RunConfig,
};

/// Lifetime totals of one program.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgramTotals {
    pub program: ProgramStats,
    /// Recipes that batched during the program, in id order.
    pub recipes: Vec<RecipeStats>,
    /// Final cumulative state per recipe.
    pub cumulative: BTreeMap<RecipeId, CumulativeRecipeState>,
}

/// Pure recompute over a program's events.
///
/// `configs` must be ordered by activation time. The first config applies
/// from the first event regardless of its timestamp.
pub fn recompute_program(
    program_id: ProgramId,
    pieces: Vec<PieceEvent>,
    batches: Vec<BatchEvent>,
    configs: &[RunConfig],
    catalog: &RecipeCatalog,
    max_gap_minutes: u32,
) -> ProgramTotals {
    let owned_gates = gates_per_recipe(configs);
    let eligible_rejects = eligible_rejects(&pieces, &owned_gates, catalog);

    let mut engine = KpiEngine::new(max_gap_minutes);
    let mut pending = configs.iter().peekable();
    if let Some(first) = pending.next() {
        engine.set_assignment(first.assignment.clone());
    }

    for event in merge_events(pieces, batches) {
        while let Some(config) = pending.next_if(|c| c.activated_at <= event.timestamp()) {
            engine.flush(catalog);
            engine.set_assignment(config.assignment.clone());
        }
        engine.ingest(event, catalog);
    }
    engine.flush(catalog);

    let (rejects_count, rejects_weight_g) = engine.reject_totals();
    let mut program = ProgramStats {
        program_id,
        total_items_rejected: rejects_count,
        total_reject_weight_g: rejects_weight_g,
        ..ProgramStats::default()
    };

    let cumulative = engine.cumulative().states().clone();
    let mut recipes = Vec::with_capacity(cumulative.len());
    for (&recipe_id, state) in &cumulative {
        let (rejected, rejected_weight) = eligible_rejects.get(&recipe_id).copied().unwrap_or_default();
        let gates = owned_gates
            .get(&recipe_id)
            .map(|g| g.iter().map(ToString::to_string).collect::<Vec<_>>().join(","))
            .unwrap_or_default();

        program.total_batches += state.filled_batches;
        program.total_batched_weight_g += state.target_weight_g;
        program.total_giveaway_weight_g += state.giveaway_weight_g;
        program.total_items_batched += state.pieces;

        recipes.push(RecipeStats {
            program_id,
            recipe_id,
            recipe_name: state.recipe_name.clone(),
            gates_assigned: gates,
            total_batches: state.filled_batches,
            total_batched_weight_g: state.target_weight_g,
            total_giveaway_weight_g: state.giveaway_weight_g,
            total_actual_weight_g: state.actual_weight_g,
            total_items_batched: state.pieces,
            total_items_rejected: rejected,
            total_reject_weight_g: rejected_weight,
        });
    }

    ProgramTotals {
        program,
        recipes,
        cumulative,
    }
}

/// Every gate a recipe owned under any of the configs.
fn gates_per_recipe(configs: &[RunConfig]) -> BTreeMap<RecipeId, BTreeSet<Gate>> {
    let mut owned: BTreeMap<RecipeId, BTreeSet<Gate>> = BTreeMap::new();
    for config in configs {
        for (gate, recipe) in config.assignment.iter() {
            owned.entry(recipe).or_default().insert(gate);
        }
    }
    owned
}

/// Pieces a recipe would have accepted that were routed elsewhere.
fn eligible_rejects(
    pieces: &[PieceEvent],
    owned_gates: &BTreeMap<RecipeId, BTreeSet<Gate>>,
    catalog: &RecipeCatalog,
) -> BTreeMap<RecipeId, (u64, f64)> {
    let mut out = BTreeMap::new();
    for (&recipe_id, gates) in owned_gates {
        let Some(recipe) = catalog.get(recipe_id) else {
            continue;
        };
        let (count, weight) = pieces
            .iter()
            .filter(|p| !gates.contains(&p.gate) && recipe.spec.accepts_piece(p.weight_g))
            .fold((0u64, 0.0f64), |(n, w), p| (n + 1, w + p.weight_g));
        out.insert(recipe_id, (count, weight));
    }
    out
}

/// Recompute a program from the store, persist its lifetime rows and close it.
///
/// Events are read from `[program.start_ts, until)`. The program row is
/// written last, so an interrupted finalize leaves the program open for
/// recovery to redo.
pub fn finalize_program<S: KpiStore + ?Sized>(
    store: &S,
    catalog: &RecipeCatalog,
    program: &Program,
    end_ts: DateTime<Utc>,
    until: Option<DateTime<Utc>>,
    configs: &[RunConfig],
    max_gap_minutes: u32,
) -> Result<ProgramTotals, StorageError> {
    let pieces = store.pieces_between(program.start_ts, until)?;
    let batches = store.program_batches(program.id, program.start_ts, until)?;
    let batch_count = batches.len();

    let mut totals = recompute_program(program.id, pieces, batches, configs, catalog, max_gap_minutes);
    totals.program.start_ts = Some(program.start_ts);
    totals.program.end_ts = Some(end_ts);

    for recipe in &totals.recipes {
        store.put_recipe_stats(recipe)?;
    }
    store.put_program_stats(&totals.program)?;
    store.put_program(&Program {
        end_ts: Some(end_ts),
        ..program.clone()
    })?;

    info!(
        program_id = program.id,
        program = %program.name,
        batches = batch_count,
        filled_batches = totals.program.total_batches,
        giveaway_g = totals.program.total_giveaway_weight_g,
        rejects = totals.program.total_items_rejected,
        "[Lifecycle] Program finalized"
    );
    Ok(totals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConfigSource, GateAssignment, REJECT_GATE};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 1, 8, 0, 0).unwrap()
    }

    fn config(id: u64, at: DateTime<Utc>, assignment: GateAssignment) -> RunConfig {
        RunConfig {
            id,
            program_id: 1,
            name: format!("config-{id}"),
            source: ConfigSource::Schedule,
            activated_at: at,
            assignment,
        }
    }

    #[test]
    fn test_three_batches_recompute() {
        let mut catalog = RecipeCatalog::new();
        let (id, _) = catalog.resolve_name("R_100_140_1000_0_NA_NA").unwrap();
        let configs = vec![config(1, t0(), [(1, id)].into_iter().collect())];
        let batches = vec![
            BatchEvent::new(1, 1, 1200.0, 9, t0()),
            BatchEvent::new(2, 1, 900.0, 7, t0() + Duration::minutes(1)),
            BatchEvent::new(3, 1, 1050.0, 8, t0() + Duration::minutes(2)),
        ];
        let totals = recompute_program(1, Vec::new(), batches, &configs, &catalog, 120);

        assert_eq!(totals.recipes.len(), 1);
        let recipe = &totals.recipes[0];
        assert!((recipe.total_batches - 2.9).abs() < 1e-12);
        assert_eq!(recipe.total_actual_weight_g, 3150.0);
        assert_eq!(recipe.total_batched_weight_g, 2900.0);
        // 200 + 0 + 50, clamped per minute
        assert_eq!(recipe.total_giveaway_weight_g, 250.0);
        assert_eq!(recipe.total_items_batched, 24);
        assert_eq!(recipe.gates_assigned, "1");
        assert_eq!(totals.program.total_giveaway_weight_g, 250.0);
    }

    #[test]
    fn test_reassignment_applied_at_activation() {
        let mut catalog = RecipeCatalog::new();
        let (heavy, _) = catalog.resolve_name("R_100_140_1000_0_NA_NA").unwrap();
        let (light, _) = catalog.resolve_name("R_50_60_0_0_exact_10").unwrap();
        let configs = vec![
            config(1, t0(), [(1, heavy)].into_iter().collect()),
            config(2, t0() + Duration::minutes(5), [(1, light), (2, heavy)].into_iter().collect()),
        ];
        let batches = vec![
            BatchEvent::new(1, 1, 1200.0, 9, t0()),
            BatchEvent::new(2, 1, 600.0, 10, t0() + Duration::minutes(6)),
        ];
        let totals = recompute_program(1, Vec::new(), batches, &configs, &catalog, 120);
        let by_id: BTreeMap<_, _> = totals.recipes.iter().map(|r| (r.recipe_id, r)).collect();
        assert_eq!(by_id[&heavy].total_batches, 1.0);
        assert_eq!(by_id[&heavy].gates_assigned, "1,2");
        assert_eq!(by_id[&light].total_batches, 1.0);
        assert_eq!(by_id[&light].total_giveaway_weight_g, 100.0);
    }

    #[test]
    fn test_eligible_rejects_and_program_rejects() {
        let mut catalog = RecipeCatalog::new();
        let (id, _) = catalog.resolve_name("R_100_140_1000_0_NA_NA").unwrap();
        let configs = vec![config(1, t0(), [(1, id)].into_iter().collect())];
        let pieces = vec![
            PieceEvent::new(t0(), 120.0, 1),
            PieceEvent::new(t0(), 110.0, REJECT_GATE),
            PieceEvent::new(t0(), 90.0, REJECT_GATE),
            PieceEvent::new(t0(), 130.0, 5),
        ];
        let batches = vec![BatchEvent::new(1, 1, 1000.0, 8, t0() + Duration::seconds(30))];
        let totals = recompute_program(1, pieces, batches, &configs, &catalog, 120);

        let recipe = &totals.recipes[0];
        assert_eq!(recipe.total_items_rejected, 2);
        assert_eq!(recipe.total_reject_weight_g, 240.0);
        assert_eq!(totals.program.total_items_rejected, 2);
        assert_eq!(totals.program.total_reject_weight_g, 200.0);
    }

    #[test]
    fn test_recompute_is_deterministic() {
        let mut catalog = RecipeCatalog::new();
        let (id, _) = catalog.resolve_name("R_100_140_1000_0_NA_NA").unwrap();
        let configs = vec![config(1, t0(), [(1, id), (2, id)].into_iter().collect())];
        let batches: Vec<BatchEvent> = (0..50)
            .map(|i| {
                let weight = 950.0 + f64::from(i % 7) * 33.3;
                BatchEvent::new(u64::from(i), 1 + i % 2, weight, 8, t0() + Duration::seconds(i64::from(i) * 17))
            })
            .collect();
        let a = recompute_program(1, Vec::new(), batches.clone(), &configs, &catalog, 120);
        let b = recompute_program(1, Vec::new(), batches, &configs, &catalog, 120);
        assert_eq!(a, b);
        let (sa, sb) = (&a.cumulative[&id], &b.cumulative[&id]);
        assert_eq!(sa.giveaway_weight_g.to_bits(), sb.giveaway_weight_g.to_bits());
    }

    #[test]
    fn test_no_configs_yields_empty_recipe_totals() {
        let catalog = RecipeCatalog::new();
        let batches = vec![BatchEvent::new(1, 1, 1000.0, 8, t0())];
        let totals = recompute_program(4, Vec::new(), batches, &[], &catalog, 120);
        assert!(totals.recipes.is_empty());
        assert_eq!(totals.program.program_id, 4);
        assert_eq!(totals.program.total_batches, 0.0);
    }
}
