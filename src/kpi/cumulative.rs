//! Program-scoped cumulative totals per recipe
//!
//! Each minute a recipe batches, that minute's sums are added to its state,
//! with giveaway clamped per minute. Every recipe that has batched at least
//! once in the program is re-emitted every minute, so the cumulative series
//! has no gaps.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::evaluator::{giveaway_pct, FillSummary};
use crate::recipe::RecipeCatalog;
use crate::types::{CumulativeRow, MinuteKey, RecipeId};

/// Running totals for one recipe. All accumulators are non-decreasing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CumulativeRecipeState {
    pub recipe_name: String,
    pub filled_batches: f64,
    pub actual_weight_g: f64,
    pub target_weight_g: f64,
    pub giveaway_weight_g: f64,
    pub batches: u64,
    pub pieces: u64,
}

impl CumulativeRecipeState {
    fn apply(&mut self, minute: &FillSummary) {
        self.filled_batches += minute.filled_batches;
        self.actual_weight_g += minute.actual_weight_g;
        self.target_weight_g += minute.target_weight_g;
        self.giveaway_weight_g += minute.giveaway_weight_g();
        self.batches += minute.batches;
        self.pieces += minute.pieces;
    }

    pub fn giveaway_per_batch_g(&self) -> f64 {
        self.giveaway_weight_g / self.filled_batches.max(1.0)
    }

    pub fn giveaway_pct_avg(&self) -> f64 {
        giveaway_pct(self.giveaway_weight_g, self.actual_weight_g)
    }

    /// Filled-batch equivalents rounded for display.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn display_batches(&self) -> u64 {
        self.filled_batches.round().max(0.0) as u64
    }

    fn row(&self, minute: MinuteKey, recipe_id: RecipeId) -> CumulativeRow {
        CumulativeRow {
            minute,
            recipe_id,
            recipe_name: self.recipe_name.clone(),
            total_batches: self.display_batches(),
            filled_batches: self.filled_batches,
            actual_weight_g: self.actual_weight_g,
            giveaway_weight_g: self.giveaway_weight_g,
            giveaway_per_batch_g: self.giveaway_per_batch_g(),
            giveaway_pct_avg: self.giveaway_pct_avg(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CumulativeTracker {
    states: BTreeMap<RecipeId, CumulativeRecipeState>,
}

impl CumulativeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one closed minute's batch sums in and return the snapshot of
    /// every recipe with history, in recipe id order.
    pub fn record_minute(
        &mut self,
        minute: MinuteKey,
        fills: &BTreeMap<RecipeId, FillSummary>,
        catalog: &RecipeCatalog,
    ) -> Vec<CumulativeRow> {
        for (&recipe_id, fill) in fills {
            if fill.is_empty() {
                continue;
            }
            let state = self.states.entry(recipe_id).or_insert_with(|| CumulativeRecipeState {
                recipe_name: catalog
                    .get(recipe_id)
                    .map(|r| r.name.clone())
                    .unwrap_or_default(),
                ..CumulativeRecipeState::default()
            });
            state.apply(fill);
        }

        self.states
            .iter()
            .map(|(&recipe_id, state)| state.row(minute, recipe_id))
            .collect()
    }

    pub fn get(&self, recipe_id: RecipeId) -> Option<&CumulativeRecipeState> {
        self.states.get(&recipe_id)
    }

    pub const fn states(&self) -> &BTreeMap<RecipeId, CumulativeRecipeState> {
        &self.states
    }

    pub fn reset(&mut self) {
        self.states.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BatchEvent;
    use chrono::{TimeZone, Utc};

    fn minute(i: i64) -> MinuteKey {
        MinuteKey::from_index(29_000_000 + i)
    }

    fn catalog_with(name: &str) -> (RecipeCatalog, RecipeId) {
        let mut catalog = RecipeCatalog::new();
        let (id, _) = catalog.resolve_name(name).unwrap();
        (catalog, id)
    }

    fn fills_for(catalog: &RecipeCatalog, id: RecipeId, batches: &[(f64, u32)]) -> BTreeMap<RecipeId, FillSummary> {
        let spec = catalog.get(id).unwrap().spec;
        let ts = Utc.with_ymd_and_hms(2025, 5, 1, 8, 0, 0).unwrap();
        let events: Vec<BatchEvent> = batches
            .iter()
            .enumerate()
            .map(|(i, &(w, p))| BatchEvent::new(i as u64, 1, w, p, ts))
            .collect();
        BTreeMap::from([(id, FillSummary::from_batches(&spec, &events))])
    }

    #[test]
    fn test_accumulates_per_minute_clamped_giveaway() {
        let (catalog, id) = catalog_with("R_100_140_1000_0_NA_NA");
        let mut tracker = CumulativeTracker::new();
        tracker.record_minute(minute(0), &fills_for(&catalog, id, &[(1200.0, 9)]), &catalog);
        // Under-filled minute adds no giveaway and does not offset the first.
        let rows = tracker.record_minute(minute(1), &fills_for(&catalog, id, &[(800.0, 6)]), &catalog);

        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert!((row.filled_batches - 1.8).abs() < 1e-12);
        assert_eq!(row.actual_weight_g, 2000.0);
        assert_eq!(row.giveaway_weight_g, 200.0);
        assert_eq!(row.total_batches, 2);
        assert!((row.giveaway_per_batch_g - 200.0 / 1.8).abs() < 1e-9);
        assert!((row.giveaway_pct_avg - 200.0 / 2200.0 * 100.0).abs() < 1e-12);
    }

    #[test]
    fn test_idle_minute_reemits_snapshot() {
        let (catalog, id) = catalog_with("R_100_140_1000_0_NA_NA");
        let mut tracker = CumulativeTracker::new();
        let first = tracker.record_minute(minute(0), &fills_for(&catalog, id, &[(1200.0, 9)]), &catalog);
        let idle = tracker.record_minute(minute(1), &BTreeMap::new(), &catalog);
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].minute, minute(1));
        assert_eq!(idle[0].filled_batches, first[0].filled_batches);
        assert_eq!(idle[0].giveaway_weight_g, first[0].giveaway_weight_g);
        assert_eq!(idle[0].recipe_name, "R_100_140_1000_0_NA_NA");
    }

    #[test]
    fn test_no_rows_before_first_batch() {
        let (catalog, _) = catalog_with("R_100_140_1000_0_NA_NA");
        let mut tracker = CumulativeTracker::new();
        assert!(tracker.record_minute(minute(0), &BTreeMap::new(), &catalog).is_empty());
    }

    #[test]
    fn test_giveaway_per_batch_divides_by_at_least_one() {
        let (catalog, id) = catalog_with("R_100_140_1000_0_NA_NA");
        let mut tracker = CumulativeTracker::new();
        // 0.5 filled with no giveaway, then an overfill minute
        tracker.record_minute(minute(0), &fills_for(&catalog, id, &[(500.0, 4)]), &catalog);
        let state = tracker.get(id).unwrap();
        assert_eq!(state.giveaway_per_batch_g(), 0.0);
        assert_eq!(state.display_batches(), 1);
    }

    #[test]
    fn test_reset_clears_program_state() {
        let (catalog, id) = catalog_with("R_100_140_1000_0_NA_NA");
        let mut tracker = CumulativeTracker::new();
        tracker.record_minute(minute(0), &fills_for(&catalog, id, &[(1200.0, 9)]), &catalog);
        tracker.reset();
        assert!(tracker.states().is_empty());
    }
}
