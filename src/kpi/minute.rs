//! Per-minute KPI records for a closed window
//!
//! Recipe rows aggregate every gate a recipe owns into one stream. The
//! combined row counts raw throughput over all non-reject gates, including
//! gates whose recipe is unknown, while its giveaway covers catalogued
//! recipes only.

use std::collections::BTreeMap;

use tracing::debug;

use super::evaluator::{giveaway_pct, sanitize_weight, FillSummary};
use super::window::MinuteWindow;
use crate::recipe::RecipeCatalog;
use crate::types::{
    CombinedMinuteRow, GateAssignment, MinuteKey, RecipeId, RecipeMinuteRow, REJECT_GATE,
};

/// KPIs derived from one closed window.
#[derive(Debug, Clone, PartialEq)]
pub struct MinuteKpis {
    pub minute: MinuteKey,
    pub recipe_rows: Vec<RecipeMinuteRow>,
    /// Batch sums per recipe with at least one batch this minute.
    pub fills: BTreeMap<RecipeId, FillSummary>,
    pub piece_count: u64,
    pub weight_sum_g: f64,
    pub batch_count: u64,
    pub giveaway_pct: f64,
    pub rejects: u64,
    pub reject_weight_g: f64,
}

impl MinuteKpis {
    pub fn compute(
        window: &MinuteWindow,
        assignment: &GateAssignment,
        catalog: &RecipeCatalog,
    ) -> Self {
        let minute = window.minute();
        let mut recipe_rows = Vec::new();
        let mut fills = BTreeMap::new();

        for (recipe_id, gates) in assignment.recipes() {
            let Some(recipe) = catalog.get(recipe_id) else {
                debug!(
                    recipe_id,
                    gates = ?gates,
                    "[Window] Gates mapped to uncatalogued recipe; excluded from recipe KPIs"
                );
                continue;
            };

            let mut piece_count = 0u64;
            let mut weight_sum_g = 0.0;
            for &gate in &gates {
                let pieces = window.pieces_on(gate);
                piece_count += pieces.len() as u64;
                weight_sum_g += pieces.iter().map(|p| sanitize_weight(p.weight_g)).sum::<f64>();
            }
            let fill = FillSummary::from_batches(
                &recipe.spec,
                gates.iter().flat_map(|&gate| window.batches_on(gate)),
            );

            recipe_rows.push(RecipeMinuteRow {
                minute,
                recipe_id,
                recipe_name: recipe.name.clone(),
                piece_count,
                weight_sum_g,
                batch_count: fill.batches,
                giveaway_pct: fill.giveaway_pct(),
            });
            if !fill.is_empty() {
                fills.insert(recipe_id, fill);
            }
        }

        let mut piece_count = 0u64;
        let mut weight_sum_g = 0.0;
        let mut rejects = 0u64;
        let mut reject_weight_g = 0.0;
        for (gate, pieces) in window.pieces() {
            let weight: f64 = pieces.iter().map(|p| sanitize_weight(p.weight_g)).sum();
            if gate == REJECT_GATE {
                rejects += pieces.len() as u64;
                reject_weight_g += weight;
            } else {
                piece_count += pieces.len() as u64;
                weight_sum_g += weight;
            }
        }
        let batch_count = window
            .batches()
            .filter(|(gate, _)| *gate != REJECT_GATE)
            .map(|(_, batches)| batches.len() as u64)
            .sum();

        let giveaway_g: f64 = fills.values().map(FillSummary::giveaway_weight_g).sum();
        let actual_g: f64 = fills.values().map(|f| f.actual_weight_g).sum();

        Self {
            minute,
            recipe_rows,
            fills,
            piece_count,
            weight_sum_g,
            batch_count,
            giveaway_pct: giveaway_pct(giveaway_g, actual_g),
            rejects,
            reject_weight_g,
        }
    }

    /// Combined row, given the program's reject totals including this minute.
    pub fn combined_row(&self, total_rejects: u64, total_reject_weight_g: f64) -> CombinedMinuteRow {
        CombinedMinuteRow {
            minute: self.minute,
            piece_count: self.piece_count,
            weight_sum_g: self.weight_sum_g,
            batch_count: self.batch_count,
            giveaway_pct: self.giveaway_pct,
            rejects_this_minute: self.rejects,
            reject_weight_this_minute_g: self.reject_weight_g,
            total_rejects_count: total_rejects,
            total_rejects_weight_g: total_reject_weight_g,
        }
    }
}
