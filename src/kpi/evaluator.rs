//! Filled-batch evaluation
//!
//! Maps a completed batch and its recipe to a fill fraction and a target
//! weight. Giveaway is derived from sums over a batch set and is never
//! negative: under-filled batches contribute only their fill fraction.

use serde::{Deserialize, Serialize};

use crate::recipe::{CountPolicy, RecipeSpec};
use crate::types::BatchEvent;

/// Result of evaluating one batch against its recipe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchFill {
    /// Fraction of a full batch achieved. Count-bounded `exact` recipes may
    /// exceed 1.0 when over-filled; this is not clamped.
    pub fill_fraction: f64,
    pub target_weight_g: f64,
}

/// Evaluate a single batch.
///
/// - `exact(n)`: fill 1 if `pieces == n`, else `pieces / n`
/// - `atLeast(n)`: fill 1 if `pieces >= n`, else `pieces / n`
/// - count-bounded target: `fill * n * piece_min`
/// - weight-bounded with `batch_min == 0`: fill 1, target = actual weight
/// - weight-bounded: fill 1 if `weight >= batch_min`, else `weight / batch_min`;
///   target `fill * batch_min`
pub fn evaluate_batch(spec: &RecipeSpec, weight_g: f64, pieces: u32) -> BatchFill {
    let weight = sanitize_weight(weight_g);

    if let Some(n) = spec.count_policy.target_count() {
        let n_f = f64::from(n);
        let pieces_f = f64::from(pieces);
        let complete = match spec.count_policy {
            CountPolicy::Exact(_) => pieces == n,
            _ => pieces >= n,
        };
        let fill_fraction = if complete { 1.0 } else { pieces_f / n_f };
        return BatchFill {
            fill_fraction,
            target_weight_g: fill_fraction * n_f * f64::from(spec.piece_min),
        };
    }

    if spec.batch_min == 0 {
        return BatchFill {
            fill_fraction: 1.0,
            target_weight_g: weight,
        };
    }

    let batch_min = f64::from(spec.batch_min);
    let fill_fraction = if weight >= batch_min {
        1.0
    } else {
        weight / batch_min
    };
    BatchFill {
        fill_fraction,
        target_weight_g: fill_fraction * batch_min,
    }
}

/// `max(0, actual - target)`.
pub fn giveaway_weight(actual_g: f64, target_g: f64) -> f64 {
    (actual_g - target_g).max(0.0)
}

/// Giveaway as a percentage of `actual + giveaway`; 0 when that is 0.
pub fn giveaway_pct(giveaway_g: f64, actual_g: f64) -> f64 {
    let denom = actual_g + giveaway_g;
    if denom > 0.0 {
        giveaway_g / denom * 100.0
    } else {
        0.0
    }
}

/// Negative or non-finite scale readings count as nothing delivered.
pub(crate) fn sanitize_weight(weight_g: f64) -> f64 {
    if weight_g.is_finite() && weight_g > 0.0 {
        weight_g
    } else {
        0.0
    }
}

// ============================================================================
// Batch-Set Summary
// ============================================================================

/// Sums of one recipe's batches over some span (typically one minute).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FillSummary {
    pub batches: u64,
    pub pieces: u64,
    pub filled_batches: f64,
    pub actual_weight_g: f64,
    pub target_weight_g: f64,
}

impl FillSummary {
    /// Summarize `batches` in iteration order. Summation order is part of
    /// the result: replays must present batches in the same order.
    pub fn from_batches<'a, I>(spec: &RecipeSpec, batches: I) -> Self
    where
        I: IntoIterator<Item = &'a BatchEvent>,
    {
        let mut summary = Self::default();
        for batch in batches {
            summary.add_batch(spec, batch);
        }
        summary
    }

    pub fn add_batch(&mut self, spec: &RecipeSpec, batch: &BatchEvent) {
        let fill = evaluate_batch(spec, batch.weight_g, batch.pieces);
        self.batches += 1;
        self.pieces += u64::from(batch.pieces);
        self.filled_batches += fill.fill_fraction;
        self.actual_weight_g += sanitize_weight(batch.weight_g);
        self.target_weight_g += fill.target_weight_g;
    }

    pub fn giveaway_weight_g(&self) -> f64 {
        giveaway_weight(self.actual_weight_g, self.target_weight_g)
    }

    pub fn giveaway_pct(&self) -> f64 {
        giveaway_pct(self.giveaway_weight_g(), self.actual_weight_g)
    }

    pub const fn is_empty(&self) -> bool {
        self.batches == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn weight_recipe(batch_min: u32) -> RecipeSpec {
        RecipeSpec::new(100, 140, batch_min, 0, CountPolicy::None).unwrap()
    }

    fn batch(weight: f64, pieces: u32) -> BatchEvent {
        BatchEvent::new(1, 1, weight, pieces, Utc::now())
    }

    #[test]
    fn test_weight_bounded_overfill() {
        let spec = weight_recipe(1000);
        let fill = evaluate_batch(&spec, 1200.0, 3);
        assert_eq!(fill.fill_fraction, 1.0);
        assert_eq!(fill.target_weight_g, 1000.0);
        let summary = FillSummary::from_batches(&spec, &[batch(1200.0, 3)]);
        assert_eq!(summary.giveaway_weight_g(), 200.0);
    }

    #[test]
    fn test_exact_count_underfill() {
        let spec = RecipeSpec::new(50, 60, 0, 0, CountPolicy::Exact(10)).unwrap();
        let fill = evaluate_batch(&spec, 390.0, 8);
        assert!((fill.fill_fraction - 0.8).abs() < 1e-12);
        assert!((fill.target_weight_g - 400.0).abs() < 1e-9);
        let summary = FillSummary::from_batches(&spec, &[batch(390.0, 8)]);
        assert_eq!(summary.giveaway_weight_g(), 0.0);
    }

    #[test]
    fn test_exact_count_overfill_not_clamped() {
        let spec = RecipeSpec::new(50, 60, 0, 0, CountPolicy::Exact(10)).unwrap();
        let fill = evaluate_batch(&spec, 700.0, 12);
        assert!((fill.fill_fraction - 1.2).abs() < 1e-12);
        assert!((fill.target_weight_g - 600.0).abs() < 1e-9);
    }

    #[test]
    fn test_at_least_count() {
        let spec = RecipeSpec::new(50, 60, 0, 0, CountPolicy::AtLeast(10)).unwrap();
        let full = evaluate_batch(&spec, 700.0, 12);
        assert_eq!(full.fill_fraction, 1.0);
        assert_eq!(full.target_weight_g, 500.0);
        let partial = evaluate_batch(&spec, 260.0, 5);
        assert_eq!(partial.fill_fraction, 0.5);
        assert_eq!(partial.target_weight_g, 250.0);
    }

    #[test]
    fn test_unconstrained_batch_has_no_giveaway() {
        let spec = weight_recipe(0);
        let fill = evaluate_batch(&spec, 873.0, 7);
        assert_eq!(fill.fill_fraction, 1.0);
        assert_eq!(fill.target_weight_g, 873.0);
    }

    #[test]
    fn test_at_most_evaluates_by_weight() {
        let spec = RecipeSpec::new(50, 60, 500, 0, CountPolicy::AtMost(12)).unwrap();
        let fill = evaluate_batch(&spec, 250.0, 4);
        assert_eq!(fill.fill_fraction, 0.5);
        assert_eq!(fill.target_weight_g, 250.0);
    }

    #[test]
    fn test_weight_underfill() {
        let spec = weight_recipe(1000);
        let fill = evaluate_batch(&spec, 750.0, 6);
        assert_eq!(fill.fill_fraction, 0.75);
        assert_eq!(fill.target_weight_g, 750.0);
    }

    #[test]
    fn test_giveaway_never_negative() {
        let specs = [
            weight_recipe(0),
            weight_recipe(1000),
            RecipeSpec::new(50, 60, 0, 0, CountPolicy::Exact(10)).unwrap(),
            RecipeSpec::new(50, 60, 0, 0, CountPolicy::AtLeast(4)).unwrap(),
        ];
        let weights = [-50.0, 0.0, 10.0, 399.0, 999.9, 1000.0, 1500.0, f64::NAN, f64::INFINITY];
        for spec in &specs {
            for &w in &weights {
                for pieces in [0, 3, 10, 14] {
                    let summary = FillSummary::from_batches(spec, &[batch(w, pieces)]);
                    assert!(summary.giveaway_weight_g() >= 0.0);
                    assert!(summary.target_weight_g >= 0.0);
                    assert!(summary.giveaway_pct().is_finite());
                }
            }
        }
    }

    #[test]
    fn test_giveaway_pct_uses_actual_plus_giveaway() {
        assert_eq!(giveaway_pct(0.0, 0.0), 0.0);
        let pct = giveaway_pct(200.0, 1200.0);
        assert!((pct - 200.0 / 1400.0 * 100.0).abs() < 1e-12);
    }

    #[test]
    fn test_summary_sums_before_clamping() {
        let spec = weight_recipe(1000);
        let summary = FillSummary::from_batches(&spec, &[batch(1200.0, 3), batch(900.0, 3)]);
        assert_eq!(summary.batches, 2);
        assert!((summary.filled_batches - 1.9).abs() < 1e-12);
        assert_eq!(summary.actual_weight_g, 2100.0);
        assert_eq!(summary.target_weight_g, 1900.0);
        assert_eq!(summary.giveaway_weight_g(), 200.0);
        assert_eq!(summary.pieces, 6);
    }
}
