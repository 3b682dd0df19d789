//! Per-gate dwell time between consecutive batch completions
//!
//! Uses Welford's single-pass update so long-running accumulation never
//! re-sums history. Variance is derived on read.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{BatchEvent, DwellSample, Gate};

/// Running `(n, mean, M2, min, max)` for one gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DwellStats {
    pub count: u64,
    pub mean: f64,
    pub m2: f64,
    /// 0 until the first sample.
    pub min: f64,
    pub max: f64,
}

impl DwellStats {
    /// Add one sample. Non-finite or negative values are ignored.
    pub fn add_sample(&mut self, x: f64) -> bool {
        if !x.is_finite() || x < 0.0 {
            return false;
        }
        if self.count == 0 {
            self.min = x;
            self.max = x;
        } else {
            self.min = self.min.min(x);
            self.max = self.max.max(x);
        }
        self.count += 1;
        #[allow(clippy::cast_precision_loss)]
        let n = self.count as f64;
        let delta = x - self.mean;
        self.mean += delta / n;
        let delta2 = x - self.mean;
        self.m2 += delta * delta2;
        true
    }

    /// Sample variance, `M2 / (n - 1)`. Undefined below two samples.
    pub fn variance(&self) -> Option<f64> {
        if self.count < 2 {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        let denom = (self.count - 1) as f64;
        Some(self.m2 / denom)
    }
}

/// Dwell accumulation for all gates of the active program.
#[derive(Debug, Clone, Default)]
pub struct DwellTracker {
    last_batch_at: HashMap<Gate, DateTime<Utc>>,
    stats: BTreeMap<Gate, DwellStats>,
}

impl DwellTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a batch completion. Returns the dwell sample when the gate had
    /// a previous completion in this program.
    pub fn observe_batch(&mut self, batch: &BatchEvent) -> Option<DwellSample> {
        if batch.is_reject() {
            return None;
        }
        let previous = self.last_batch_at.get(&batch.gate).copied();
        let Some(previous) = previous else {
            self.last_batch_at.insert(batch.gate, batch.completed_at);
            return None;
        };

        #[allow(clippy::cast_precision_loss)]
        let dwell_seconds = (batch.completed_at - previous).num_milliseconds() as f64 / 1000.0;
        if dwell_seconds < 0.0 {
            debug!(
                gate = batch.gate,
                batch_id = batch.id,
                "[Dwell] Out-of-order batch completion ignored"
            );
            return None;
        }

        self.last_batch_at.insert(batch.gate, batch.completed_at);
        self.stats.entry(batch.gate).or_default().add_sample(dwell_seconds);
        Some(DwellSample {
            gate: batch.gate,
            dwell_seconds,
            batch_timestamp: batch.completed_at,
        })
    }

    pub fn stats(&self, gate: Gate) -> Option<&DwellStats> {
        self.stats.get(&gate)
    }

    pub fn reset(&mut self) {
        self.last_batch_at.clear();
        self.stats.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_welford_mean_and_variance() {
        let mut stats = DwellStats::default();
        for x in [10.0, 20.0, 30.0] {
            assert!(stats.add_sample(x));
        }
        assert_eq!(stats.count, 3);
        assert_eq!(stats.mean, 20.0);
        assert_eq!(stats.variance(), Some(100.0));
        assert_eq!(stats.min, 10.0);
        assert_eq!(stats.max, 30.0);
    }

    #[test]
    fn test_variance_undefined_below_two_samples() {
        let mut stats = DwellStats::default();
        assert_eq!(stats.variance(), None);
        stats.add_sample(42.0);
        assert_eq!(stats.variance(), None);
        assert_eq!(stats.mean, 42.0);
    }

    #[test]
    fn test_rejects_non_finite_samples() {
        let mut stats = DwellStats::default();
        assert!(!stats.add_sample(f64::NAN));
        assert!(!stats.add_sample(-1.0));
        assert_eq!(stats.count, 0);
    }

    #[test]
    fn test_stable_over_large_offsets() {
        let mut stats = DwellStats::default();
        for x in [1e9 + 4.0, 1e9 + 7.0, 1e9 + 13.0, 1e9 + 16.0] {
            stats.add_sample(x);
        }
        assert!((stats.variance().unwrap() - 30.0).abs() < 1e-6);
    }

    #[test]
    fn test_tracker_first_batch_has_no_sample() {
        let t0 = Utc.with_ymd_and_hms(2025, 5, 1, 8, 0, 0).unwrap();
        let mut tracker = DwellTracker::new();
        assert!(tracker.observe_batch(&BatchEvent::new(1, 3, 900.0, 7, t0)).is_none());
        let sample = tracker
            .observe_batch(&BatchEvent::new(2, 3, 900.0, 7, t0 + Duration::seconds(45)))
            .unwrap();
        assert_eq!(sample.gate, 3);
        assert_eq!(sample.dwell_seconds, 45.0);
        assert_eq!(tracker.stats(3).unwrap().count, 1);
    }

    #[test]
    fn test_tracker_ignores_reject_gate_and_negative_deltas() {
        let t0 = Utc.with_ymd_and_hms(2025, 5, 1, 8, 0, 0).unwrap();
        let mut tracker = DwellTracker::new();
        assert!(tracker.observe_batch(&BatchEvent::new(1, 0, 900.0, 7, t0)).is_none());
        assert!(tracker.observe_batch(&BatchEvent::new(2, 0, 900.0, 7, t0)).is_none());

        tracker.observe_batch(&BatchEvent::new(3, 1, 900.0, 7, t0));
        assert!(tracker
            .observe_batch(&BatchEvent::new(4, 1, 900.0, 7, t0 - Duration::seconds(5)))
            .is_none());
        let sample = tracker
            .observe_batch(&BatchEvent::new(5, 1, 900.0, 7, t0 + Duration::seconds(30)))
            .unwrap();
        assert_eq!(sample.dwell_seconds, 30.0);
        assert!(tracker.stats(0).is_none());
    }
}
