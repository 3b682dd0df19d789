//! Program schedule
//!
//! A JSON file of gate assignments that the worker cycles through:
//!
//! ```json
//! {"assignments": [
//!   {"program_id": "shift-a", "timestamp": "2025-05-01T06:00:00Z",
//!    "gate_assignments": {"1": "R_100_140_1000_0_NA_NA"}}
//! ]}
//! ```
//!
//! An entry runs for the gap between its timestamp and the next entry's.
//! The last entry wraps to the first after a fixed delay, and a one-entry
//! schedule never switches. The offline replay uses the timestamps as
//! absolute switch instants instead.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tracing::info;

use crate::types::Gate;

/// One year; longer wrap delays are clamped.
const MAX_WRAP_MINUTES: u64 = 60 * 24 * 365;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("Failed to read schedule {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid schedule JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Schedule has no assignments")]
    Empty,

    #[error("Entry '{program}': gate '{gate}' is not a gate number")]
    InvalidGate { program: String, gate: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleFile {
    #[serde(default)]
    pub assignments: Vec<ScheduleEntry>,
}

/// One scheduled assignment.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScheduleEntry {
    pub program_id: String,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    /// Gate number (as a string key) to recipe name.
    #[serde(default)]
    pub gate_assignments: BTreeMap<String, String>,
}

impl ScheduleEntry {
    /// Gate map with numeric gates.
    pub fn gate_names(&self) -> Result<BTreeMap<Gate, String>, ScheduleError> {
        self.gate_assignments
            .iter()
            .map(|(gate, name)| {
                let gate_no = gate.trim().parse::<Gate>().map_err(|_| ScheduleError::InvalidGate {
                    program: self.program_id.clone(),
                    gate: gate.clone(),
                })?;
                Ok((gate_no, name.clone()))
            })
            .collect()
    }
}

/// Accepts RFC 3339 or a naive ISO timestamp, which is taken as UTC.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(serde::de::Error::custom)
}

/// Cycling cursor over schedule entries.
#[derive(Debug, Clone)]
pub struct ProgramSchedule {
    entries: Vec<ScheduleEntry>,
    index: usize,
    last_switch: Option<DateTime<Utc>>,
    wrap_delay: Duration,
}

impl ProgramSchedule {
    pub fn load<P: AsRef<Path>>(path: P, wrap_minutes: u64) -> Result<Self, ScheduleError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ScheduleError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: ScheduleFile = serde_json::from_str(&raw)?;
        let schedule = Self::from_entries(file.assignments, wrap_minutes)?;
        info!(
            path = %path.display(),
            entries = schedule.len(),
            "[Schedule] Loaded program schedule"
        );
        Ok(schedule)
    }

    pub fn from_entries(entries: Vec<ScheduleEntry>, wrap_minutes: u64) -> Result<Self, ScheduleError> {
        if entries.is_empty() {
            return Err(ScheduleError::Empty);
        }
        for entry in &entries {
            entry.gate_names()?;
        }
        let wrap_minutes = i64::try_from(wrap_minutes.min(MAX_WRAP_MINUTES)).unwrap_or_default();
        Ok(Self {
            entries,
            index: 0,
            last_switch: None,
            wrap_delay: Duration::minutes(wrap_minutes),
        })
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn current(&self) -> &ScheduleEntry {
        &self.entries[self.index]
    }

    /// Begin at the first entry.
    pub fn start(&mut self, now: DateTime<Utc>) -> &ScheduleEntry {
        self.index = 0;
        self.last_switch = Some(now);
        self.current()
    }

    /// How long entry `index` runs. `None` means forever.
    pub fn delay_after(&self, index: usize) -> Option<Duration> {
        if self.entries.len() < 2 {
            return None;
        }
        let next = (index + 1) % self.entries.len();
        if next == 0 {
            return Some(self.wrap_delay);
        }
        let gap = self.entries[next].timestamp - self.entries[index].timestamp;
        Some(gap.max(Duration::zero()))
    }

    /// Time left before the next switch; `None` if not started or never.
    pub fn time_until_switch(&self, now: DateTime<Utc>) -> Option<Duration> {
        let last = self.last_switch?;
        let due = last.checked_add_signed(self.delay_after(self.index)?)?;
        Some((due - now).max(Duration::zero()))
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.time_until_switch(now)
            .is_some_and(|left| left <= Duration::zero())
    }

    /// The entry the next switch activates.
    pub fn peek_next(&self) -> &ScheduleEntry {
        &self.entries[(self.index + 1) % self.entries.len()]
    }

    /// Move to the next entry, wrapping around.
    pub fn advance(&mut self, now: DateTime<Utc>) -> &ScheduleEntry {
        self.index = (self.index + 1) % self.entries.len();
        self.last_switch = Some(now);
        self.current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(name: &str, hour: u32, minute: u32) -> ScheduleEntry {
        ScheduleEntry {
            program_id: name.to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 5, 1, hour, minute, 0).unwrap(),
            gate_assignments: BTreeMap::from([("1".to_string(), "R_100_140_1000_0_NA_NA".to_string())]),
        }
    }

    #[test]
    fn test_parse_schedule_file() {
        let json = r#"{"assignments":[
            {"program_id":"a","timestamp":"2025-05-01T06:00:00","gate_assignments":{"1":"R_1_2_0_0_NA_NA","2":"R_3_4_0_0_NA_NA"}},
            {"program_id":"b","timestamp":"2025-05-01T07:30:00Z","gate_assignments":{}}
        ]}"#;
        let file: ScheduleFile = serde_json::from_str(json).unwrap();
        assert_eq!(file.assignments.len(), 2);
        let gates = file.assignments[0].gate_names().unwrap();
        assert_eq!(gates.get(&2).map(String::as_str), Some("R_3_4_0_0_NA_NA"));
        assert_eq!(
            file.assignments[0].timestamp,
            Utc.with_ymd_and_hms(2025, 5, 1, 6, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_delays_follow_entry_gaps_and_wrap() {
        let schedule =
            ProgramSchedule::from_entries(vec![entry("a", 6, 0), entry("b", 7, 30), entry("c", 8, 0)], 180)
                .unwrap();
        assert_eq!(schedule.delay_after(0), Some(Duration::minutes(90)));
        assert_eq!(schedule.delay_after(1), Some(Duration::minutes(30)));
        assert_eq!(schedule.delay_after(2), Some(Duration::minutes(180)));
    }

    #[test]
    fn test_single_entry_never_switches() {
        let mut schedule = ProgramSchedule::from_entries(vec![entry("a", 6, 0)], 180).unwrap();
        let now = Utc::now();
        schedule.start(now);
        assert!(!schedule.is_due(now + Duration::days(30)));
        assert!(schedule.time_until_switch(now).is_none());
    }

    #[test]
    fn test_is_due_and_advance() {
        let mut schedule =
            ProgramSchedule::from_entries(vec![entry("a", 6, 0), entry("b", 6, 10)], 60).unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        assert!(!schedule.is_due(now), "not started");
        schedule.start(now);
        assert!(!schedule.is_due(now + Duration::minutes(9)));
        assert!(schedule.is_due(now + Duration::minutes(10)));

        assert_eq!(schedule.peek_next().program_id, "b");
        let next = schedule.advance(now + Duration::minutes(10));
        assert_eq!(next.program_id, "b");
        assert_eq!(
            schedule.time_until_switch(now + Duration::minutes(10)),
            Some(Duration::minutes(60))
        );
        assert_eq!(schedule.advance(now + Duration::minutes(70)).program_id, "a");
    }

    #[test]
    fn test_invalid_entries_rejected() {
        assert!(matches!(
            ProgramSchedule::from_entries(Vec::new(), 180),
            Err(ScheduleError::Empty)
        ));
        let mut bad = entry("x", 6, 0);
        bad.gate_assignments.insert("left".to_string(), "R_1_2_0_0_NA_NA".to_string());
        assert!(matches!(
            ProgramSchedule::from_entries(vec![bad], 180),
            Err(ScheduleError::InvalidGate { .. })
        ));
    }
}
