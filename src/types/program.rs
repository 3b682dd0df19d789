//! Program scoping: Program, RunConfig, GateAssignment

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::events::{Gate, ProgramId, RecipeId, RunConfigId, REJECT_GATE};

// ============================================================================
// Program
// ============================================================================

/// A scheduling epoch: the unit of cumulative-statistics reset.
///
/// `end_ts == None` means either "currently active" or "crashed mid-run";
/// startup recovery resolves the latter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub id: ProgramId,
    pub name: String,
    pub start_ts: DateTime<Utc>,
    pub end_ts: Option<DateTime<Utc>>,
}

impl Program {
    /// Program name derived from its activation instant: `program_YYYYMMDD_HHMMSS`.
    pub fn name_for(start_ts: DateTime<Utc>) -> String {
        format!("program_{}", start_ts.format("%Y%m%d_%H%M%S"))
    }

    pub const fn is_open(&self) -> bool {
        self.end_ts.is_none()
    }
}

// ============================================================================
// Gate Assignment
// ============================================================================

/// Mapping `gate -> recipe` valid for the lifetime of one [`RunConfig`].
///
/// Several gates may map to the same recipe; [`GateAssignment::recipes`]
/// groups them so each recipe is aggregated exactly once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GateAssignment {
    gates: BTreeMap<Gate, RecipeId>,
}

impl GateAssignment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign `gate` to `recipe`. The reject gate cannot carry a recipe;
    /// returns `false` when the assignment was refused.
    pub fn assign(&mut self, gate: Gate, recipe: RecipeId) -> bool {
        if gate == REJECT_GATE {
            return false;
        }
        self.gates.insert(gate, recipe);
        true
    }

    pub fn recipe_for(&self, gate: Gate) -> Option<RecipeId> {
        self.gates.get(&gate).copied()
    }

    /// Recipes with the (ascending) gates each one owns.
    pub fn recipes(&self) -> BTreeMap<RecipeId, Vec<Gate>> {
        let mut grouped: BTreeMap<RecipeId, Vec<Gate>> = BTreeMap::new();
        for (&gate, &recipe) in &self.gates {
            grouped.entry(recipe).or_default().push(gate);
        }
        grouped
    }

    pub fn iter(&self) -> impl Iterator<Item = (Gate, RecipeId)> + '_ {
        self.gates.iter().map(|(&g, &r)| (g, r))
    }

    pub fn len(&self) -> usize {
        self.gates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }
}

impl FromIterator<(Gate, RecipeId)> for GateAssignment {
    fn from_iter<I: IntoIterator<Item = (Gate, RecipeId)>>(iter: I) -> Self {
        let mut assignment = Self::new();
        for (gate, recipe) in iter {
            assignment.assign(gate, recipe);
        }
        assignment
    }
}

// ============================================================================
// Run Config
// ============================================================================

/// Where a run config came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    /// Activated from the program schedule.
    Schedule,
    /// Activated by an explicit re-assignment.
    Manual,
    /// Rebuilt during recovery from batch records.
    Reconstructed,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Schedule => write!(f, "schedule"),
            ConfigSource::Manual => write!(f, "manual"),
            ConfigSource::Reconstructed => write!(f, "reconstructed"),
        }
    }
}

/// One gate assignment, scoped to a program, effective from `activated_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    pub id: RunConfigId,
    pub program_id: ProgramId,
    pub name: String,
    pub source: ConfigSource,
    pub activated_at: DateTime<Utc>,
    pub assignment: GateAssignment,
}
