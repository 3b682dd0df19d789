//! Recipe specifications and the append-only recipe catalog
//!
//! A recipe bounds eligible piece weight and defines when a batch counts as
//! complete, either by weight (`batch_min`) or by piece count. Its identity is
//! the canonical name encoding every field:
//!
//! ```text
//! R_<pieceMin>_<pieceMax>_<batchMin>_<batchMax>_<tag>_<value>
//! ```
//!
//! Tags are `exact`, `min` (at least), `max` (at most) or `NA`. Numeric
//! fields accept `NA` for "unset" (0 grams); a count value of `NA`, `0` or an
//! empty string means the recipe has no count policy.

mod catalog;

pub use catalog::{Recipe, RecipeCatalog};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecipeError {
    #[error("Recipe name '{0}' does not match R_<pieceMin>_<pieceMax>_<batchMin>_<batchMax>_<tag>_<value>")]
    InvalidName(String),

    #[error("Recipe field {field} has invalid value '{value}'")]
    InvalidField { field: &'static str, value: String },

    #[error("Unknown count policy tag '{0}'")]
    UnknownCountTag(String),

    #[error("Invalid bounds: {0}")]
    InvalidBounds(String),
}

// ============================================================================
// Count Policy
// ============================================================================

/// Piece-count completion criterion of a recipe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "count")]
pub enum CountPolicy {
    /// Weight-bounded recipe.
    #[default]
    None,
    /// A batch is complete at exactly `n` pieces.
    Exact(u32),
    /// A batch is complete at `n` or more pieces.
    AtLeast(u32),
    /// Upper piece limit only; batches are evaluated by weight.
    AtMost(u32),
}

impl CountPolicy {
    /// Piece count that defines a full batch, for count-bounded recipes.
    pub const fn target_count(self) -> Option<u32> {
        match self {
            CountPolicy::Exact(n) | CountPolicy::AtLeast(n) => Some(n),
            CountPolicy::None | CountPolicy::AtMost(_) => None,
        }
    }

    fn from_parts(tag: &str, value: &str) -> Result<Self, RecipeError> {
        let count = match value.trim() {
            "" | "NA" | "0" => return Ok(CountPolicy::None),
            v => parse_count(v)?,
        };
        if count == 0 {
            return Ok(CountPolicy::None);
        }
        match tag.trim() {
            "NA" => Ok(CountPolicy::None),
            "exact" => Ok(CountPolicy::Exact(count)),
            "min" => Ok(CountPolicy::AtLeast(count)),
            "max" => Ok(CountPolicy::AtMost(count)),
            other => Err(RecipeError::UnknownCountTag(other.to_string())),
        }
    }

    const fn tag(self) -> &'static str {
        match self {
            CountPolicy::None => "NA",
            CountPolicy::Exact(_) => "exact",
            CountPolicy::AtLeast(_) => "min",
            CountPolicy::AtMost(_) => "max",
        }
    }
}

// ============================================================================
// Recipe Spec
// ============================================================================

/// Immutable recipe specification. All weights in grams; 0 means unset for
/// the batch bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecipeSpec {
    pub piece_min: u32,
    pub piece_max: u32,
    pub batch_min: u32,
    pub batch_max: u32,
    pub count_policy: CountPolicy,
}

impl RecipeSpec {
    /// Validated constructor.
    pub fn new(
        piece_min: u32,
        piece_max: u32,
        batch_min: u32,
        batch_max: u32,
        count_policy: CountPolicy,
    ) -> Result<Self, RecipeError> {
        if piece_min > piece_max {
            return Err(RecipeError::InvalidBounds(format!(
                "piece_min ({piece_min}) must be <= piece_max ({piece_max})"
            )));
        }
        if batch_max > 0 && batch_min > batch_max {
            return Err(RecipeError::InvalidBounds(format!(
                "batch_min ({batch_min}) must be <= batch_max ({batch_max})"
            )));
        }
        let count_policy = match count_policy {
            CountPolicy::Exact(0) | CountPolicy::AtLeast(0) | CountPolicy::AtMost(0) => {
                CountPolicy::None
            }
            other => other,
        };
        Ok(Self {
            piece_min,
            piece_max,
            batch_min,
            batch_max,
            count_policy,
        })
    }

    /// Deterministic name encoding every field.
    pub fn canonical_name(&self) -> String {
        self.to_string()
    }

    /// Whether a piece of this weight is eligible (inclusive bounds).
    pub fn accepts_piece(&self, weight_g: f64) -> bool {
        weight_g >= f64::from(self.piece_min) && weight_g <= f64::from(self.piece_max)
    }
}

impl fmt::Display for RecipeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "R_{}_{}_{}_{}_",
            self.piece_min, self.piece_max, self.batch_min, self.batch_max
        )?;
        match self.count_policy {
            CountPolicy::None => write!(f, "NA_NA"),
            CountPolicy::Exact(n) | CountPolicy::AtLeast(n) | CountPolicy::AtMost(n) => {
                write!(f, "{}_{}", self.count_policy.tag(), n)
            }
        }
    }
}

impl FromStr for RecipeSpec {
    type Err = RecipeError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = name.trim().splitn(7, '_').collect();
        if parts.len() != 7 || parts[0] != "R" {
            return Err(RecipeError::InvalidName(name.to_string()));
        }
        let piece_min = parse_grams("piece_min", parts[1])?;
        let piece_max = parse_grams("piece_max", parts[2])?;
        let batch_min = parse_grams("batch_min", parts[3])?;
        let batch_max = parse_grams("batch_max", parts[4])?;
        let count_policy = CountPolicy::from_parts(parts[5], parts[6])?;
        Self::new(piece_min, piece_max, batch_min, batch_max, count_policy)
    }
}

fn parse_grams(field: &'static str, raw: &str) -> Result<u32, RecipeError> {
    match raw.trim() {
        "" | "NA" => Ok(0),
        v => v.parse::<u32>().map_err(|_| RecipeError::InvalidField {
            field,
            value: raw.to_string(),
        }),
    }
}

/// Counts may be written as floats ("10.0") by spreadsheet exports.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn parse_count(raw: &str) -> Result<u32, RecipeError> {
    if let Ok(n) = raw.parse::<u32>() {
        return Ok(n);
    }
    let invalid = || RecipeError::InvalidField {
        field: "count_value",
        value: raw.to_string(),
    };
    let value: f64 = raw.parse().map_err(|_| invalid())?;
    if value.is_finite() && value >= 0.0 && value.fract() == 0.0 && value <= f64::from(u32::MAX) {
        Ok(value as u32)
    } else {
        Err(invalid())
    }
}
