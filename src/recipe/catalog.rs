//! Append-only recipe catalog keyed by canonical name

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::RecipeSpec;
#[cfg(test)]
use super::RecipeError;
use crate::types::RecipeId;

/// A catalogued recipe: stable id plus its immutable spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    pub id: RecipeId,
    /// Canonical name, always `spec.canonical_name()`.
    pub name: String,
    pub spec: RecipeSpec,
}

/// Recipes seen so far. Entries are created on first observation and are
/// never mutated or removed.
#[derive(Debug, Clone, Default)]
pub struct RecipeCatalog {
    by_id: BTreeMap<RecipeId, Recipe>,
    by_name: HashMap<String, RecipeId>,
}

impl RecipeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted recipes. Entries whose stored name is not
    /// canonical are re-keyed under the canonical encoding of their spec.
    pub fn from_recipes<I: IntoIterator<Item = Recipe>>(recipes: I) -> Self {
        let mut catalog = Self::new();
        for mut recipe in recipes {
            recipe.name = recipe.spec.canonical_name();
            catalog.by_name.insert(recipe.name.clone(), recipe.id);
            catalog.by_id.insert(recipe.id, recipe);
        }
        catalog
    }

    pub fn get(&self, id: RecipeId) -> Option<&Recipe> {
        self.by_id.get(&id)
    }

    /// Id of the recipe with this spec, if catalogued. Equivalent encodings
    /// (`exact_0` vs `NA_NA`) share one canonical name and so one id.
    pub fn id_of(&self, spec: &RecipeSpec) -> Option<RecipeId> {
        self.by_name.get(&spec.canonical_name()).copied()
    }

    /// Add a recipe whose id was allocated and persisted by the caller.
    /// An entry already present under the same name keeps its id.
    pub fn insert(&mut self, recipe: Recipe) -> RecipeId {
        if let Some(&id) = self.by_name.get(&recipe.name) {
            return id;
        }
        debug!(recipe_id = recipe.id, recipe = %recipe.name, "Catalogued new recipe");
        let id = recipe.id;
        self.by_name.insert(recipe.name.clone(), id);
        self.by_id.insert(id, recipe);
        id
    }

    pub fn iter(&self) -> impl Iterator<Item = &Recipe> {
        self.by_id.values()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
impl RecipeCatalog {
    /// Parse and register `name` with the next free id, without a store.
    pub(crate) fn resolve_name(&mut self, name: &str) -> Result<(RecipeId, bool), RecipeError> {
        let spec: RecipeSpec = name.parse()?;
        if let Some(id) = self.id_of(&spec) {
            return Ok((id, false));
        }
        let id = self.by_id.keys().next_back().map_or(1, |max| max + 1);
        let recipe = Recipe {
            id,
            name: spec.canonical_name(),
            spec,
        };
        Ok((self.insert(recipe), true))
    }
}
