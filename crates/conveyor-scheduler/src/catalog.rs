//! Keeps the stored recipes in step with the recipe files on disk.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use conveyor_config::{load_recipe_dir, validate_recipes};
use conveyor_core::recipe::{Recipe, RecipeDefinition};
use conveyor_db::Store;
use tracing::info;

use crate::Result;

/// What a sync changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Filenames that got a new recipe version.
    pub created: Vec<String>,
    pub unchanged: usize,
    /// Filenames whose previous version stopped being current.
    pub retired: Vec<String>,
    /// Retired versions deleted because no job referenced them.
    pub deleted: usize,
}

pub struct RecipeCatalog {
    store: Arc<dyn Store>,
}

impl RecipeCatalog {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn sync_dir(&self, dir: &Path) -> Result<SyncReport> {
        let definitions = load_recipe_dir(dir)?;
        self.sync(definitions).await
    }

    /// Make `definitions` the current recipe set.
    ///
    /// Existing jobs keep pointing at the version they were created from;
    /// only versions nothing references are deleted.
    pub async fn sync(&self, definitions: Vec<RecipeDefinition>) -> Result<SyncReport> {
        validate_recipes(&definitions)?;

        let mut current: HashMap<String, Vec<Recipe>> = HashMap::new();
        for recipe in self.store.current_recipes().await? {
            current
                .entry(recipe.definition.filename.clone())
                .or_default()
                .push(recipe);
        }

        let mut report = SyncReport::default();
        for definition in definitions {
            let previous = current.remove(&definition.filename).unwrap_or_default();
            if previous.len() == 1 && previous[0].definition == definition {
                report.unchanged += 1;
                continue;
            }

            let recipe = self.store.create_recipe(&definition).await?;
            info!(recipe_id = %recipe.id, filename = %definition.filename, "Loaded new recipe version");
            report.created.push(definition.filename.clone());
            for old in previous {
                self.retire(old, &mut report).await?;
            }
        }

        // Whatever is left has no file any more.
        for (_, gone) in current {
            for old in gone {
                self.retire(old, &mut report).await?;
            }
        }
        Ok(report)
    }

    async fn retire(&self, recipe: Recipe, report: &mut SyncReport) -> Result<()> {
        let deleted = self.store.retire_recipe(recipe.id).await?;
        info!(recipe_id = %recipe.id, filename = %recipe.definition.filename, deleted, "Retired recipe");
        if deleted {
            report.deleted += 1;
        }
        if !report.retired.contains(&recipe.definition.filename) {
            report.retired.push(recipe.definition.filename);
        }
        Ok(())
    }
}
