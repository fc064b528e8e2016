//! Recipe repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::ResourceId;
use conveyor_core::recipe::{Cause, Recipe, RecipeDefinition};

use super::PgStore;
use crate::{DbError, DbResult};

#[derive(Debug, Clone, sqlx::FromRow)]
struct RecipeRecord {
    id: uuid::Uuid,
    current: bool,
    definition: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<RecipeRecord> for Recipe {
    type Error = DbError;

    fn try_from(record: RecipeRecord) -> DbResult<Self> {
        Ok(Recipe {
            id: ResourceId::from_uuid(record.id),
            current: record.current,
            created_at: record.created_at,
            definition: serde_json::from_value(record.definition)?,
        })
    }
}

#[async_trait]
pub trait RecipeRepo: Send + Sync {
    /// Store a new, current version of a recipe.
    async fn create_recipe(&self, definition: &RecipeDefinition) -> DbResult<Recipe>;

    async fn get_recipe(&self, id: ResourceId) -> DbResult<Recipe>;

    async fn current_recipes(&self) -> DbResult<Vec<Recipe>>;

    /// The newest current recipe for a file, if the file is still loaded.
    async fn current_recipe_for(&self, filename: &str, cause: Cause)
    -> DbResult<Option<Recipe>>;

    /// Mark a recipe as no longer current and delete it if no job uses it.
    /// Returns `true` if the row was deleted.
    async fn retire_recipe(&self, id: ResourceId) -> DbResult<bool>;

    /// Delete a retired recipe once its last job has moved on.
    async fn delete_recipe_if_unused(&self, id: ResourceId) -> DbResult<bool>;
}

#[async_trait]
impl RecipeRepo for PgStore {
    async fn create_recipe(&self, definition: &RecipeDefinition) -> DbResult<Recipe> {
        let record = sqlx::query_as::<_, RecipeRecord>(
            r#"
            INSERT INTO recipes (id, filename, cause, build_user, repository, current, definition, created_at)
            VALUES ($1, $2, $3, $4, $5, TRUE, $6, NOW())
            RETURNING id, current, definition, created_at
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(&definition.filename)
        .bind(definition.cause.to_string())
        .bind(&definition.build_user)
        .bind(&definition.repository)
        .bind(serde_json::to_value(definition)?)
        .fetch_one(&self.pool)
        .await?;
        record.try_into()
    }

    async fn get_recipe(&self, id: ResourceId) -> DbResult<Recipe> {
        sqlx::query_as::<_, RecipeRecord>(
            "SELECT id, current, definition, created_at FROM recipes WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("recipe {}", id)))?
        .try_into()
    }

    async fn current_recipes(&self) -> DbResult<Vec<Recipe>> {
        let records = sqlx::query_as::<_, RecipeRecord>(
            r#"
            SELECT id, current, definition, created_at FROM recipes
            WHERE current
            ORDER BY filename, created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(Recipe::try_from).collect()
    }

    async fn current_recipe_for(
        &self,
        filename: &str,
        cause: Cause,
    ) -> DbResult<Option<Recipe>> {
        sqlx::query_as::<_, RecipeRecord>(
            r#"
            SELECT id, current, definition, created_at FROM recipes
            WHERE current AND filename = $1 AND cause = $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(filename)
        .bind(cause.to_string())
        .fetch_optional(&self.pool)
        .await?
        .map(Recipe::try_from)
        .transpose()
    }

    async fn retire_recipe(&self, id: ResourceId) -> DbResult<bool> {
        sqlx::query("UPDATE recipes SET current = FALSE WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        self.delete_recipe_if_unused(id).await
    }

    async fn delete_recipe_if_unused(&self, id: ResourceId) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM recipes
            WHERE id = $1
              AND NOT current
              AND NOT EXISTS (SELECT 1 FROM jobs WHERE recipe_id = $1)
            "#,
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
