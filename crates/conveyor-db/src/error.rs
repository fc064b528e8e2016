//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl From<conveyor_core::Error> for DbError {
    fn from(err: conveyor_core::Error) -> Self {
        DbError::Corrupt(err.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Corrupt(err.to_string())
    }
}

/// Map a unique-constraint violation to [`DbError::Duplicate`].
pub(crate) fn duplicate_on_conflict(err: sqlx::Error, what: impl Into<String>) -> DbError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => DbError::Duplicate(what.into()),
        _ => DbError::Database(err),
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;
