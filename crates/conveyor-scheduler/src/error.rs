//! Scheduler error types.

use conveyor_config::ConfigError;
use conveyor_db::DbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("not found: {0}")]
    NotFound(String),

    /// A worker asked for something it is not entitled to, e.g. reporting on
    /// a job bound to another client.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("database error: {0}")]
    Database(DbError),
}

impl From<DbError> for SchedulerError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(what) => SchedulerError::NotFound(what),
            other => SchedulerError::Database(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
