//! Error types for Conveyor.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("git host error: {0}")]
    GitHost(String),
}

pub type Result<T> = std::result::Result<T, Error>;
