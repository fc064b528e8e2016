//! Repository traits and their PostgreSQL implementation.

pub mod client;
pub mod event;
pub mod job;
pub mod recipe;

pub use client::ClientRepo;
pub use event::EventRepo;
pub use job::{JobRepo, NewJob, ReadyRow};
pub use recipe::RecipeRepo;

use sqlx::PgPool;

/// Everything the scheduler needs from persistence.
pub trait Store: RecipeRepo + EventRepo + JobRepo + ClientRepo {}

impl<T> Store for T where T: RecipeRepo + EventRepo + JobRepo + ClientRepo {}

/// PostgreSQL-backed [`Store`].
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
