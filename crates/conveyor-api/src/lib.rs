//! HTTP server for the Conveyor CI orchestrator.
//!
//! Serves the worker protocol, event ingestion and job administration, and
//! talks back to GitHub through [`github::GitHubHost`].

pub mod error;
pub mod extract;
pub mod github;
pub mod routes;
pub mod state;

pub use state::AppState;
