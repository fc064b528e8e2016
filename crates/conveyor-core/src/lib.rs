//! Core domain types and traits for the Conveyor CI orchestrator.
//!
//! This crate contains:
//! - Resource identifiers and the shared error type
//! - Status values and the status aggregation rule
//! - Recipe, event, job and step-result records
//! - The per-event dependency graph behind job readiness
//! - Worker protocol wire types
//! - The git-hosting capability trait

pub mod error;
pub mod event;
pub mod graph;
pub mod host;
pub mod id;
pub mod job;
pub mod protocol;
pub mod recipe;
pub mod status;

pub use error::{Error, Result};
pub use id::ResourceId;
pub use status::{ClientStatus, Status};
