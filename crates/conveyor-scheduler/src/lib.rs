//! Scheduling for the Conveyor CI orchestrator.
//!
//! Turns incoming events into jobs, decides which jobs may run, and serves
//! the worker protocol that hands them out. All state lives behind
//! [`conveyor_db::Store`], so several server processes can share one
//! database.

pub mod catalog;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod notify;
pub mod readiness;

#[cfg(test)]
pub(crate) mod testing;

pub use catalog::{RecipeCatalog, SyncReport};
pub use dispatch::{Caller, DispatchService, step_status};
pub use error::{Result, SchedulerError};
pub use lifecycle::{EventController, EventOutcome};
pub use notify::StatusReporter;
pub use readiness::{EventSnapshot, Evaluation, ReadinessEngine};
