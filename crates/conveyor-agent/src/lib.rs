//! Worker agent for the Conveyor CI orchestrator.
//!
//! One agent runs one job at a time:
//! - `getter` polls the configured servers and claims a ready job
//! - `runner` executes its steps as bash subprocesses
//! - `updater` delivers step reports in order on a background task
//!
//! Cancel and stop requests from signals or server replies meet in a
//! single [`CommandSignal`].

pub mod agent;
pub mod command;
pub mod getter;
pub mod interrupt;
pub mod process;
pub mod runner;
pub mod settings;
pub mod transport;
pub mod updater;

#[cfg(test)]
pub(crate) mod testing;

pub use agent::Agent;
pub use command::CommandSignal;
pub use getter::{ClaimedJob, JobGetter};
pub use interrupt::Interrupts;
pub use runner::{JobOutcome, JobRunner, RunnerError};
pub use settings::{AgentArgs, AgentSettings};
pub use transport::{HttpServerApi, Message, ServerApi, TransportError};
pub use updater::ServerUpdater;
