//! KDL configuration parsing for Conveyor.
//!
//! This crate handles parsing of:
//! - Recipe files (one `recipe` node per `*.kdl` file)
//! - Server configuration (`server.kdl`)
//! - Worker agent configuration (`agent.kdl`)

pub mod agent;
pub mod error;
mod nodes;
pub mod recipe;
pub mod server;

pub use agent::{AgentFile, ServerEntry, parse_agent_config};
pub use error::{ConfigError, ConfigResult};
pub use recipe::{load_recipe_dir, parse_recipe, validate_recipes};
pub use server::{BranchSettings, GitHubSettings, ServerConfig, parse_server_config};
