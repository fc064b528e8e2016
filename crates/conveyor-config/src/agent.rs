//! Worker agent configuration file parsing.
//!
//! Every setting is optional here; the agent binary layers command-line
//! flags on top and fills the remaining gaps with its defaults.

use std::path::PathBuf;

use conveyor_core::recipe::EnvVar;
use kdl::KdlDocument;
use serde::{Deserialize, Serialize};

use crate::nodes::{
    all_string_args, bool_arg, bool_prop, env_block, first_string_arg, required_string_arg,
    string_prop, u64_arg,
};
use crate::{ConfigError, ConfigResult};

/// A server the agent polls for work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub url: String,
    pub build_key: String,
    pub verify_ssl: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentFile {
    pub name: Option<String>,
    pub build_root: Option<PathBuf>,
    pub poll_secs: Option<u64>,
    pub update_step_time_secs: Option<u64>,
    pub server_update_interval_secs: Option<u64>,
    pub server_update_timeout_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub max_output_size: Option<u64>,
    pub max_step_time_secs: Option<u64>,
    pub single_shot: Option<bool>,
    pub servers: Vec<ServerEntry>,
    pub configs: Vec<String>,
    pub environment: Vec<EnvVar>,
}

/// Parse agent configuration from KDL text.
pub fn parse_agent_config(kdl: &str) -> ConfigResult<AgentFile> {
    let doc: KdlDocument = kdl.parse()?;
    let mut file = AgentFile::default();

    for node in doc.nodes() {
        match node.name().value() {
            "agent" => {
                let Some(children) = node.children() else {
                    continue;
                };
                for child in children.nodes() {
                    let key = child.name().value();
                    match key {
                        "name" => file.name = first_string_arg(child),
                        "build-root" => {
                            file.build_root = Some(required_string_arg(child, key)?.into())
                        }
                        "poll" => file.poll_secs = Some(u64_arg(child, key)?),
                        "update-step-time" => {
                            file.update_step_time_secs = Some(u64_arg(child, key)?)
                        }
                        "server-update-interval" => {
                            file.server_update_interval_secs = Some(u64_arg(child, key)?)
                        }
                        "server-update-timeout" => {
                            file.server_update_timeout_secs = Some(u64_arg(child, key)?)
                        }
                        "request-timeout" => file.request_timeout_secs = Some(u64_arg(child, key)?),
                        "max-output-size" => file.max_output_size = Some(u64_arg(child, key)?),
                        "max-step-time" => file.max_step_time_secs = Some(u64_arg(child, key)?),
                        "single-shot" => file.single_shot = Some(bool_arg(child, key)?),
                        _ => {}
                    }
                }
            }
            "server" => {
                let url = required_string_arg(node, "server url")?;
                let build_key = string_prop(node, "build-key").ok_or_else(|| {
                    ConfigError::MissingField(format!("build-key for server {}", url))
                })?;
                file.servers.push(ServerEntry {
                    url,
                    build_key,
                    verify_ssl: bool_prop(node, "verify-ssl").unwrap_or(true),
                });
            }
            "configs" => file.configs.extend(all_string_args(node)),
            "env" => file.environment.extend(env_block(node)),
            _ => {}
        }
    }

    Ok(file)
}
