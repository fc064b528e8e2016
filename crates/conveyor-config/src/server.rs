//! Server configuration parsing.

use kdl::KdlDocument;
use serde::{Deserialize, Serialize};

use crate::nodes::{all_string_args, bool_arg, bool_prop, first_string_arg, required_string_arg};
use crate::{ConfigError, ConfigResult};

/// Process-wide server settings, handed to each component at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind, e.g. `0.0.0.0:3000`.
    pub listen: Option<String>,
    /// Public URL of this server, used for links in statuses and comments.
    pub base_url: String,
    /// Post statuses and comments back to the git host.
    pub remote_update: bool,
    /// HMAC key that event producers sign request bodies with.
    pub event_secret: Option<String>,
    pub github: Option<GitHubSettings>,
    pub branches: Vec<BranchSettings>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: None,
            base_url: "http://localhost:3000".to_string(),
            remote_update: false,
            event_secret: None,
            github: None,
            branches: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn branch(&self, repository: &str, branch: &str) -> Option<&BranchSettings> {
        self.branches
            .iter()
            .find(|b| b.repository == repository && b.branch == branch)
    }

    /// Link to a job, for commit statuses and comments.
    pub fn job_url(&self, job_id: impl std::fmt::Display) -> String {
        format!(
            "{}/api/v1/jobs/{}",
            self.base_url.trim_end_matches('/'),
            job_id
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubSettings {
    pub token: String,
    pub api_url: String,
}

/// Per-branch push-event behavior.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchSettings {
    pub repository: String,
    pub branch: String,
    /// A new push cancels earlier, still running push events on the branch.
    pub auto_cancel_push: bool,
    /// Only hand out jobs for the newest push event on the branch.
    pub auto_cancel_except_current: bool,
}

/// Parse server configuration from KDL text.
pub fn parse_server_config(kdl: &str) -> ConfigResult<ServerConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = ServerConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "server" => {
                let Some(children) = node.children() else {
                    continue;
                };
                for child in children.nodes() {
                    match child.name().value() {
                        "listen" => config.listen = first_string_arg(child),
                        "base-url" => config.base_url = required_string_arg(child, "base-url")?,
                        "remote-update" => {
                            config.remote_update = bool_arg(child, "remote-update")?
                        }
                        "event-secret" => config.event_secret = first_string_arg(child),
                        _ => {}
                    }
                }
            }
            "github" => {
                let mut token = None;
                let mut api_url = "https://api.github.com".to_string();
                if let Some(children) = node.children() {
                    for child in children.nodes() {
                        match child.name().value() {
                            "token" => token = first_string_arg(child),
                            "api-url" => api_url = required_string_arg(child, "api-url")?,
                            _ => {}
                        }
                    }
                }
                let token =
                    token.ok_or_else(|| ConfigError::MissingField("github token".to_string()))?;
                config.github = Some(GitHubSettings { token, api_url });
            }
            "branch" => {
                let args = all_string_args(node);
                let [repository, branch] = <[String; 2]>::try_from(args).map_err(|_| {
                    ConfigError::invalid("branch", "expected repository and branch name")
                })?;
                config.branches.push(BranchSettings {
                    repository,
                    branch,
                    auto_cancel_push: bool_prop(node, "auto-cancel-push").unwrap_or(false),
                    auto_cancel_except_current: bool_prop(node, "auto-cancel-except-current")
                        .unwrap_or(false),
                });
            }
            _ => {}
        }
    }

    if !(config.base_url.starts_with("http://") || config.base_url.starts_with("https://")) {
        return Err(ConfigError::invalid(
            "base-url",
            format!("'{}' is not an http(s) URL", config.base_url),
        ));
    }

    Ok(config)
}
