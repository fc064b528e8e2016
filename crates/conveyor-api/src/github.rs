//! GitHub implementation of the git host capability.

use async_trait::async_trait;
use conveyor_config::GitHubSettings;
use conveyor_core::host::{CommitStatusUpdate, GitHost};
use reqwest::StatusCode;
use serde::Serialize;
use tracing::debug;

/// GitHub truncates longer status descriptions with an error.
const MAX_DESCRIPTION: usize = 140;

/// GitHub API errors.
#[derive(Debug, thiserror::Error)]
pub enum GitHubError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("API error: {0}")]
    Api(String),
}

impl From<GitHubError> for conveyor_core::Error {
    fn from(err: GitHubError) -> Self {
        conveyor_core::Error::GitHost(err.to_string())
    }
}

#[derive(Debug, Serialize)]
struct StatusPayload<'a> {
    state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_url: Option<&'a str>,
    description: String,
    context: &'a str,
}

/// GitHub API client.
pub struct GitHubHost {
    client: reqwest::Client,
    token: String,
    api_url: String,
}

impl GitHubHost {
    pub fn new(settings: &GitHubSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            token: settings.token.clone(),
            api_url: settings.api_url.trim_end_matches('/').to_string(),
        }
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("User-Agent", "Conveyor-CI")
            .header("Accept", "application/vnd.github+json")
    }

    async fn send(&self, builder: reqwest::RequestBuilder, what: &str) -> Result<(), GitHubError> {
        let response = builder
            .send()
            .await
            .map_err(|e| GitHubError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(GitHubError::Api(format!(
                "Failed to {} ({}): {}",
                what, status, text
            )));
        }
        Ok(())
    }
}

fn truncate(description: &str) -> String {
    description.chars().take(MAX_DESCRIPTION).collect()
}

#[async_trait]
impl GitHost for GitHubHost {
    fn name(&self) -> &'static str {
        "github"
    }

    async fn update_commit_status(&self, update: &CommitStatusUpdate) -> conveyor_core::Result<()> {
        let url = format!(
            "{}/repos/{}/statuses/{}",
            self.api_url, update.repository, update.sha
        );
        let payload = StatusPayload {
            state: update.state.to_string(),
            target_url: update.target_url.as_deref(),
            description: truncate(&update.description),
            context: &update.context,
        };
        debug!(repository = %update.repository, sha = %update.sha, state = %update.state, "Setting GitHub status");
        self.send(
            self.request(reqwest::Method::POST, &url).json(&payload),
            "set commit status",
        )
        .await?;
        Ok(())
    }

    async fn post_comment(&self, comments_url: &str, body: &str) -> conveyor_core::Result<()> {
        let payload = serde_json::json!({ "body": body });
        self.send(
            self.request(reqwest::Method::POST, comments_url)
                .json(&payload),
            "post comment",
        )
        .await?;
        Ok(())
    }

    async fn is_collaborator(&self, user: &str, repository: &str) -> conveyor_core::Result<bool> {
        let url = format!(
            "{}/repos/{}/collaborators/{}",
            self.api_url,
            repository,
            urlencoding::encode(user)
        );
        let response = self
            .request(reqwest::Method::GET, &url)
            .send()
            .await
            .map_err(|e| GitHubError::Request(e.to_string()))?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                let text = response.text().await.unwrap_or_default();
                Err(GitHubError::Api(format!(
                    "Failed to check collaborator ({}): {}",
                    status, text
                ))
                .into())
            }
        }
    }

    async fn install_webhook(
        &self,
        repository: &str,
        hook_url: &str,
        secret: &str,
    ) -> conveyor_core::Result<()> {
        let url = format!("{}/repos/{}/hooks", self.api_url, repository);

        let payload = serde_json::json!({
            "name": "web",
            "active": true,
            "events": ["push", "pull_request"],
            "config": {
                "url": hook_url,
                "content_type": "json",
                "secret": secret,
                "insecure_ssl": "0"
            }
        });

        self.send(
            self.request(reqwest::Method::POST, &url).json(&payload),
            "create webhook",
        )
        .await?;
        Ok(())
    }
}
