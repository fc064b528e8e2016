//! Git hosting capability.
//!
//! The orchestrator only ever needs a handful of calls back into the
//! hosting provider. Each provider gets one implementation of [`GitHost`].

use async_trait::async_trait;
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::status::Status;

/// Commit status states understood by hosting providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum CommitState {
    #[display("pending")]
    Pending,
    #[display("success")]
    Success,
    #[display("failure")]
    Failure,
    #[display("error")]
    Error,
}

impl From<Status> for CommitState {
    fn from(status: Status) -> Self {
        match status {
            Status::Success | Status::FailedOk | Status::Skipped => CommitState::Success,
            Status::Failed | Status::IntermittentFailure => CommitState::Failure,
            Status::Canceled => CommitState::Error,
            Status::NotStarted | Status::Running | Status::ActivationRequired => {
                CommitState::Pending
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStatusUpdate {
    pub repository: String,
    pub sha: String,
    pub state: CommitState,
    /// Link back to the job page.
    pub target_url: Option<String>,
    pub description: String,
    /// Identifies the job, e.g. `Conveyor/test (linux)`.
    pub context: String,
}

#[async_trait]
pub trait GitHost: Send + Sync {
    /// Provider name (e.g., "github").
    fn name(&self) -> &'static str;

    async fn update_commit_status(&self, update: &CommitStatusUpdate) -> Result<()>;

    async fn post_comment(&self, comments_url: &str, body: &str) -> Result<()>;

    async fn is_collaborator(&self, user: &str, repository: &str) -> Result<bool>;

    async fn install_webhook(&self, repository: &str, hook_url: &str, secret: &str)
    -> Result<()>;
}

/// Host used when remote updates are switched off: every call succeeds and
/// nobody is a collaborator.
pub struct DisabledHost;

#[async_trait]
impl GitHost for DisabledHost {
    fn name(&self) -> &'static str {
        "disabled"
    }

    async fn update_commit_status(&self, _update: &CommitStatusUpdate) -> Result<()> {
        Ok(())
    }

    async fn post_comment(&self, _comments_url: &str, _body: &str) -> Result<()> {
        Ok(())
    }

    async fn is_collaborator(&self, _user: &str, _repository: &str) -> Result<bool> {
        Ok(false)
    }

    async fn install_webhook(
        &self,
        _repository: &str,
        _hook_url: &str,
        _secret: &str,
    ) -> Result<()> {
        Ok(())
    }
}
