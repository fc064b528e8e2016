//! Events: one base/head commit pair under one cause.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ResourceId;
use crate::recipe::Cause;
use crate::status::Status;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitRef {
    /// Full repository name, e.g. `owner/name`.
    pub repository: String,
    pub branch: String,
    pub sha: String,
    pub ssh_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullRequestAction {
    Opened,
    Synchronize,
    Reopened,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestRef {
    pub number: i64,
    #[serde(default)]
    pub title: String,
    pub action: PullRequestAction,
}

/// The canonical event representation handed to the lifecycle controller.
///
/// Translating provider webhooks into this shape happens outside Conveyor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEvent {
    pub cause: Cause,
    pub build_user: String,
    pub build_key: String,
    pub base: CommitRef,
    pub head: CommitRef,
    #[serde(default)]
    pub pull_request: Option<PullRequestRef>,
    #[serde(default)]
    pub trigger_user: String,
    #[serde(default)]
    pub comments_url: Option<String>,
    #[serde(default)]
    pub description: String,
    /// Manual events only: start a duplicate event even if this commit pair
    /// was already built.
    #[serde(default)]
    pub force: bool,
}

/// A persisted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: ResourceId,
    pub cause: Cause,
    pub build_user: String,
    pub build_key: String,
    pub base: CommitRef,
    pub head: CommitRef,
    pub pr_number: Option<i64>,
    pub trigger_user: String,
    pub comments_url: Option<String>,
    pub description: String,
    /// Distinguishes forced rebuilds of the same commit pair.
    pub duplicates: i32,
    pub status: Status,
    pub complete: bool,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn is_pull_request(&self) -> bool {
        self.cause == Cause::PullRequest && self.pr_number.is_some()
    }
}

/// A pull request's rolled-up status, tracked from its latest event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequestStatus {
    pub repository: String,
    pub number: i64,
    pub title: String,
    pub status: Status,
    pub closed: bool,
}

/// A branch's rolled-up status, tracked from its latest push event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchStatus {
    pub repository: String,
    pub branch: String,
    pub status: Status,
}
