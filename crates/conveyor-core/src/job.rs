//! Jobs, their step results, and the workers that run them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ResourceId;
use crate::status::{ClientStatus, Status, aggregate};

/// One recipe at one build config inside one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: ResourceId,
    pub event_id: ResourceId,
    pub recipe_id: ResourceId,
    pub config: String,
    pub status: Status,
    /// Dependencies are satisfied and the job may be claimed.
    pub ready: bool,
    /// The job was authorized to run at all.
    pub active: bool,
    pub complete: bool,
    pub invalidated: bool,
    /// Re-runs must go to the client that had the job before.
    pub same_client: bool,
    pub client_id: Option<ResourceId>,
    pub seconds: i64,
    pub failed_step: Option<String>,
    pub running_step: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Can a worker claim this job right now?
    pub fn is_claimable(&self) -> bool {
        self.active && self.ready && !self.complete && self.status == Status::NotStarted
    }

    /// Is the job pinned to a client other than `client_id`?
    pub fn pinned_elsewhere(&self, client_id: ResourceId) -> bool {
        self.invalidated
            && self.same_client
            && self.client_id.is_some_and(|owner| owner != client_id)
    }
}

/// Event status from its jobs: only active jobs that became ready count.
pub fn event_status<'a, I>(jobs: I) -> Status
where
    I: IntoIterator<Item = &'a Job>,
{
    aggregate(
        jobs.into_iter()
            .filter(|job| job.active && job.ready)
            .map(|job| job.status),
    )
}

/// Recorded outcome of one recipe step for one job.
///
/// Step metadata is copied in at claim time so later recipe edits cannot
/// rewrite history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub id: ResourceId,
    pub job_id: ResourceId,
    pub name: String,
    pub position: i32,
    pub abort_on_failure: bool,
    pub allowed_to_fail: bool,
    pub exit_status: i32,
    pub status: Status,
    pub complete: bool,
    pub output: String,
    pub seconds: i64,
}

impl StepResult {
    pub fn new(job_id: ResourceId, position: i32, name: &str) -> Self {
        Self {
            id: ResourceId::new(),
            job_id,
            name: name.to_string(),
            position,
            abort_on_failure: true,
            allowed_to_fail: false,
            exit_status: 0,
            status: Status::NotStarted,
            complete: false,
            output: String::new(),
            seconds: 0,
        }
    }
}

/// A registered worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: ResourceId,
    pub name: String,
    pub address: String,
    pub status: ClientStatus,
    pub status_message: String,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub job_id: ResourceId,
    pub message: String,
    pub created_at: DateTime<Utc>,
}
