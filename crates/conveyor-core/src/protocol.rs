//! Wire types shared by the dispatch service and the worker agent.

use serde::{Deserialize, Serialize};

use crate::ResourceId;

/// Prefix of every environment variable Conveyor hands to build scripts.
pub const ENV_PREFIX: &str = "CONVEYOR_";

/// A step exit status that marks the step as an intermittent failure.
pub const EXIT_INTERMITTENT_FAILURE: i32 = 85;

/// A step exit status that marks the step skipped and ends the job.
pub const EXIT_SKIP: i32 = 86;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyJob {
    pub id: ResourceId,
    pub config: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyJobs {
    pub jobs: Vec<ReadyJob>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub job_id: ResourceId,
    #[serde(default)]
    pub client_name: String,
}

/// Answer to a claim. `job_info` is present only for the winning caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimResponse {
    pub success: bool,
    pub message: String,
    pub job_id: ResourceId,
    #[serde(default)]
    pub job_info: Option<JobSpec>,
}

/// The frozen description of a claimed job, issued exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_id: ResourceId,
    pub recipe_name: String,
    pub abort_on_failure: bool,
    pub environment: Vec<(String, String)>,
    /// Sourced verbatim ahead of every step script.
    pub prestep_sources: Vec<String>,
    pub steps: Vec<StepSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub step_num: i32,
    pub step_name: String,
    pub step_abort_on_failure: bool,
    pub step_allowed_to_fail: bool,
    pub stepresult_id: ResourceId,
    pub environment: Vec<(String, String)>,
    pub script: String,
}

/// Payload of start/update/complete step-result messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    #[serde(default)]
    pub client_name: String,
    pub job_id: Option<ResourceId>,
    pub step_num: i32,
    pub output: String,
    /// Elapsed seconds.
    pub time: i64,
    pub complete: bool,
    pub exit_status: i32,
    #[serde(default)]
    pub canceled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobFinishedReport {
    #[serde(default)]
    pub client_name: String,
    pub seconds: i64,
    pub complete: bool,
    #[serde(default)]
    pub canceled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PingReport {
    #[serde(default)]
    pub client_name: String,
}

/// An instruction piggy-backed on a server reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    /// Abort the running job now.
    Cancel,
    /// Abort the running job and stop talking to this server about it.
    Stop,
}

/// Reply to every worker-to-server post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default = "continue_by_default")]
    pub next_step: bool,
    #[serde(default)]
    pub command: Option<Command>,
}

fn continue_by_default() -> bool {
    true
}

impl Reply {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: "OK".to_string(),
            message: message.into(),
            next_step: true,
            command: None,
        }
    }

    pub fn with_command(mut self, command: Command) -> Self {
        self.command = Some(command);
        self
    }

    pub fn halt(mut self) -> Self {
        self.next_step = false;
        self
    }
}
