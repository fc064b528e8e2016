//! Commit statuses and comments posted back to the git host.
//!
//! Reporting never fails the operation that triggered it: host errors are
//! logged and dropped.

use std::sync::Arc;

use conveyor_config::ServerConfig;
use conveyor_core::event::Event;
use conveyor_core::host::{CommitState, CommitStatusUpdate, GitHost};
use conveyor_core::job::Job;
use conveyor_core::recipe::RecipeDefinition;
use tracing::{debug, warn};

pub struct StatusReporter {
    host: Arc<dyn GitHost>,
    config: Arc<ServerConfig>,
}

impl StatusReporter {
    pub fn new(host: Arc<dyn GitHost>, config: Arc<ServerConfig>) -> Self {
        Self { host, config }
    }

    pub fn host(&self) -> &Arc<dyn GitHost> {
        &self.host
    }

    fn enabled(&self) -> bool {
        self.config.remote_update
    }

    async fn post_status(
        &self,
        event: &Event,
        job: &Job,
        recipe: &RecipeDefinition,
        state: CommitState,
        description: String,
    ) {
        if !self.enabled() {
            return;
        }
        let update = CommitStatusUpdate {
            repository: event.base.repository.clone(),
            sha: event.head.sha.clone(),
            state,
            target_url: Some(self.config.job_url(job.id)),
            description,
            context: format!("Conveyor/{} ({})", recipe.display_name, job.config),
        };
        debug!(job_id = %job.id, state = %update.state, "Posting commit status");
        if let Err(e) = self.host.update_commit_status(&update).await {
            warn!(job_id = %job.id, host = self.host.name(), error = %e, "Failed to update commit status");
        }
    }

    async fn comment(&self, event: &Event, body: &str) {
        if !self.enabled() {
            return;
        }
        let Some(url) = event.comments_url.as_deref() else {
            return;
        };
        if let Err(e) = self.host.post_comment(url, body).await {
            warn!(event_id = %event.id, host = self.host.name(), error = %e, "Failed to post comment");
        }
    }

    pub async fn job_waiting(&self, event: &Event, job: &Job, recipe: &RecipeDefinition) {
        self.post_status(event, job, recipe, CommitState::Pending, "Waiting".to_string())
            .await;
    }

    pub async fn job_needs_activation(&self, event: &Event, job: &Job, recipe: &RecipeDefinition) {
        self.post_status(
            event,
            job,
            recipe,
            CommitState::Pending,
            "Developer needed to activate".to_string(),
        )
        .await;
    }

    /// Explain on the pull request why its jobs are waiting for activation.
    pub async fn activation_required(&self, event: &Event, recipe: &RecipeDefinition) {
        let body = format!(
            "**Conveyor**: `{}` did not start because {} is not authorized to run it. \
             A developer needs to activate the job at {}.",
            recipe.display_name,
            event.trigger_user,
            self.config.base_url.trim_end_matches('/'),
        );
        self.comment(event, &body).await;
    }

    pub async fn job_starting(&self, event: &Event, job: &Job, recipe: &RecipeDefinition) {
        self.post_status(event, job, recipe, CommitState::Pending, "Starting".to_string())
            .await;
    }

    pub async fn step_started(
        &self,
        event: &Event,
        job: &Job,
        recipe: &RecipeDefinition,
        step_num: i32,
        step_name: &str,
    ) {
        self.post_status(
            event,
            job,
            recipe,
            CommitState::Pending,
            format!("Running step {}: {}", step_num, step_name),
        )
        .await;
    }

    pub async fn job_finished(&self, event: &Event, job: &Job, recipe: &RecipeDefinition) {
        let description = match &job.failed_step {
            Some(step) if job.status.is_failure() => {
                format!("{} in {} ({}s)", job.status.label(), step, job.seconds)
            }
            _ => format!("{} ({}s)", job.status.label(), job.seconds),
        };
        self.post_status(event, job, recipe, job.status.into(), description)
            .await;
    }

    pub async fn job_wont_run(&self, event: &Event, job: &Job, recipe: &RecipeDefinition) {
        self.post_status(
            event,
            job,
            recipe,
            CommitState::Error,
            "Won't run due to failed dependencies".to_string(),
        )
        .await;
    }

    /// Tell the pull request that its earlier events were canceled.
    pub async fn events_canceled(&self, event: &Event, canceled: usize, message: &str) {
        if canceled == 0 {
            return;
        }
        let body = format!(
            "**Conveyor**: {} ({} earlier event(s) on this pull request).",
            message, canceled
        );
        self.comment(event, &body).await;
    }
}
