//! Event lifecycle: job materialization, cancellation, invalidation and
//! activation.

use std::sync::Arc;

use conveyor_config::ServerConfig;
use conveyor_core::event::{Event, NewEvent, PullRequestAction};
use conveyor_core::host::GitHost;
use conveyor_core::job::Job;
use conveyor_core::recipe::{Cause, Recipe, TriggerPolicy};
use conveyor_core::{ResourceId, Status};
use conveyor_db::{NewJob, Store};
use tracing::{info, warn};

use crate::Result;
use crate::notify::StatusReporter;
use crate::readiness::ReadinessEngine;

pub const NEW_PUSH_MESSAGE: &str = "Canceled due to new push event";
pub const NEW_PR_PUSH_MESSAGE: &str = "Canceled due to new PR commit";

/// What happened to an incoming event.
#[derive(Debug, Clone, Default)]
pub struct EventOutcome {
    /// `None` when nothing was built: a closed pull request, or no recipe
    /// matched.
    pub event: Option<Event>,
    pub created: bool,
    pub jobs: Vec<Job>,
}

pub struct EventController {
    store: Arc<dyn Store>,
    readiness: Arc<ReadinessEngine>,
    reporter: Arc<StatusReporter>,
    config: Arc<ServerConfig>,
}

impl EventController {
    pub fn new(
        store: Arc<dyn Store>,
        readiness: Arc<ReadinessEngine>,
        reporter: Arc<StatusReporter>,
        config: Arc<ServerConfig>,
    ) -> Self {
        Self {
            store,
            readiness,
            reporter,
            config,
        }
    }

    fn host(&self) -> &Arc<dyn GitHost> {
        self.reporter.host()
    }

    /// Turn a canonical event into jobs.
    ///
    /// A re-delivered event reuses the jobs it already has; it never picks up
    /// recipes created since.
    pub async fn create_event(&self, new: &NewEvent) -> Result<EventOutcome> {
        if let Some(pr) = &new.pull_request {
            if pr.action == PullRequestAction::Closed {
                info!(repository = %new.base.repository, pr = pr.number, "Pull request closed");
                self.store
                    .close_pull_request(&new.base.repository, pr.number)
                    .await?;
                return Ok(EventOutcome::default());
            }
            self.store
                .upsert_pull_request(&new.base.repository, pr.number, &pr.title)
                .await?;
        }

        let recipes: Vec<Recipe> = self
            .store
            .current_recipes()
            .await?
            .into_iter()
            .filter(|r| r.definition.matches(new))
            .collect();
        if recipes.is_empty() {
            info!(
                repository = %new.base.repository,
                branch = %new.base.branch,
                cause = %new.cause,
                "No recipes match event"
            );
            return Ok(EventOutcome::default());
        }

        let duplicates = if new.force && new.cause == Cause::Manual {
            self.store
                .latest_duplicate(new)
                .await?
                .map_or(0, |latest| latest + 1)
        } else {
            0
        };

        let (event, created) = self.store.get_or_create_event(new, duplicates).await?;
        if !created {
            info!(event_id = %event.id, "Event already exists, reusing its jobs");
            self.readiness.evaluate(event.id).await?;
            let jobs = self.store.jobs_for_event(event.id).await?;
            return Ok(EventOutcome {
                event: Some(event),
                created,
                jobs,
            });
        }
        info!(event_id = %event.id, cause = %event.cause, head = %event.head.sha, "New event");

        self.cancel_predecessors(&event).await?;

        for recipe in &recipes {
            let definition = &recipe.definition;
            let active = self.is_authorized(recipe, &event).await;
            let mut spawned = false;
            for config in &definition.build_configs {
                let (job, job_created) = self
                    .store
                    .get_or_create_job(&NewJob {
                        event_id: event.id,
                        recipe_id: recipe.id,
                        config: config.clone(),
                        active,
                        status: if active {
                            Status::NotStarted
                        } else {
                            Status::ActivationRequired
                        },
                    })
                    .await?;
                if !job_created {
                    continue;
                }
                spawned = true;
                if active {
                    self.reporter.job_waiting(&event, &job, definition).await;
                } else {
                    self.reporter
                        .job_needs_activation(&event, &job, definition)
                        .await;
                }
            }
            if spawned && !active && definition.trigger == TriggerPolicy::AutoAuthorized {
                self.reporter.activation_required(&event, definition).await;
            }
        }

        self.readiness.evaluate(event.id).await?;
        let jobs = self.store.jobs_for_event(event.id).await?;
        info!(event_id = %event.id, jobs = jobs.len(), "Created jobs");
        let event = self.store.get_event(event.id).await?;
        Ok(EventOutcome {
            event: Some(event),
            created,
            jobs,
        })
    }

    async fn is_authorized(&self, recipe: &Recipe, event: &Event) -> bool {
        let definition = &recipe.definition;
        if definition.authorizes(&event.trigger_user) {
            return true;
        }
        if definition.trigger != TriggerPolicy::AutoAuthorized || event.trigger_user.is_empty() {
            return false;
        }
        match self
            .host()
            .is_collaborator(&event.trigger_user, &event.base.repository)
            .await
        {
            Ok(collaborator) => collaborator,
            Err(e) => {
                warn!(user = %event.trigger_user, error = %e, "Collaborator check failed");
                false
            }
        }
    }

    /// A new commit supersedes earlier events: every open event of the same
    /// pull request, and on auto-cancel branches the earlier push events.
    async fn cancel_predecessors(&self, event: &Event) -> Result<()> {
        if let Some(number) = event.pr_number {
            let mut canceled = 0;
            for prior in self
                .store
                .events_for_pull_request(&event.base.repository, number)
                .await?
            {
                if prior.id != event.id && !prior.complete {
                    self.cancel_event(prior.id, NEW_PR_PUSH_MESSAGE).await?;
                    canceled += 1;
                }
            }
            self.reporter
                .events_canceled(event, canceled, NEW_PR_PUSH_MESSAGE)
                .await;
            return Ok(());
        }

        if event.cause != Cause::Push {
            return Ok(());
        }
        let Some(settings) = self
            .config
            .branch(&event.base.repository, &event.base.branch)
        else {
            return Ok(());
        };
        if !settings.auto_cancel_push {
            return Ok(());
        }

        let mut prior: Vec<Event> = self
            .store
            .push_events_for_branch(&event.base.repository, &event.base.branch)
            .await?
            .into_iter()
            .filter(|e| e.id != event.id && !e.complete)
            .collect();

        // Let the newest event that is already building finish.
        if settings.auto_cancel_except_current {
            let mut current = None;
            for candidate in prior.iter().rev() {
                let jobs = self.store.jobs_for_event(candidate.id).await?;
                if jobs.iter().any(|j| j.status == Status::Running) {
                    current = Some(candidate.id);
                    break;
                }
            }
            prior.retain(|e| Some(e.id) != current);
        }

        for prior in prior {
            self.auto_cancel(prior.id, NEW_PUSH_MESSAGE).await?;
        }
        Ok(())
    }

    /// Cancel the incomplete jobs of an event whose recipes opted into
    /// auto-cancel-on-push.
    pub async fn auto_cancel(&self, event_id: ResourceId, message: &str) -> Result<Vec<Job>> {
        info!(event_id = %event_id, "Auto canceling event");
        let mut canceled = Vec::new();
        for job in self.store.jobs_for_event(event_id).await? {
            if job.complete {
                continue;
            }
            let recipe = self.store.get_recipe(job.recipe_id).await?;
            if recipe.definition.auto_cancel_on_push {
                canceled.extend(self.mark_canceled(job.id, message).await?);
            }
        }
        if !canceled.is_empty() {
            self.report_finished(event_id, &canceled).await?;
            self.readiness.evaluate(event_id).await?;
        }
        Ok(canceled)
    }

    /// Cancel every incomplete job of an event and mark it complete and
    /// canceled.
    pub async fn cancel_event(&self, event_id: ResourceId, message: &str) -> Result<Vec<Job>> {
        let event = self.store.get_event(event_id).await?;
        info!(event_id = %event_id, "Canceling event");

        let mut canceled = Vec::new();
        for job in self.store.jobs_for_event(event_id).await? {
            if !job.complete {
                canceled.extend(self.mark_canceled(job.id, message).await?);
            }
        }
        if event.complete && event.status == Status::Canceled && canceled.is_empty() {
            return Ok(canceled);
        }

        self.store
            .set_event_status(event_id, Status::Canceled, true)
            .await?;
        self.readiness.propagate(&event, Status::Canceled).await?;
        self.report_finished(event_id, &canceled).await?;
        Ok(canceled)
    }

    /// Complete one job as canceled. Its dependents become unrunnable.
    pub async fn cancel_job(&self, job_id: ResourceId, message: &str) -> Result<Job> {
        let Some(job) = self.mark_canceled(job_id, message).await? else {
            return self.store.get_job(job_id).await.map_err(Into::into);
        };
        self.report_finished(job.event_id, std::slice::from_ref(&job))
            .await?;
        self.readiness.evaluate(job.event_id).await?;
        Ok(job)
    }

    /// Complete the job as canceled along with its unfinished steps.
    /// Returns `None` if it completed first.
    async fn mark_canceled(&self, job_id: ResourceId, message: &str) -> Result<Option<Job>> {
        let Some(job) = self.store.mark_job_canceled(job_id).await? else {
            return Ok(None);
        };
        info!(job_id = %job.id, event_id = %job.event_id, "Canceling job");
        self.store.cancel_step_results(job.id).await?;
        self.store.add_change_log(job.id, message).await?;
        Ok(Some(job))
    }

    async fn report_finished(&self, event_id: ResourceId, jobs: &[Job]) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        let event = self.store.get_event(event_id).await?;
        for job in jobs {
            let recipe = self.store.get_recipe(job.recipe_id).await?;
            self.reporter
                .job_finished(&event, job, &recipe.definition)
                .await;
        }
        Ok(())
    }

    /// Discard a job's results so it runs again, optionally pinned to the
    /// client that ran it last. The job moves to the current version of its
    /// recipe when one exists.
    pub async fn invalidate_job(
        &self,
        job_id: ResourceId,
        same_client: bool,
        message: &str,
    ) -> Result<Job> {
        let mut job = self.store.get_job(job_id).await?;
        let event = self.store.get_event(job.event_id).await?;
        let recipe = self.store.get_recipe(job.recipe_id).await?;

        self.store.delete_step_results(job.id).await?;

        let mut retired = None;
        let current = self
            .store
            .current_recipe_for(&recipe.definition.filename, recipe.definition.cause)
            .await?;
        if let Some(current) = current.filter(|c| c.id != job.recipe_id) {
            info!(job_id = %job.id, from = %job.recipe_id, to = %current.id, "Moving job to current recipe");
            retired = Some(job.recipe_id);
            job.recipe_id = current.id;
        }

        job.status = if job.active {
            Status::NotStarted
        } else {
            Status::ActivationRequired
        };
        job.ready = false;
        job.complete = false;
        job.invalidated = true;
        job.same_client = same_client;
        if !same_client {
            job.client_id = None;
        }
        job.seconds = 0;
        job.failed_step = None;
        job.running_step = None;
        self.store.update_job(&job).await?;

        if let Some(old) = retired {
            self.store.delete_recipe_if_unused(old).await?;
        }
        self.store.add_change_log(job.id, message).await?;
        info!(job_id = %job.id, same_client, "Invalidated job");

        self.reopen(&event).await?;
        let definition = self.store.get_recipe(job.recipe_id).await?.definition;
        self.reporter.job_waiting(&event, &job, &definition).await;
        self.store.get_job(job.id).await.map_err(Into::into)
    }

    /// Let a developer start a job that was created inactive.
    pub async fn activate_job(&self, job_id: ResourceId, user: &str) -> Result<Job> {
        let mut job = self.store.get_job(job_id).await?;
        if job.active {
            return Ok(job);
        }
        job.active = true;
        job.status = Status::NotStarted;
        self.store.update_job(&job).await?;
        self.store
            .add_change_log(job.id, &format!("Activated by {}", user))
            .await?;
        info!(job_id = %job.id, user, "Activated job");

        let event = self.store.get_event(job.event_id).await?;
        self.reopen(&event).await?;
        let definition = self.store.get_recipe(job.recipe_id).await?.definition;
        self.reporter.job_waiting(&event, &job, &definition).await;
        self.store.get_job(job.id).await.map_err(Into::into)
    }

    async fn reopen(&self, event: &Event) -> Result<()> {
        if event.complete {
            self.store
                .set_event_status(event.id, event.status, false)
                .await?;
        }
        self.readiness.evaluate(event.id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use conveyor_config::BranchSettings;
    use conveyor_core::event::PullRequestRef;
    use conveyor_db::{ClientRepo, EventRepo, JobRepo, RecipeRepo};

    use super::*;
    use crate::testing::{Harness, RecordedCall, push_event};

    #[tokio::test]
    async fn test_redelivered_event_reuses_jobs() {
        let h = Harness::new().await;
        h.recipe("a.kdl", &[]).await;
        let first = h.push("abc").await;
        assert!(first.created);
        assert_eq!(first.jobs.len(), 1);

        // A recipe added later is not picked up by the same event.
        h.recipe("b.kdl", &[]).await;
        let second = h.push("abc").await;
        assert!(!second.created);
        assert_eq!(second.event.unwrap().id, first.event.unwrap().id);
        assert_eq!(second.jobs.len(), 1);
        assert_eq!(second.jobs[0].id, first.jobs[0].id);
    }

    #[tokio::test]
    async fn test_one_job_per_config() {
        let h = Harness::new().await;
        let mut def = h.definition("a.kdl", &[]);
        def.build_configs = vec!["linux".to_string(), "mac".to_string()];
        h.store.create_recipe(&def).await.unwrap();

        let outcome = h.push("abc").await;
        let mut configs: Vec<_> = outcome.jobs.iter().map(|j| j.config.clone()).collect();
        configs.sort();
        assert_eq!(configs, vec!["linux", "mac"]);
        assert!(outcome.jobs.iter().all(|j| j.ready && j.active));
    }

    #[tokio::test]
    async fn test_no_matching_recipe_creates_nothing() {
        let h = Harness::new().await;
        h.recipe("a.kdl", &[]).await;
        let mut new = push_event("abc");
        new.base.branch = "other".to_string();
        let outcome = h.lifecycle.create_event(&new).await.unwrap();
        assert!(outcome.event.is_none());
    }

    #[tokio::test]
    async fn test_forced_manual_event_duplicates() {
        let h = Harness::new().await;
        let mut def = h.definition("a.kdl", &[]);
        def.cause = Cause::Manual;
        h.store.create_recipe(&def).await.unwrap();

        let mut new = push_event("abc");
        new.cause = Cause::Manual;
        let first = h.lifecycle.create_event(&new).await.unwrap();
        let again = h.lifecycle.create_event(&new).await.unwrap();
        assert!(!again.created);

        new.force = true;
        let forced = h.lifecycle.create_event(&new).await.unwrap();
        assert!(forced.created);
        let forced = forced.event.unwrap();
        assert_ne!(forced.id, first.event.unwrap().id);
        assert_eq!(forced.duplicates, 1);
    }

    #[tokio::test]
    async fn test_unauthorized_user_needs_activation() {
        let h = Harness::with_remote_update().await;
        let mut def = h.definition("a.kdl", &[]);
        def.cause = Cause::PullRequest;
        def.trigger = TriggerPolicy::AutoAuthorized;
        def.authorized_users = vec!["bob".to_string()];
        h.store.create_recipe(&def).await.unwrap();

        let mut new = h.pr_event("abc", 7, PullRequestAction::Opened);
        new.trigger_user = "mallory".to_string();
        let outcome = h.lifecycle.create_event(&new).await.unwrap();
        let job = &outcome.jobs[0];
        assert!(!job.active);
        assert_eq!(job.status, Status::ActivationRequired);
        assert!(!job.ready);
        assert!(h.host.calls().iter().any(|c| matches!(
            c,
            RecordedCall::Status { description, .. } if description == "Developer needed to activate"
        )));
        assert!(
            h.host
                .calls()
                .iter()
                .any(|c| matches!(c, RecordedCall::Comment { .. }))
        );

        let job = h.lifecycle.activate_job(job.id, "bob").await.unwrap();
        assert!(job.active && job.ready);
        assert_eq!(job.status, Status::NotStarted);
        let log = h.store.change_log(job.id).await.unwrap();
        assert_eq!(log[0].message, "Activated by bob");
    }

    #[tokio::test]
    async fn test_collaborator_is_authorized() {
        let h = Harness::new().await;
        let mut def = h.definition("a.kdl", &[]);
        def.trigger = TriggerPolicy::AutoAuthorized;
        h.store.create_recipe(&def).await.unwrap();
        h.host.add_collaborator("carol");

        let mut new = push_event("abc");
        new.trigger_user = "carol".to_string();
        let outcome = h.lifecycle.create_event(&new).await.unwrap();
        assert!(outcome.jobs[0].active);
    }

    #[tokio::test]
    async fn test_new_pr_commit_cancels_prior_events() {
        let h = Harness::new().await;
        let mut def = h.definition("a.kdl", &[]);
        def.cause = Cause::PullRequest;
        h.store.create_recipe(&def).await.unwrap();

        let first = h
            .lifecycle
            .create_event(&h.pr_event("abc", 7, PullRequestAction::Opened))
            .await
            .unwrap();
        h.start_first_step(first.jobs[0].id).await;
        let second = h
            .lifecycle
            .create_event(&h.pr_event("def", 7, PullRequestAction::Synchronize))
            .await
            .unwrap();

        let old = h.store.get_event(first.event.unwrap().id).await.unwrap();
        assert!(old.complete);
        assert_eq!(old.status, Status::Canceled);
        let old_job = h.store.get_job(first.jobs[0].id).await.unwrap();
        assert_eq!(old_job.status, Status::Canceled);
        assert_eq!(
            h.step_statuses(old_job.id).await,
            vec![
                ("build".to_string(), Status::Canceled),
                ("test".to_string(), Status::Canceled),
            ]
        );
        assert_eq!(
            h.store.change_log(old_job.id).await.unwrap()[0].message,
            NEW_PR_PUSH_MESSAGE
        );
        assert!(!h.store.get_event(second.event.unwrap().id).await.unwrap().complete);
    }

    #[tokio::test]
    async fn test_pr_close_creates_nothing() {
        let h = Harness::new().await;
        let mut def = h.definition("a.kdl", &[]);
        def.cause = Cause::PullRequest;
        h.store.create_recipe(&def).await.unwrap();
        h.lifecycle
            .create_event(&h.pr_event("abc", 7, PullRequestAction::Opened))
            .await
            .unwrap();

        let outcome = h
            .lifecycle
            .create_event(&h.pr_event("abc", 7, PullRequestAction::Closed))
            .await
            .unwrap();
        assert!(outcome.event.is_none());
        let pr = h.store.get_pull_request("acme/widgets", 7).await.unwrap();
        assert!(pr.unwrap().closed);
    }

    #[tokio::test]
    async fn test_auto_cancel_on_push() {
        let h = Harness::with_branches(vec![BranchSettings {
            repository: "acme/widgets".to_string(),
            branch: "main".to_string(),
            auto_cancel_push: true,
            auto_cancel_except_current: false,
        }])
        .await;
        let mut flagged = h.definition("a.kdl", &[]);
        flagged.auto_cancel_on_push = true;
        h.store.create_recipe(&flagged).await.unwrap();
        h.recipe("b.kdl", &[]).await;

        let first = h.push("abc").await;
        h.push("def").await;

        let old = first.event.unwrap().id;
        let a = h.job_for(old, "a.kdl").await;
        let b = h.job_for(old, "b.kdl").await;
        assert_eq!(a.status, Status::Canceled);
        assert!(a.complete);
        assert_eq!(
            h.store.change_log(a.id).await.unwrap()[0].message,
            NEW_PUSH_MESSAGE
        );
        assert!(!b.complete);
    }

    #[tokio::test]
    async fn test_auto_cancel_spares_current_build() {
        let h = Harness::with_branches(vec![BranchSettings {
            repository: "acme/widgets".to_string(),
            branch: "main".to_string(),
            auto_cancel_push: true,
            auto_cancel_except_current: true,
        }])
        .await;
        let mut flagged = h.definition("a.kdl", &[]);
        flagged.auto_cancel_on_push = true;
        h.store.create_recipe(&flagged).await.unwrap();

        let building = h.push("abc").await.event.unwrap().id;
        let mut job = h.job_for(building, "a.kdl").await;
        job.status = Status::Running;
        h.store.update_job(&job).await.unwrap();
        let queued = h.push("def").await.event.unwrap().id;
        h.push("ghi").await;

        assert_eq!(h.job_for(building, "a.kdl").await.status, Status::Running);
        assert_eq!(h.job_for(queued, "a.kdl").await.status, Status::Canceled);
    }

    #[tokio::test]
    async fn test_cancel_job_blocks_dependents() {
        let h = Harness::new().await;
        h.recipe("a.kdl", &[]).await;
        h.recipe("b.kdl", &["a.kdl"]).await;
        let event = h.push("abc").await.event.unwrap();
        let a = h.job_for(event.id, "a.kdl").await;

        let a = h.lifecycle.cancel_job(a.id, "Canceled by alice").await.unwrap();
        assert_eq!(a.status, Status::Canceled);
        let event = h.store.get_event(event.id).await.unwrap();
        assert!(event.complete);
        assert_eq!(event.status, Status::Canceled);
        assert!(!h.job_for(event.id, "b.kdl").await.ready);
    }

    #[tokio::test]
    async fn test_cancel_event() {
        let h = Harness::new().await;
        h.recipe("a.kdl", &[]).await;
        h.recipe("b.kdl", &[]).await;
        let event = h.push("abc").await.event.unwrap();
        let a = h.job_for(event.id, "a.kdl").await;
        h.finish(a.id, Status::Success).await;
        let b = h.job_for(event.id, "b.kdl").await;
        h.start_first_step(b.id).await;

        let canceled = h.lifecycle.cancel_event(event.id, "stop").await.unwrap();
        assert_eq!(canceled.len(), 1);
        assert_eq!(h.job_for(event.id, "a.kdl").await.status, Status::Success);
        assert_eq!(h.job_for(event.id, "b.kdl").await.status, Status::Canceled);
        assert_eq!(
            h.step_statuses(b.id).await,
            vec![
                ("build".to_string(), Status::Canceled),
                ("test".to_string(), Status::Canceled),
            ]
        );

        // Canceling again changes nothing.
        assert!(h.lifecycle.cancel_event(event.id, "stop").await.unwrap().is_empty());
        let event = h.store.get_event(event.id).await.unwrap();
        assert!(event.complete);
        assert_eq!(event.status, Status::Canceled);
    }

    #[tokio::test]
    async fn test_invalidate_resets_and_moves_to_current_recipe() {
        let h = Harness::new().await;
        let old = h.recipe("a.kdl", &[]).await;
        let event = h.push("abc").await.event.unwrap();
        let mut job = h.job_for(event.id, "a.kdl").await;
        let client = h.store.get_or_create_client("worker", "10.0.0.1").await.unwrap();
        job.client_id = Some(client.id);
        h.store.update_job(&job).await.unwrap();
        h.finish(job.id, Status::Failed).await;

        let mut edited = old.definition.clone();
        edited.priority = 5;
        let new = h.store.create_recipe(&edited).await.unwrap();
        h.store.retire_recipe(old.id).await.unwrap();

        let job = h
            .lifecycle
            .invalidate_job(job.id, true, "Invalidated by alice")
            .await
            .unwrap();
        assert_eq!(job.recipe_id, new.id);
        assert_eq!(job.status, Status::NotStarted);
        assert!(job.ready && !job.complete && job.invalidated && job.same_client);
        assert_eq!(job.client_id, Some(client.id));
        // The old version is gone once nothing references it.
        assert!(h.store.get_recipe(old.id).await.is_err());

        let event = h.store.get_event(event.id).await.unwrap();
        assert!(!event.complete);
    }

    #[tokio::test]
    async fn test_invalidate_without_pin_drops_client() {
        let h = Harness::new().await;
        h.recipe("a.kdl", &[]).await;
        let event = h.push("abc").await.event.unwrap();
        let mut job = h.job_for(event.id, "a.kdl").await;
        job.client_id = Some(ResourceId::new());
        job.status = Status::Success;
        job.complete = true;
        h.store.update_job(&job).await.unwrap();

        let job = h.lifecycle.invalidate_job(job.id, false, "again").await.unwrap();
        assert_eq!(job.client_id, None);
        assert!(!job.same_client);
    }
}
