//! In-memory [`Store`](crate::Store) for tests and single-process runs.
//!
//! Every operation takes one lock over the whole state, so the conditional
//! updates (`mark_ready`, `try_claim`, `release_claim`) are as atomic as
//! their SQL counterparts.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use conveyor_core::event::{BranchStatus, Event, NewEvent, PullRequestStatus};
use conveyor_core::job::{ChangeLogEntry, Client, Job, StepResult};
use conveyor_core::recipe::{Cause, Recipe, RecipeDefinition};
use conveyor_core::{ClientStatus, ResourceId, Status};
use parking_lot::Mutex;

use crate::repo::{ClientRepo, EventRepo, JobRepo, NewJob, ReadyRow, RecipeRepo};
use crate::{DbError, DbResult};

#[derive(Default)]
struct Inner {
    recipes: HashMap<ResourceId, Recipe>,
    events: HashMap<ResourceId, Event>,
    pull_requests: HashMap<(String, i64), PullRequestStatus>,
    branches: HashMap<(String, String), BranchStatus>,
    clients: HashMap<ResourceId, Client>,
    jobs: HashMap<ResourceId, Job>,
    step_results: HashMap<ResourceId, StepResult>,
    change_log: Vec<ChangeLogEntry>,
}

impl Inner {
    fn job(&self, id: ResourceId) -> DbResult<&Job> {
        self.jobs
            .get(&id)
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))
    }

    fn sorted_jobs(&self, mut filter: impl FnMut(&Job) -> bool) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.values().filter(|j| filter(j)).cloned().collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        jobs
    }

    fn sorted_events(&self, mut filter: impl FnMut(&Event) -> bool) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .events
            .values()
            .filter(|e| filter(e))
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.created_at, e.id));
        events
    }
}

fn same_commit_pair(event: &Event, new: &NewEvent) -> bool {
    event.build_user == new.build_user
        && event.cause == new.cause
        && event.base.repository == new.base.repository
        && event.base.branch == new.base.branch
        && event.base.sha == new.base.sha
        && event.head.repository == new.head.repository
        && event.head.branch == new.head.branch
        && event.head.sha == new.head.sha
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecipeRepo for MemoryStore {
    async fn create_recipe(&self, definition: &RecipeDefinition) -> DbResult<Recipe> {
        let recipe = Recipe {
            id: ResourceId::new(),
            current: true,
            created_at: Utc::now(),
            definition: definition.clone(),
        };
        self.inner.lock().recipes.insert(recipe.id, recipe.clone());
        Ok(recipe)
    }

    async fn get_recipe(&self, id: ResourceId) -> DbResult<Recipe> {
        self.inner
            .lock()
            .recipes
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("recipe {}", id)))
    }

    async fn current_recipes(&self) -> DbResult<Vec<Recipe>> {
        let inner = self.inner.lock();
        let mut recipes: Vec<Recipe> = inner.recipes.values().filter(|r| r.current).cloned().collect();
        recipes.sort_by(|a, b| {
            (&a.definition.filename, a.created_at, a.id).cmp(&(
                &b.definition.filename,
                b.created_at,
                b.id,
            ))
        });
        Ok(recipes)
    }

    async fn current_recipe_for(
        &self,
        filename: &str,
        cause: Cause,
    ) -> DbResult<Option<Recipe>> {
        let inner = self.inner.lock();
        Ok(inner
            .recipes
            .values()
            .filter(|r| {
                r.current && r.definition.filename == filename && r.definition.cause == cause
            })
            .max_by_key(|r| (r.created_at, r.id))
            .cloned())
    }

    async fn retire_recipe(&self, id: ResourceId) -> DbResult<bool> {
        {
            let mut inner = self.inner.lock();
            if let Some(recipe) = inner.recipes.get_mut(&id) {
                recipe.current = false;
            }
        }
        self.delete_recipe_if_unused(id).await
    }

    async fn delete_recipe_if_unused(&self, id: ResourceId) -> DbResult<bool> {
        let mut inner = self.inner.lock();
        let retired = inner.recipes.get(&id).is_some_and(|r| !r.current);
        let used = inner.jobs.values().any(|j| j.recipe_id == id);
        if retired && !used {
            inner.recipes.remove(&id);
            return Ok(true);
        }
        Ok(false)
    }
}

#[async_trait]
impl EventRepo for MemoryStore {
    async fn get_or_create_event(
        &self,
        new: &NewEvent,
        duplicates: i32,
    ) -> DbResult<(Event, bool)> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner
            .events
            .values()
            .find(|e| same_commit_pair(e, new) && e.duplicates == duplicates)
        {
            return Ok((existing.clone(), false));
        }

        let event = Event {
            id: ResourceId::new(),
            cause: new.cause,
            build_user: new.build_user.clone(),
            build_key: new.build_key.clone(),
            base: new.base.clone(),
            head: new.head.clone(),
            pr_number: new.pull_request.as_ref().map(|pr| pr.number),
            trigger_user: new.trigger_user.clone(),
            comments_url: new.comments_url.clone(),
            description: new.description.clone(),
            duplicates,
            status: Status::NotStarted,
            complete: false,
            created_at: Utc::now(),
        };
        inner.events.insert(event.id, event.clone());
        Ok((event, true))
    }

    async fn latest_duplicate(&self, new: &NewEvent) -> DbResult<Option<i32>> {
        Ok(self
            .inner
            .lock()
            .events
            .values()
            .filter(|e| same_commit_pair(e, new))
            .map(|e| e.duplicates)
            .max())
    }

    async fn get_event(&self, id: ResourceId) -> DbResult<Event> {
        self.inner
            .lock()
            .events
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("event {}", id)))
    }

    async fn set_event_status(
        &self,
        id: ResourceId,
        status: Status,
        complete: bool,
    ) -> DbResult<()> {
        if let Some(event) = self.inner.lock().events.get_mut(&id) {
            event.status = status;
            event.complete = complete;
        }
        Ok(())
    }

    async fn events_for_pull_request(
        &self,
        repository: &str,
        number: i64,
    ) -> DbResult<Vec<Event>> {
        Ok(self
            .inner
            .lock()
            .sorted_events(|e| e.base.repository == repository && e.pr_number == Some(number)))
    }

    async fn push_events_for_branch(
        &self,
        repository: &str,
        branch: &str,
    ) -> DbResult<Vec<Event>> {
        Ok(self.inner.lock().sorted_events(|e| {
            e.cause == Cause::Push && e.base.repository == repository && e.base.branch == branch
        }))
    }

    async fn upsert_pull_request(
        &self,
        repository: &str,
        number: i64,
        title: &str,
    ) -> DbResult<()> {
        let mut inner = self.inner.lock();
        let pr = inner
            .pull_requests
            .entry((repository.to_string(), number))
            .or_insert_with(|| PullRequestStatus {
                repository: repository.to_string(),
                number,
                title: String::new(),
                status: Status::NotStarted,
                closed: false,
            });
        pr.title = title.to_string();
        pr.closed = false;
        Ok(())
    }

    async fn close_pull_request(&self, repository: &str, number: i64) -> DbResult<()> {
        if let Some(pr) = self
            .inner
            .lock()
            .pull_requests
            .get_mut(&(repository.to_string(), number))
        {
            pr.closed = true;
        }
        Ok(())
    }

    async fn set_pr_status(&self, repository: &str, number: i64, status: Status) -> DbResult<()> {
        if let Some(pr) = self
            .inner
            .lock()
            .pull_requests
            .get_mut(&(repository.to_string(), number))
        {
            pr.status = status;
        }
        Ok(())
    }

    async fn get_pull_request(
        &self,
        repository: &str,
        number: i64,
    ) -> DbResult<Option<PullRequestStatus>> {
        Ok(self
            .inner
            .lock()
            .pull_requests
            .get(&(repository.to_string(), number))
            .cloned())
    }

    async fn set_branch_status(
        &self,
        repository: &str,
        branch: &str,
        status: Status,
    ) -> DbResult<()> {
        self.inner.lock().branches.insert(
            (repository.to_string(), branch.to_string()),
            BranchStatus {
                repository: repository.to_string(),
                branch: branch.to_string(),
                status,
            },
        );
        Ok(())
    }

    async fn get_branch(&self, repository: &str, branch: &str) -> DbResult<Option<BranchStatus>> {
        Ok(self
            .inner
            .lock()
            .branches
            .get(&(repository.to_string(), branch.to_string()))
            .cloned())
    }
}

#[async_trait]
impl JobRepo for MemoryStore {
    async fn get_or_create_job(&self, new: &NewJob) -> DbResult<(Job, bool)> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.jobs.values().find(|j| {
            j.event_id == new.event_id && j.recipe_id == new.recipe_id && j.config == new.config
        }) {
            return Ok((existing.clone(), false));
        }

        let job = Job {
            id: ResourceId::new(),
            event_id: new.event_id,
            recipe_id: new.recipe_id,
            config: new.config.clone(),
            status: new.status,
            ready: false,
            active: new.active,
            complete: false,
            invalidated: false,
            same_client: false,
            client_id: None,
            seconds: 0,
            failed_step: None,
            running_step: None,
            created_at: Utc::now(),
        };
        inner.jobs.insert(job.id, job.clone());
        Ok((job, true))
    }

    async fn get_job(&self, id: ResourceId) -> DbResult<Job> {
        self.inner.lock().job(id).cloned()
    }

    async fn jobs_for_event(&self, event_id: ResourceId) -> DbResult<Vec<Job>> {
        Ok(self.inner.lock().sorted_jobs(|j| j.event_id == event_id))
    }

    async fn update_job(&self, job: &Job) -> DbResult<()> {
        let mut inner = self.inner.lock();
        let stored = inner
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| DbError::NotFound(format!("job {}", job.id)))?;
        *stored = job.clone();
        Ok(())
    }

    async fn mark_ready(&self, id: ResourceId) -> DbResult<bool> {
        let mut inner = self.inner.lock();
        match inner.jobs.get_mut(&id) {
            Some(job) if !job.ready && job.active && !job.complete => {
                job.ready = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ready_jobs(&self, build_key: &str) -> DbResult<Vec<ReadyRow>> {
        let inner = self.inner.lock();
        let mut rows = Vec::new();
        for job in inner.sorted_jobs(Job::is_claimable) {
            let Some(event) = inner.events.get(&job.event_id) else {
                continue;
            };
            if event.build_key != build_key {
                continue;
            }
            let Some(recipe) = inner.recipes.get(&job.recipe_id) else {
                continue;
            };
            rows.push(ReadyRow {
                priority: recipe.definition.priority,
                cause: event.cause,
                repository: event.base.repository.clone(),
                branch: event.base.branch.clone(),
                event_created_at: event.created_at,
                job,
            });
        }
        // Stable sort keeps creation order inside a priority.
        rows.sort_by_key(|row| std::cmp::Reverse(row.priority));
        Ok(rows)
    }

    async fn try_claim(
        &self,
        id: ResourceId,
        build_key: &str,
        config: &str,
        client_id: ResourceId,
    ) -> DbResult<Option<Job>> {
        let mut inner = self.inner.lock();
        let owned_by_key = inner
            .jobs
            .get(&id)
            .and_then(|j| inner.events.get(&j.event_id))
            .is_some_and(|e| e.build_key == build_key);
        if !owned_by_key {
            return Ok(None);
        }

        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };
        if !job.is_claimable() || job.config != config || job.pinned_elsewhere(client_id) {
            return Ok(None);
        }
        job.status = Status::Running;
        job.client_id = Some(client_id);
        Ok(Some(job.clone()))
    }

    async fn release_claim(
        &self,
        id: ResourceId,
        client_id: ResourceId,
        previous_client: Option<ResourceId>,
    ) -> DbResult<()> {
        let mut inner = self.inner.lock();
        match inner.jobs.get_mut(&id) {
            Some(job) if job.status == Status::Running && job.client_id == Some(client_id) => {
                job.status = Status::NotStarted;
                job.client_id = previous_client;
            }
            _ => {}
        }
        Ok(())
    }

    async fn running_jobs_for_client(&self, client_id: ResourceId) -> DbResult<Vec<Job>> {
        Ok(self
            .inner
            .lock()
            .sorted_jobs(|j| j.client_id == Some(client_id) && j.status == Status::Running))
    }

    async fn set_job_progress(
        &self,
        id: ResourceId,
        seconds: i64,
        running_step: Option<&str>,
        failed_step: Option<&str>,
    ) -> DbResult<()> {
        if let Some(job) = self.inner.lock().jobs.get_mut(&id) {
            job.seconds = seconds;
            if let Some(step) = running_step {
                job.running_step = Some(step.to_string());
            }
            if job.failed_step.is_none() {
                job.failed_step = failed_step.map(str::to_string);
            }
        }
        Ok(())
    }

    async fn finish_job(
        &self,
        id: ResourceId,
        client_id: ResourceId,
        status: Status,
        complete: bool,
        seconds: i64,
    ) -> DbResult<Option<Job>> {
        let mut inner = self.inner.lock();
        match inner.jobs.get_mut(&id) {
            Some(job)
                if job.client_id == Some(client_id)
                    && job.status == Status::Running
                    && !job.complete =>
            {
                job.status = status;
                job.complete = complete;
                job.seconds = seconds;
                job.running_step = None;
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn mark_job_canceled(&self, id: ResourceId) -> DbResult<Option<Job>> {
        let mut inner = self.inner.lock();
        match inner.jobs.get_mut(&id) {
            Some(job) if !job.complete => {
                job.status = Status::Canceled;
                job.complete = true;
                job.running_step = None;
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn cancel_step_results(&self, job_id: ResourceId) -> DbResult<u64> {
        let mut changed = 0;
        for result in self.inner.lock().step_results.values_mut() {
            if result.job_id == job_id && !result.complete {
                result.status = Status::Canceled;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn create_step_results(&self, results: &[StepResult]) -> DbResult<()> {
        let mut inner = self.inner.lock();
        for result in results {
            let clash = inner
                .step_results
                .values()
                .any(|r| r.job_id == result.job_id && r.position == result.position);
            if clash {
                return Err(DbError::Duplicate(format!(
                    "step results for job {}",
                    result.job_id
                )));
            }
        }
        for result in results {
            inner.step_results.insert(result.id, result.clone());
        }
        Ok(())
    }

    async fn get_step_result(&self, id: ResourceId) -> DbResult<StepResult> {
        self.inner
            .lock()
            .step_results
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("step result {}", id)))
    }

    async fn step_results_for_job(&self, job_id: ResourceId) -> DbResult<Vec<StepResult>> {
        let inner = self.inner.lock();
        let mut results: Vec<StepResult> = inner
            .step_results
            .values()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect();
        results.sort_by_key(|r| r.position);
        Ok(results)
    }

    async fn update_step_result(&self, result: &StepResult) -> DbResult<()> {
        if let Some(stored) = self.inner.lock().step_results.get_mut(&result.id) {
            stored.exit_status = result.exit_status;
            stored.status = result.status;
            stored.complete = result.complete;
            stored.output = result.output.clone();
            stored.seconds = result.seconds;
        }
        Ok(())
    }

    async fn append_step_output(
        &self,
        id: ResourceId,
        chunk: &str,
        seconds: i64,
    ) -> DbResult<()> {
        if let Some(stored) = self.inner.lock().step_results.get_mut(&id) {
            stored.output.push_str(chunk);
            stored.seconds = seconds;
            if stored.status != Status::Canceled {
                stored.status = Status::Running;
            }
        }
        Ok(())
    }

    async fn delete_step_results(&self, job_id: ResourceId) -> DbResult<()> {
        self.inner
            .lock()
            .step_results
            .retain(|_, r| r.job_id != job_id);
        Ok(())
    }

    async fn add_change_log(&self, job_id: ResourceId, message: &str) -> DbResult<()> {
        self.inner.lock().change_log.push(ChangeLogEntry {
            job_id,
            message: message.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn change_log(&self, job_id: ResourceId) -> DbResult<Vec<ChangeLogEntry>> {
        Ok(self
            .inner
            .lock()
            .change_log
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ClientRepo for MemoryStore {
    async fn get_or_create_client(&self, name: &str, address: &str) -> DbResult<Client> {
        let mut inner = self.inner.lock();
        if let Some(client) = inner
            .clients
            .values_mut()
            .find(|c| c.name == name && c.address == address)
        {
            client.last_seen = Utc::now();
            return Ok(client.clone());
        }

        let client = Client {
            id: ResourceId::new(),
            name: name.to_string(),
            address: address.to_string(),
            status: ClientStatus::Idle,
            status_message: String::new(),
            last_seen: Utc::now(),
        };
        inner.clients.insert(client.id, client.clone());
        Ok(client)
    }

    async fn get_client(&self, id: ResourceId) -> DbResult<Client> {
        self.inner
            .lock()
            .clients
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("client {}", id)))
    }

    async fn set_client_status(
        &self,
        id: ResourceId,
        status: ClientStatus,
        message: &str,
    ) -> DbResult<()> {
        if let Some(client) = self.inner.lock().clients.get_mut(&id) {
            client.status = status;
            client.status_message = message.to_string();
            client.last_seen = Utc::now();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use conveyor_core::event::CommitRef;
    use conveyor_core::recipe::TriggerPolicy;

    use super::*;

    fn commit(sha: &str) -> CommitRef {
        CommitRef {
            repository: "idaholab/moose".to_string(),
            branch: "next".to_string(),
            sha: sha.to_string(),
            ssh_url: "git@github.com:idaholab/moose.git".to_string(),
        }
    }

    fn push_event(sha: &str) -> NewEvent {
        NewEvent {
            cause: Cause::Push,
            build_user: "moosebuild".to_string(),
            build_key: "key".to_string(),
            base: commit(sha),
            head: commit(sha),
            pull_request: None,
            trigger_user: "alice".to_string(),
            comments_url: None,
            description: String::new(),
            force: false,
        }
    }

    fn definition(filename: &str, priority: i32) -> RecipeDefinition {
        RecipeDefinition {
            name: filename.to_string(),
            display_name: filename.to_string(),
            filename: filename.to_string(),
            build_user: "moosebuild".to_string(),
            repository: "idaholab/moose".to_string(),
            branch: Some("next".to_string()),
            cause: Cause::Push,
            trigger: TriggerPolicy::FullAuto,
            authorized_users: vec![],
            build_configs: vec!["linux".to_string()],
            depends_on: vec![],
            priority,
            active: true,
            auto_cancel_on_push: false,
            abort_on_failure: true,
            environment: vec![],
            prestep_sources: vec![],
            steps: vec![],
        }
    }

    async fn ready_job(store: &MemoryStore, event_id: ResourceId, priority: i32) -> Job {
        let recipe = store
            .create_recipe(&definition(&format!("r{}.kdl", priority), priority))
            .await
            .unwrap();
        let (job, _) = store
            .get_or_create_job(&NewJob {
                event_id,
                recipe_id: recipe.id,
                config: "linux".to_string(),
                active: true,
                status: Status::NotStarted,
            })
            .await
            .unwrap();
        assert!(store.mark_ready(job.id).await.unwrap());
        store.get_job(job.id).await.unwrap()
    }

    #[tokio::test]
    async fn test_event_dedupe_and_duplicates() {
        let store = MemoryStore::new();
        let new = push_event("abc");

        let (first, created) = store.get_or_create_event(&new, 0).await.unwrap();
        assert!(created);
        let (again, created) = store.get_or_create_event(&new, 0).await.unwrap();
        assert!(!created);
        assert_eq!(first.id, again.id);

        let (dup, created) = store.get_or_create_event(&new, 1).await.unwrap();
        assert!(created);
        assert_ne!(dup.id, first.id);
        assert_eq!(store.latest_duplicate(&new).await.unwrap(), Some(1));
        assert_eq!(
            store.latest_duplicate(&push_event("other")).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let (event, _) = store.get_or_create_event(&push_event("abc"), 0).await.unwrap();
        let job = ready_job(&store, event.id, 0).await;

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let client = store
                    .get_or_create_client(&format!("worker-{}", i), "10.0.0.1")
                    .await
                    .unwrap();
                store
                    .try_claim(job.id, "key", "linux", client.id)
                    .await
                    .unwrap()
            }));
        }

        let winners = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|r| r.as_ref().unwrap().is_some())
            .count();
        assert_eq!(winners, 1);
        assert_eq!(store.get_job(job.id).await.unwrap().status, Status::Running);
    }

    #[tokio::test]
    async fn test_claim_rejects_wrong_key_config_and_pin() {
        let store = MemoryStore::new();
        let (event, _) = store.get_or_create_event(&push_event("abc"), 0).await.unwrap();
        let mut job = ready_job(&store, event.id, 0).await;
        let owner = store.get_or_create_client("owner", "a").await.unwrap();
        let other = store.get_or_create_client("other", "b").await.unwrap();

        assert!(store.try_claim(job.id, "nope", "linux", other.id).await.unwrap().is_none());
        assert!(store.try_claim(job.id, "key", "mac", other.id).await.unwrap().is_none());

        job.invalidated = true;
        job.same_client = true;
        job.client_id = Some(owner.id);
        store.update_job(&job).await.unwrap();
        assert!(store.try_claim(job.id, "key", "linux", other.id).await.unwrap().is_none());

        let claimed = store.try_claim(job.id, "key", "linux", owner.id).await.unwrap();
        assert_eq!(claimed.unwrap().client_id, Some(owner.id));

        store.release_claim(job.id, owner.id, Some(owner.id)).await.unwrap();
        let released = store.get_job(job.id).await.unwrap();
        assert_eq!(released.status, Status::NotStarted);
        assert_eq!(released.client_id, Some(owner.id));
    }

    #[tokio::test]
    async fn test_ready_jobs_orders_by_priority() {
        let store = MemoryStore::new();
        let (event, _) = store.get_or_create_event(&push_event("abc"), 0).await.unwrap();
        let low = ready_job(&store, event.id, 1).await;
        let high = ready_job(&store, event.id, 10).await;

        let rows = store.ready_jobs("key").await.unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.job.id).collect();
        assert_eq!(ids, vec![high.id, low.id]);
        assert!(store.ready_jobs("other-key").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_ready_only_once() {
        let store = MemoryStore::new();
        let (event, _) = store.get_or_create_event(&push_event("abc"), 0).await.unwrap();
        let job = ready_job(&store, event.id, 0).await;
        assert!(!store.mark_ready(job.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_step_results_reject_duplicates() {
        let store = MemoryStore::new();
        let job_id = ResourceId::new();
        let results = vec![
            StepResult::new(job_id, 0, "build"),
            StepResult::new(job_id, 1, "test"),
        ];
        store.create_step_results(&results).await.unwrap();
        let again = vec![StepResult::new(job_id, 0, "build")];
        assert!(matches!(
            store.create_step_results(&again).await,
            Err(DbError::Duplicate(_))
        ));

        store.append_step_output(results[1].id, "hello ", 1).await.unwrap();
        store.append_step_output(results[1].id, "world", 2).await.unwrap();
        let test = store.get_step_result(results[1].id).await.unwrap();
        assert_eq!(test.output, "hello world");
        assert_eq!(test.status, Status::Running);

        store.delete_step_results(job_id).await.unwrap();
        assert!(store.step_results_for_job(job_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_worker_writes_after_cancel_keep_job_canceled() {
        let store = MemoryStore::new();
        let (event, _) = store.get_or_create_event(&push_event("abc"), 0).await.unwrap();
        let job = ready_job(&store, event.id, 0).await;
        let client = store.get_or_create_client("worker", "10.0.0.1").await.unwrap();
        let running = store
            .try_claim(job.id, "key", "linux", client.id)
            .await
            .unwrap()
            .unwrap();

        // A cancel lands after the worker's handler read the RUNNING row.
        let canceled = store.mark_job_canceled(job.id).await.unwrap().unwrap();
        assert_eq!(canceled.status, Status::Canceled);
        assert!(store.mark_job_canceled(job.id).await.unwrap().is_none());

        store
            .set_job_progress(running.id, 12, Some("1/2"), Some("build"))
            .await
            .unwrap();
        let finished = store
            .finish_job(running.id, client.id, Status::Success, true, 30)
            .await
            .unwrap();
        assert!(finished.is_none());

        let stored = store.get_job(job.id).await.unwrap();
        assert_eq!(stored.status, Status::Canceled);
        assert!(stored.complete);
        assert_eq!(stored.seconds, 12);
        assert_eq!(stored.failed_step.as_deref(), Some("build"));
    }

    #[tokio::test]
    async fn test_finish_job_requires_running_owner() {
        let store = MemoryStore::new();
        let (event, _) = store.get_or_create_event(&push_event("abc"), 0).await.unwrap();
        let job = ready_job(&store, event.id, 0).await;
        let owner = store.get_or_create_client("owner", "a").await.unwrap();
        let other = store.get_or_create_client("other", "b").await.unwrap();
        store.try_claim(job.id, "key", "linux", owner.id).await.unwrap();

        store.set_job_progress(job.id, 5, None, Some("build")).await.unwrap();
        store.set_job_progress(job.id, 6, None, Some("test")).await.unwrap();
        assert!(store
            .finish_job(job.id, other.id, Status::Failed, true, 9)
            .await
            .unwrap()
            .is_none());

        let finished = store
            .finish_job(job.id, owner.id, Status::Failed, true, 9)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(finished.status, Status::Failed);
        assert!(finished.complete);
        assert_eq!(finished.seconds, 9);
        assert_eq!(finished.failed_step.as_deref(), Some("build"));
        assert_eq!(finished.running_step, None);
    }

    #[tokio::test]
    async fn test_cancel_step_results_skips_completed_steps() {
        let store = MemoryStore::new();
        let job_id = ResourceId::new();
        let mut done = StepResult::new(job_id, 0, "build");
        let running = StepResult::new(job_id, 1, "test");
        let waiting = StepResult::new(job_id, 2, "deploy");
        store
            .create_step_results(&[done.clone(), running.clone(), waiting.clone()])
            .await
            .unwrap();
        done.status = Status::Success;
        done.complete = true;
        store.update_step_result(&done).await.unwrap();
        store.append_step_output(running.id, "half", 1).await.unwrap();

        assert_eq!(store.cancel_step_results(job_id).await.unwrap(), 2);
        // Late output from the worker does not revive a canceled step.
        store.append_step_output(running.id, " more", 2).await.unwrap();

        let statuses: Vec<_> = store
            .step_results_for_job(job_id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.name, r.status))
            .collect();
        assert_eq!(
            statuses,
            vec![
                ("build".to_string(), Status::Success),
                ("test".to_string(), Status::Canceled),
                ("deploy".to_string(), Status::Canceled),
            ]
        );
    }

    #[tokio::test]
    async fn test_retired_recipe_kept_while_used() {
        let store = MemoryStore::new();
        let (event, _) = store.get_or_create_event(&push_event("abc"), 0).await.unwrap();
        let job = ready_job(&store, event.id, 3).await;

        assert!(!store.retire_recipe(job.recipe_id).await.unwrap());
        assert!(store.get_recipe(job.recipe_id).await.is_ok());
        assert!(store.current_recipes().await.unwrap().is_empty());

        let unused = store.create_recipe(&definition("x.kdl", 0)).await.unwrap();
        assert!(store.retire_recipe(unused.id).await.unwrap());
        assert!(store.get_recipe(unused.id).await.is_err());
    }

    #[tokio::test]
    async fn test_client_registration_is_idempotent() {
        let store = MemoryStore::new();
        let first = store.get_or_create_client("worker", "10.0.0.1").await.unwrap();
        let again = store.get_or_create_client("worker", "10.0.0.1").await.unwrap();
        assert_eq!(first.id, again.id);
        let elsewhere = store.get_or_create_client("worker", "10.0.0.2").await.unwrap();
        assert_ne!(first.id, elsewhere.id);

        store
            .set_client_status(first.id, ClientStatus::Running, "Running job")
            .await
            .unwrap();
        let client = store.get_client(first.id).await.unwrap();
        assert_eq!(client.status, ClientStatus::Running);
    }
}
