//! Shared fixtures for scheduler tests: an in-memory store wired to a git
//! host that records what it was asked to do.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use conveyor_config::{BranchSettings, ServerConfig};
use conveyor_core::event::{CommitRef, NewEvent, PullRequestAction, PullRequestRef};
use conveyor_core::host::{CommitState, CommitStatusUpdate, GitHost};
use conveyor_core::job::Job;
use conveyor_core::protocol::StepReport;
use conveyor_core::recipe::{Cause, Recipe, RecipeDefinition, RecipeStep, TriggerPolicy};
use conveyor_core::{ResourceId, Status};
use conveyor_db::{JobRepo, MemoryStore, RecipeRepo, Store};
use parking_lot::Mutex;

use crate::dispatch::{Caller, DispatchService};
use crate::lifecycle::{EventController, EventOutcome};
use crate::notify::StatusReporter;
use crate::readiness::ReadinessEngine;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCall {
    Status {
        sha: String,
        state: CommitState,
        description: String,
        context: String,
    },
    Comment {
        url: String,
        body: String,
    },
}

#[derive(Default)]
pub struct RecordingHost {
    calls: Mutex<Vec<RecordedCall>>,
    collaborators: Mutex<HashSet<String>>,
}

impl RecordingHost {
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn add_collaborator(&self, user: &str) {
        self.collaborators.lock().insert(user.to_string());
    }
}

#[async_trait]
impl GitHost for RecordingHost {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn update_commit_status(
        &self,
        update: &CommitStatusUpdate,
    ) -> conveyor_core::Result<()> {
        self.calls.lock().push(RecordedCall::Status {
            sha: update.sha.clone(),
            state: update.state,
            description: update.description.clone(),
            context: update.context.clone(),
        });
        Ok(())
    }

    async fn post_comment(&self, comments_url: &str, body: &str) -> conveyor_core::Result<()> {
        self.calls.lock().push(RecordedCall::Comment {
            url: comments_url.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }

    async fn is_collaborator(&self, user: &str, _repository: &str) -> conveyor_core::Result<bool> {
        Ok(self.collaborators.lock().contains(user))
    }

    async fn install_webhook(
        &self,
        _repository: &str,
        _hook_url: &str,
        _secret: &str,
    ) -> conveyor_core::Result<()> {
        Ok(())
    }
}

fn commit(branch: &str, sha: &str) -> CommitRef {
    CommitRef {
        repository: "acme/widgets".to_string(),
        branch: branch.to_string(),
        sha: sha.to_string(),
        ssh_url: "git@example.com:acme/widgets.git".to_string(),
    }
}

/// A push to `acme/widgets` main under build key `key`.
pub fn push_event(sha: &str) -> NewEvent {
    NewEvent {
        cause: Cause::Push,
        build_user: "buildbot".to_string(),
        build_key: "key".to_string(),
        base: commit("main", sha),
        head: commit("main", sha),
        pull_request: None,
        trigger_user: "alice".to_string(),
        comments_url: None,
        description: format!("Push {}", sha),
        force: false,
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub host: Arc<RecordingHost>,
    pub readiness: Arc<ReadinessEngine>,
    pub lifecycle: Arc<EventController>,
    pub dispatch: DispatchService,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    pub async fn with_remote_update() -> Self {
        Self::with_config(ServerConfig {
            remote_update: true,
            ..ServerConfig::default()
        })
    }

    pub async fn with_branches(branches: Vec<BranchSettings>) -> Self {
        Self::with_config(ServerConfig {
            branches,
            ..ServerConfig::default()
        })
    }

    fn with_config(config: ServerConfig) -> Self {
        let config = Arc::new(config);
        let store = Arc::new(MemoryStore::new());
        let host = Arc::new(RecordingHost::default());
        let shared: Arc<dyn Store> = store.clone();
        let reporter = Arc::new(StatusReporter::new(host.clone(), config.clone()));
        let readiness = Arc::new(ReadinessEngine::new(shared.clone(), reporter.clone()));
        let lifecycle = Arc::new(EventController::new(
            shared.clone(),
            readiness.clone(),
            reporter.clone(),
            config.clone(),
        ));
        let dispatch = DispatchService::new(
            shared,
            readiness.clone(),
            lifecycle.clone(),
            reporter,
            config,
        );
        Self {
            store,
            host,
            readiness,
            lifecycle,
            dispatch,
        }
    }

    /// A fully automatic push recipe for `acme/widgets` main with two steps.
    pub fn definition(&self, filename: &str, depends_on: &[&str]) -> RecipeDefinition {
        let name = filename.trim_end_matches(".kdl");
        let step = |name: &str, script: &str| RecipeStep {
            name: name.to_string(),
            script: script.to_string(),
            abort_on_failure: true,
            allowed_to_fail: false,
            environment: vec![],
        };
        RecipeDefinition {
            name: name.to_string(),
            display_name: name.to_string(),
            filename: filename.to_string(),
            build_user: "buildbot".to_string(),
            repository: "acme/widgets".to_string(),
            branch: Some("main".to_string()),
            cause: Cause::Push,
            trigger: TriggerPolicy::FullAuto,
            authorized_users: vec![],
            build_configs: vec!["linux".to_string()],
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
            priority: 0,
            active: true,
            auto_cancel_on_push: false,
            abort_on_failure: true,
            environment: vec![],
            prestep_sources: vec![],
            steps: vec![step("build", "make"), step("test", "make test")],
        }
    }

    pub async fn recipe(&self, filename: &str, depends_on: &[&str]) -> Recipe {
        let def = self.definition(filename, depends_on);
        self.store.create_recipe(&def).await.unwrap()
    }

    pub async fn manual_recipe(&self, filename: &str) -> Recipe {
        let mut def = self.definition(filename, &[]);
        def.trigger = TriggerPolicy::Manual;
        self.store.create_recipe(&def).await.unwrap()
    }

    pub async fn push(&self, sha: &str) -> EventOutcome {
        self.lifecycle.create_event(&push_event(sha)).await.unwrap()
    }

    /// A pull request from `feature` into main.
    pub fn pr_event(&self, sha: &str, number: i64, action: PullRequestAction) -> NewEvent {
        NewEvent {
            cause: Cause::PullRequest,
            build_user: "buildbot".to_string(),
            build_key: "key".to_string(),
            base: commit("main", "base"),
            head: commit("feature", sha),
            pull_request: Some(PullRequestRef {
                number,
                title: "Add widgets".to_string(),
                action,
            }),
            trigger_user: "alice".to_string(),
            comments_url: Some(format!(
                "https://api.example.com/repos/acme/widgets/issues/{}/comments",
                number
            )),
            description: format!("PR #{}", number),
            force: false,
        }
    }

    /// Claim a job as `worker` and report its first step as started.
    pub async fn start_first_step(&self, job_id: ResourceId) {
        let worker = Caller::new("worker", "10.0.0.1");
        let response = self
            .dispatch
            .claim("key", "linux", &worker, job_id)
            .await
            .unwrap();
        let spec = response.job_info.unwrap();
        self.dispatch
            .step_start("key", &worker, spec.steps[0].stepresult_id, &StepReport::default())
            .await
            .unwrap();
    }

    pub async fn step_statuses(&self, job_id: ResourceId) -> Vec<(String, Status)> {
        self.store
            .step_results_for_job(job_id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.name, r.status))
            .collect()
    }

    pub async fn job_for(&self, event_id: ResourceId, filename: &str) -> Job {
        for job in self.store.jobs_for_event(event_id).await.unwrap() {
            let recipe = self.store.get_recipe(job.recipe_id).await.unwrap();
            if recipe.definition.filename == filename {
                return job;
            }
        }
        panic!("no job for {} in event {}", filename, event_id);
    }

    pub async fn finish(&self, job_id: ResourceId, status: Status) {
        let mut job = self.store.get_job(job_id).await.unwrap();
        job.status = status;
        job.complete = true;
        self.store.update_job(&job).await.unwrap();
    }
}
