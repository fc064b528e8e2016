//! Server side of the worker protocol.
//!
//! Every state change here is a short conditional update in the store; the
//! only exclusivity needed is the atomic claim.

use std::sync::Arc;

use conveyor_config::ServerConfig;
use conveyor_core::event::Event;
use conveyor_core::job::{Client, Job, StepResult};
use conveyor_core::protocol::{
    ClaimResponse, Command, ENV_PREFIX, EXIT_INTERMITTENT_FAILURE, EXIT_SKIP, JobFinishedReport,
    JobSpec, ReadyJob, ReadyJobs, Reply, StepReport, StepSpec,
};
use conveyor_core::recipe::{Cause, RecipeDefinition};
use conveyor_core::status::aggregate;
use conveyor_core::{ClientStatus, ResourceId, Status};
use conveyor_db::{ReadyRow, Store};
use tracing::{debug, info, warn};

use crate::lifecycle::EventController;
use crate::notify::StatusReporter;
use crate::readiness::ReadinessEngine;
use crate::{Result, SchedulerError};

/// Who is calling: the worker's self-reported name and the address the
/// request came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub name: String,
    pub address: String,
}

impl Caller {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

/// A step result being reported on, with everything needed to answer.
struct StepContext {
    step: StepResult,
    job: Job,
    event: Event,
    recipe: RecipeDefinition,
    client: Client,
}

pub struct DispatchService {
    store: Arc<dyn Store>,
    readiness: Arc<ReadinessEngine>,
    lifecycle: Arc<EventController>,
    reporter: Arc<StatusReporter>,
    config: Arc<ServerConfig>,
}

impl DispatchService {
    pub fn new(
        store: Arc<dyn Store>,
        readiness: Arc<ReadinessEngine>,
        lifecycle: Arc<EventController>,
        reporter: Arc<StatusReporter>,
        config: Arc<ServerConfig>,
    ) -> Self {
        Self {
            store,
            readiness,
            lifecycle,
            reporter,
            config,
        }
    }

    /// Jobs a worker may claim, highest priority first.
    ///
    /// A worker asking for work is not running anything, so jobs still bound
    /// to it are canceled first.
    pub async fn list_ready(
        &self,
        build_key: &str,
        caller: &Caller,
        configs: &[String],
    ) -> Result<ReadyJobs> {
        let client = self
            .store
            .get_or_create_client(&caller.name, &caller.address)
            .await?;

        let message = format!("Canceled due to client {} not finishing job", client.name);
        for job in self.store.running_jobs_for_client(client.id).await? {
            warn!(job_id = %job.id, client = %client.name, "Client abandoned job");
            self.lifecycle.cancel_job(job.id, &message).await?;
        }
        self.store
            .set_client_status(client.id, ClientStatus::Idle, "Looking for work")
            .await?;

        let mut listed = Vec::new();
        let mut oldest_first = Vec::new();
        for row in self.store.ready_jobs(build_key).await? {
            if !configs.iter().any(|c| c == &row.job.config) || row.job.pinned_elsewhere(client.id)
            {
                continue;
            }
            if self.finish_current_first(&row) {
                oldest_first.push(row);
            } else {
                listed.push(row);
            }
        }

        // Push jobs on "except current" branches go last, oldest event first,
        // so the build already underway finishes before newer heads start.
        oldest_first.sort_by(|a, b| {
            a.event_created_at
                .cmp(&b.event_created_at)
                .then(b.priority.cmp(&a.priority))
        });
        listed.extend(oldest_first);

        let jobs: Vec<ReadyJob> = listed
            .into_iter()
            .map(|row| ReadyJob {
                id: row.job.id,
                config: row.job.config,
            })
            .collect();
        debug!(client = %client.name, count = jobs.len(), "Listed ready jobs");
        Ok(ReadyJobs { jobs })
    }

    fn finish_current_first(&self, row: &ReadyRow) -> bool {
        row.cause == Cause::Push
            && self
                .config
                .branch(&row.repository, &row.branch)
                .is_some_and(|b| b.auto_cancel_except_current)
    }

    /// Try to take a job. Exactly one concurrent caller wins; the rest get
    /// `success: false` and no job spec.
    pub async fn claim(
        &self,
        build_key: &str,
        config: &str,
        caller: &Caller,
        job_id: ResourceId,
    ) -> Result<ClaimResponse> {
        let rejected = |message: &str| ClaimResponse {
            success: false,
            message: message.to_string(),
            job_id,
            job_info: None,
        };

        let client = self
            .store
            .get_or_create_client(&caller.name, &caller.address)
            .await?;
        let previous_client = match self.store.get_job(job_id).await {
            Ok(job) => job.client_id,
            Err(conveyor_db::DbError::NotFound(_)) => return Ok(rejected("No job found")),
            Err(e) => return Err(e.into()),
        };

        let Some(job) = self
            .store
            .try_claim(job_id, build_key, config, client.id)
            .await?
        else {
            info!(job_id = %job_id, client = %client.name, "Claim lost");
            return Ok(rejected("Job is not available"));
        };

        let (spec, event, recipe) = match self.job_spec(&job).await {
            Ok(built) => built,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Could not build job spec, rolling back claim");
                self.store.delete_step_results(job_id).await?;
                self.store
                    .release_claim(job_id, client.id, previous_client)
                    .await?;
                return Ok(rejected("Could not prepare job"));
            }
        };

        self.store
            .set_client_status(
                client.id,
                ClientStatus::Running,
                &format!("Job {}: {}", job.id, recipe.display_name),
            )
            .await?;
        info!(job_id = %job.id, client = %client.name, recipe = %recipe.name, "Job claimed");
        self.reporter.job_starting(&event, &job, &recipe).await;
        self.readiness.evaluate(job.event_id).await?;

        Ok(ClaimResponse {
            success: true,
            message: "Success".to_string(),
            job_id,
            job_info: Some(spec),
        })
    }

    /// Freeze the job's recipe into a spec and create its step results.
    async fn job_spec(&self, job: &Job) -> Result<(JobSpec, Event, RecipeDefinition)> {
        let event = self.store.get_event(job.event_id).await?;
        let recipe = self.store.get_recipe(job.recipe_id).await?.definition;

        let mut environment = vec![
            env("JOB_ID", job.id),
            env("RECIPE_ID", job.recipe_id),
            env("RECIPE_NAME", &recipe.name),
            env("COMMENTS_URL", event.comments_url.as_deref().unwrap_or("")),
            env("BASE_REPO", &event.base.repository),
            env("BASE_REF", &event.base.branch),
            env("BASE_SHA", &event.base.sha),
            env("BASE_SSH_URL", &event.base.ssh_url),
            env("HEAD_REPO", &event.head.repository),
            env("HEAD_REF", &event.head.branch),
            env("HEAD_SHA", &event.head.sha),
            env("HEAD_SSH_URL", &event.head.ssh_url),
            env("EVENT_CAUSE", event.cause),
            env("BUILD_CONFIG", &job.config),
            env("INVALIDATED", job.invalidated),
            env("PR_NUM", event.pr_number.unwrap_or(0)),
            env("NUM_STEPS", recipe.steps.len()),
        ];
        environment.extend(
            recipe
                .environment
                .iter()
                .map(|var| (var.name.clone(), var.value.clone())),
        );

        let mut results = Vec::with_capacity(recipe.steps.len());
        let mut steps = Vec::with_capacity(recipe.steps.len());
        for (position, step) in recipe.steps.iter().enumerate() {
            let position = position as i32;
            let mut result = StepResult::new(job.id, position, &step.name);
            result.abort_on_failure = step.abort_on_failure;
            result.allowed_to_fail = step.allowed_to_fail;

            let mut step_env = vec![
                env("STEP_NUM", position),
                env("STEP_NAME", &step.name),
                env("STEP_ABORT_ON_FAILURE", step.abort_on_failure),
                env("STEP_ALLOWED_TO_FAIL", step.allowed_to_fail),
            ];
            step_env.extend(
                step.environment
                    .iter()
                    .map(|var| (var.name.clone(), var.value.clone())),
            );

            steps.push(StepSpec {
                step_num: position,
                step_name: step.name.clone(),
                step_abort_on_failure: step.abort_on_failure,
                step_allowed_to_fail: step.allowed_to_fail,
                stepresult_id: result.id,
                environment: step_env,
                script: step.script.clone(),
            });
            results.push(result);
        }

        self.store.create_step_results(&results).await?;

        let spec = JobSpec {
            job_id: job.id,
            recipe_name: recipe.name.clone(),
            abort_on_failure: recipe.abort_on_failure,
            environment,
            prestep_sources: recipe.prestep_sources.clone(),
            steps,
        };
        Ok((spec, event, recipe))
    }

    /// Load a step result and check that `caller` is the client its job is
    /// bound to under `build_key`.
    async fn step_context(
        &self,
        build_key: &str,
        caller: &Caller,
        stepresult_id: ResourceId,
    ) -> Result<StepContext> {
        let step = self
            .store
            .get_step_result(stepresult_id)
            .await
            .map_err(|_| SchedulerError::Rejected("Invalid stepresult id".to_string()))?;
        let client = self
            .store
            .get_or_create_client(&caller.name, &caller.address)
            .await?;
        let job = self.store.get_job(step.job_id).await?;
        if job.client_id != Some(client.id) {
            return Err(SchedulerError::Rejected(
                "Same client that started is required".to_string(),
            ));
        }
        let event = self.store.get_event(job.event_id).await?;
        if event.build_key != build_key {
            return Err(SchedulerError::Rejected("Invalid build key".to_string()));
        }
        let recipe = self.store.get_recipe(job.recipe_id).await?.definition;
        Ok(StepContext {
            step,
            job,
            event,
            recipe,
            client,
        })
    }

    /// What the worker should do about a job that changed under it.
    fn pending_command(job: &Job) -> Option<Command> {
        match job.status {
            Status::Canceled => Some(Command::Cancel),
            Status::NotStarted | Status::ActivationRequired => Some(Command::Stop),
            _ => None,
        }
    }

    /// Re-read the job after a worker report has been stored. A cancel that
    /// raced the report also cancels the steps the report just touched.
    async fn current_command(&self, job_id: ResourceId) -> Result<(Job, Option<Command>)> {
        let job = self.store.get_job(job_id).await?;
        if job.status == Status::Canceled {
            self.store.cancel_step_results(job.id).await?;
        }
        let command = Self::pending_command(&job);
        Ok((job, command))
    }

    async fn job_seconds(&self, job_id: ResourceId) -> Result<i64> {
        Ok(self
            .store
            .step_results_for_job(job_id)
            .await?
            .iter()
            .map(|s| s.seconds)
            .sum())
    }

    pub async fn step_start(
        &self,
        build_key: &str,
        caller: &Caller,
        stepresult_id: ResourceId,
        report: &StepReport,
    ) -> Result<Reply> {
        let StepContext {
            mut step,
            job,
            event,
            recipe,
            client,
        } = self.step_context(build_key, caller, stepresult_id).await?;

        step.status = Status::Running;
        step.seconds = report.time;
        self.store.update_step_result(&step).await?;

        let running_step = format!("{}/{}", step.position + 1, recipe.steps.len());
        let seconds = self.job_seconds(job.id).await?;
        self.store
            .set_job_progress(job.id, seconds, Some(&running_step), None)
            .await?;
        self.store
            .set_client_status(
                client.id,
                ClientStatus::Running,
                &format!("Starting {} on job {}", step.name, job.id),
            )
            .await?;

        // The job may have been canceled or invalidated since the claim.
        let (job, command) = self.current_command(job.id).await?;
        if command.is_none() {
            self.reporter
                .step_started(&event, &job, &recipe, step.position + 1, &step.name)
                .await;
        }

        let reply = Reply::ok("success");
        Ok(match command {
            Some(command) => reply.with_command(command),
            None => reply,
        })
    }

    pub async fn step_update(
        &self,
        build_key: &str,
        caller: &Caller,
        stepresult_id: ResourceId,
        report: &StepReport,
    ) -> Result<Reply> {
        let StepContext {
            step, job, client, ..
        } = self.step_context(build_key, caller, stepresult_id).await?;

        self.store
            .append_step_output(step.id, &report.output, report.time)
            .await?;
        let seconds = self.job_seconds(job.id).await?;
        self.store
            .set_job_progress(job.id, seconds, None, None)
            .await?;
        self.store
            .set_client_status(
                client.id,
                ClientStatus::Running,
                &format!("Running job {}: {} ({}s)", job.id, step.name, report.time),
            )
            .await?;

        let (_, command) = self.current_command(job.id).await?;
        let reply = Reply::ok("success");
        Ok(match command {
            Some(command) => reply.with_command(command),
            None => reply,
        })
    }

    pub async fn step_complete(
        &self,
        build_key: &str,
        caller: &Caller,
        stepresult_id: ResourceId,
        report: &StepReport,
    ) -> Result<Reply> {
        let StepContext {
            mut step,
            job,
            recipe,
            client,
            ..
        } = self.step_context(build_key, caller, stepresult_id).await?;

        let status = step_status(report, step.allowed_to_fail);
        let failed_step = matches!(status, Status::Failed | Status::FailedOk).then(|| step.name.clone());

        // The final report carries the whole output, not just the last chunk.
        step.output = report.output.clone();
        step.seconds = report.time;
        step.complete = report.complete;
        step.exit_status = report.exit_status;
        step.status = status;
        self.store.update_step_result(&step).await?;

        let seconds = self.job_seconds(job.id).await?;
        self.store
            .set_job_progress(job.id, seconds, None, failed_step.as_deref())
            .await?;
        self.store
            .set_client_status(
                client.id,
                ClientStatus::Running,
                &format!("Completed job {}: {}", job.id, step.name),
            )
            .await?;
        debug!(job_id = %job.id, step = %step.name, status = %status, "Step complete");

        let (_, command) = self.current_command(job.id).await?;
        let halt = match status {
            Status::Canceled | Status::Skipped => true,
            Status::Failed | Status::FailedOk => {
                step.abort_on_failure && recipe.abort_on_failure
            }
            _ => false,
        };
        let mut reply = Reply::ok("success");
        if halt || command.is_some() {
            reply = reply.halt();
        }
        Ok(match command {
            Some(command) => reply.with_command(command),
            None => reply,
        })
    }

    /// Finalize a job the worker is done with, then re-run readiness for its
    /// event.
    pub async fn job_finished(
        &self,
        build_key: &str,
        caller: &Caller,
        job_id: ResourceId,
        report: &JobFinishedReport,
    ) -> Result<Reply> {
        let client = self
            .store
            .get_or_create_client(&caller.name, &caller.address)
            .await?;
        let job = self
            .store
            .get_job(job_id)
            .await
            .map_err(|_| SchedulerError::Rejected("Invalid job/build_key".to_string()))?;
        let event = self.store.get_event(job.event_id).await?;
        if event.build_key != build_key {
            return Err(SchedulerError::Rejected(
                "Invalid job/build_key".to_string(),
            ));
        }

        // Invalidated while running: the results were discarded and the job
        // waits for a fresh claim, possibly by another client.
        if matches!(
            job.status,
            Status::NotStarted | Status::ActivationRequired
        ) {
            self.store
                .set_client_status(client.id, ClientStatus::Idle, "Job was invalidated")
                .await?;
            return Ok(Reply::ok("Job was invalidated"));
        }
        if job.client_id != Some(client.id) {
            return Err(SchedulerError::Rejected(
                "Same client that started is required".to_string(),
            ));
        }

        self.store
            .set_client_status(
                client.id,
                ClientStatus::Idle,
                &format!("Finished job {}", job.id),
            )
            .await?;

        let status = if report.canceled {
            Status::Canceled
        } else {
            let steps = self.store.step_results_for_job(job.id).await?;
            if steps.is_empty() {
                Status::Success
            } else {
                aggregate(steps.iter().map(|s| s.status))
            }
        };
        let complete = report.complete || report.canceled;
        let finished = self
            .store
            .finish_job(job.id, client.id, status, complete, report.seconds)
            .await?;
        let job = match finished {
            Some(job) => job,
            None => {
                // Canceled or invalidated while the worker was reporting.
                let current = self.store.get_job(job.id).await?;
                if matches!(
                    current.status,
                    Status::NotStarted | Status::ActivationRequired
                ) {
                    return Ok(Reply::ok("Job was invalidated"));
                }
                self.store
                    .set_job_progress(current.id, report.seconds, None, None)
                    .await?;
                self.store.get_job(current.id).await?
            }
        };
        info!(job_id = %job.id, status = %job.status, seconds = job.seconds, "Job finished");

        let recipe = self.store.get_recipe(job.recipe_id).await?.definition;
        self.reporter.job_finished(&event, &job, &recipe).await;
        self.readiness.evaluate(job.event_id).await?;
        Ok(Reply::ok("Success"))
    }

    /// Record that a worker is alive without changing what it is doing.
    pub async fn ping(&self, caller: &Caller) -> Result<Reply> {
        let client = self
            .store
            .get_or_create_client(&caller.name, &caller.address)
            .await?;
        debug!(client = %client.name, "Ping");
        Ok(Reply::ok("success"))
    }
}

fn env(name: &str, value: impl ToString) -> (String, String) {
    (format!("{}{}", ENV_PREFIX, name), value.to_string())
}

/// Status of a finished step from the worker's report.
pub fn step_status(report: &StepReport, allowed_to_fail: bool) -> Status {
    if report.canceled {
        Status::Canceled
    } else if report.exit_status == 0 {
        Status::Success
    } else if report.exit_status == EXIT_INTERMITTENT_FAILURE {
        Status::IntermittentFailure
    } else if report.exit_status == EXIT_SKIP {
        Status::Skipped
    } else if allowed_to_fail {
        Status::FailedOk
    } else {
        Status::Failed
    }
}
