//! Job, step result and change log repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::job::{ChangeLogEntry, Job, StepResult};
use conveyor_core::recipe::Cause;
use conveyor_core::{ResourceId, Status};

use super::PgStore;
use crate::error::duplicate_on_conflict;
use crate::{DbError, DbResult};

#[derive(Debug, Clone, sqlx::FromRow)]
struct JobRecord {
    id: uuid::Uuid,
    event_id: uuid::Uuid,
    recipe_id: uuid::Uuid,
    config: String,
    status: String,
    ready: bool,
    active: bool,
    complete: bool,
    invalidated: bool,
    same_client: bool,
    client_id: Option<uuid::Uuid>,
    seconds: i64,
    failed_step: Option<String>,
    running_step: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<JobRecord> for Job {
    type Error = DbError;

    fn try_from(r: JobRecord) -> DbResult<Self> {
        Ok(Job {
            id: ResourceId::from_uuid(r.id),
            event_id: ResourceId::from_uuid(r.event_id),
            recipe_id: ResourceId::from_uuid(r.recipe_id),
            config: r.config,
            status: r.status.parse()?,
            ready: r.ready,
            active: r.active,
            complete: r.complete,
            invalidated: r.invalidated,
            same_client: r.same_client,
            client_id: r.client_id.map(ResourceId::from_uuid),
            seconds: r.seconds,
            failed_step: r.failed_step,
            running_step: r.running_step,
            created_at: r.created_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct ReadyRecord {
    #[sqlx(flatten)]
    job: JobRecord,
    priority: i32,
    event_cause: String,
    event_repository: String,
    event_branch: String,
    event_created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct StepResultRecord {
    id: uuid::Uuid,
    job_id: uuid::Uuid,
    name: String,
    position: i32,
    abort_on_failure: bool,
    allowed_to_fail: bool,
    exit_status: i32,
    status: String,
    complete: bool,
    output: String,
    seconds: i64,
}

impl TryFrom<StepResultRecord> for StepResult {
    type Error = DbError;

    fn try_from(r: StepResultRecord) -> DbResult<Self> {
        Ok(StepResult {
            id: ResourceId::from_uuid(r.id),
            job_id: ResourceId::from_uuid(r.job_id),
            name: r.name,
            position: r.position,
            abort_on_failure: r.abort_on_failure,
            allowed_to_fail: r.allowed_to_fail,
            exit_status: r.exit_status,
            status: r.status.parse()?,
            complete: r.complete,
            output: r.output,
            seconds: r.seconds,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct ChangeLogRecord {
    job_id: uuid::Uuid,
    message: String,
    created_at: DateTime<Utc>,
}

/// A job to materialize for an event.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub event_id: ResourceId,
    pub recipe_id: ResourceId,
    pub config: String,
    pub active: bool,
    pub status: Status,
}

/// A claimable job with what dispatch needs to order and filter it.
#[derive(Debug, Clone)]
pub struct ReadyRow {
    pub job: Job,
    pub priority: i32,
    pub cause: Cause,
    pub repository: String,
    pub branch: String,
    pub event_created_at: DateTime<Utc>,
}

impl TryFrom<ReadyRecord> for ReadyRow {
    type Error = DbError;

    fn try_from(r: ReadyRecord) -> DbResult<Self> {
        Ok(ReadyRow {
            job: r.job.try_into()?,
            priority: r.priority,
            cause: r.event_cause.parse()?,
            repository: r.event_repository,
            branch: r.event_branch,
            event_created_at: r.event_created_at,
        })
    }
}

#[async_trait]
pub trait JobRepo: Send + Sync {
    /// Insert the job unless the event already has one for this recipe and
    /// config. Returns the job and whether it was created by this call.
    async fn get_or_create_job(&self, new: &NewJob) -> DbResult<(Job, bool)>;

    async fn get_job(&self, id: ResourceId) -> DbResult<Job>;

    async fn jobs_for_event(&self, event_id: ResourceId) -> DbResult<Vec<Job>>;

    /// Persist every mutable field of a job.
    async fn update_job(&self, job: &Job) -> DbResult<()>;

    /// Flip `ready` from false to true. Returns `false` if the job was
    /// already ready, complete or inactive.
    async fn mark_ready(&self, id: ResourceId) -> DbResult<bool>;

    /// Claimable jobs of events owned by `build_key`, highest recipe priority
    /// first, then oldest first.
    async fn ready_jobs(&self, build_key: &str) -> DbResult<Vec<ReadyRow>>;

    /// Atomically move a claimable job to RUNNING and bind it to the client.
    /// Returns `None` if the job is gone, no longer claimable, has another
    /// config, belongs to another build key, or is pinned elsewhere.
    async fn try_claim(
        &self,
        id: ResourceId,
        build_key: &str,
        config: &str,
        client_id: ResourceId,
    ) -> DbResult<Option<Job>>;

    /// Undo a claim made by `client_id`, restoring the previous binding.
    async fn release_claim(
        &self,
        id: ResourceId,
        client_id: ResourceId,
        previous_client: Option<ResourceId>,
    ) -> DbResult<()>;

    async fn running_jobs_for_client(&self, client_id: ResourceId) -> DbResult<Vec<Job>>;

    /// Record a job's elapsed time and step bookkeeping. Never touches
    /// status, readiness or completion. `running_step` replaces the current
    /// value when given; `failed_step` only fills an empty one.
    async fn set_job_progress(
        &self,
        id: ResourceId,
        seconds: i64,
        running_step: Option<&str>,
        failed_step: Option<&str>,
    ) -> DbResult<()>;

    /// Complete a job that is still RUNNING for `client_id`. Returns `None`
    /// if it was canceled, invalidated or rebound in the meantime.
    async fn finish_job(
        &self,
        id: ResourceId,
        client_id: ResourceId,
        status: Status,
        complete: bool,
        seconds: i64,
    ) -> DbResult<Option<Job>>;

    /// Complete an incomplete job as CANCELED. Returns `None` if it was
    /// already complete.
    async fn mark_job_canceled(&self, id: ResourceId) -> DbResult<Option<Job>>;

    /// Move every step result of the job that has not completed to
    /// CANCELED. Returns how many changed.
    async fn cancel_step_results(&self, job_id: ResourceId) -> DbResult<u64>;

    /// Insert a job's step results. Fails with [`DbError::Duplicate`] if any
    /// step result already exists for the job.
    async fn create_step_results(&self, results: &[StepResult]) -> DbResult<()>;

    async fn get_step_result(&self, id: ResourceId) -> DbResult<StepResult>;

    async fn step_results_for_job(&self, job_id: ResourceId) -> DbResult<Vec<StepResult>>;

    async fn update_step_result(&self, result: &StepResult) -> DbResult<()>;

    /// Append streamed output to a step and mark it running, unless it was
    /// already canceled.
    async fn append_step_output(&self, id: ResourceId, chunk: &str, seconds: i64)
    -> DbResult<()>;

    async fn delete_step_results(&self, job_id: ResourceId) -> DbResult<()>;

    async fn add_change_log(&self, job_id: ResourceId, message: &str) -> DbResult<()>;

    async fn change_log(&self, job_id: ResourceId) -> DbResult<Vec<ChangeLogEntry>>;
}

#[async_trait]
impl JobRepo for PgStore {
    async fn get_or_create_job(&self, new: &NewJob) -> DbResult<(Job, bool)> {
        let inserted = sqlx::query_as::<_, JobRecord>(
            r#"
            INSERT INTO jobs (id, event_id, recipe_id, config, status, active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (event_id, recipe_id, config) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(new.event_id.as_uuid())
        .bind(new.recipe_id.as_uuid())
        .bind(&new.config)
        .bind(new.status.to_string())
        .bind(new.active)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(record) = inserted {
            return Ok((record.try_into()?, true));
        }

        let existing = sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM jobs WHERE event_id = $1 AND recipe_id = $2 AND config = $3",
        )
        .bind(new.event_id.as_uuid())
        .bind(new.recipe_id.as_uuid())
        .bind(&new.config)
        .fetch_one(&self.pool)
        .await?;
        Ok((existing.try_into()?, false))
    }

    async fn get_job(&self, id: ResourceId) -> DbResult<Job> {
        sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?
            .try_into()
    }

    async fn jobs_for_event(&self, event_id: ResourceId) -> DbResult<Vec<Job>> {
        let records = sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM jobs WHERE event_id = $1 ORDER BY created_at, id",
        )
        .bind(event_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(Job::try_from).collect()
    }

    async fn update_job(&self, job: &Job) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                recipe_id = $2, status = $3, ready = $4, active = $5, complete = $6,
                invalidated = $7, same_client = $8, client_id = $9, seconds = $10,
                failed_step = $11, running_step = $12
            WHERE id = $1
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.recipe_id.as_uuid())
        .bind(job.status.to_string())
        .bind(job.ready)
        .bind(job.active)
        .bind(job.complete)
        .bind(job.invalidated)
        .bind(job.same_client)
        .bind(job.client_id.map(uuid::Uuid::from))
        .bind(job.seconds)
        .bind(&job.failed_step)
        .bind(&job.running_step)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("job {}", job.id)));
        }
        Ok(())
    }

    async fn mark_ready(&self, id: ResourceId) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET ready = TRUE WHERE id = $1 AND NOT ready AND active AND NOT complete",
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn ready_jobs(&self, build_key: &str) -> DbResult<Vec<ReadyRow>> {
        let records = sqlx::query_as::<_, ReadyRecord>(
            r#"
            SELECT j.*,
                   COALESCE((r.definition->>'priority')::INTEGER, 0) AS priority,
                   e.cause AS event_cause,
                   e.base_repository AS event_repository,
                   e.base_branch AS event_branch,
                   e.created_at AS event_created_at
            FROM jobs j
            JOIN events e ON e.id = j.event_id
            JOIN recipes r ON r.id = j.recipe_id
            WHERE e.build_key = $1
              AND j.status = 'NOT_STARTED' AND j.active AND j.ready AND NOT j.complete
            ORDER BY priority DESC, j.created_at ASC
            "#,
        )
        .bind(build_key)
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(ReadyRow::try_from).collect()
    }

    async fn try_claim(
        &self,
        id: ResourceId,
        build_key: &str,
        config: &str,
        client_id: ResourceId,
    ) -> DbResult<Option<Job>> {
        sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE jobs SET status = 'RUNNING', client_id = $3
            WHERE id = $1
              AND config = $2
              AND status = 'NOT_STARTED' AND active AND ready AND NOT complete
              AND NOT (invalidated AND same_client AND client_id IS NOT NULL AND client_id <> $3)
              AND event_id IN (SELECT id FROM events WHERE build_key = $4)
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(config)
        .bind(client_id.as_uuid())
        .bind(build_key)
        .fetch_optional(&self.pool)
        .await?
        .map(Job::try_from)
        .transpose()
    }

    async fn release_claim(
        &self,
        id: ResourceId,
        client_id: ResourceId,
        previous_client: Option<ResourceId>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET status = 'NOT_STARTED', client_id = $3
            WHERE id = $1 AND status = 'RUNNING' AND client_id = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(client_id.as_uuid())
        .bind(previous_client.map(uuid::Uuid::from))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn running_jobs_for_client(&self, client_id: ResourceId) -> DbResult<Vec<Job>> {
        let records = sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM jobs WHERE client_id = $1 AND status = 'RUNNING' ORDER BY created_at",
        )
        .bind(client_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(Job::try_from).collect()
    }

    async fn set_job_progress(
        &self,
        id: ResourceId,
        seconds: i64,
        running_step: Option<&str>,
        failed_step: Option<&str>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET
                seconds = $2,
                running_step = COALESCE($3, running_step),
                failed_step = COALESCE(failed_step, $4)
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(seconds)
        .bind(running_step)
        .bind(failed_step)
        .execute(&self.pool)
        .await?;
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
        sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE jobs SET status = $3, complete = $4, seconds = $5, running_step = NULL
            WHERE id = $1 AND client_id = $2 AND status = 'RUNNING' AND NOT complete
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(client_id.as_uuid())
        .bind(status.to_string())
        .bind(complete)
        .bind(seconds)
        .fetch_optional(&self.pool)
        .await?
        .map(Job::try_from)
        .transpose()
    }

    async fn mark_job_canceled(&self, id: ResourceId) -> DbResult<Option<Job>> {
        sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE jobs SET status = 'CANCELED', complete = TRUE, running_step = NULL
            WHERE id = $1 AND NOT complete
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .map(Job::try_from)
        .transpose()
    }

    async fn cancel_step_results(&self, job_id: ResourceId) -> DbResult<u64> {
        let result = sqlx::query(
            "UPDATE step_results SET status = 'CANCELED' WHERE job_id = $1 AND NOT complete",
        )
        .bind(job_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn create_step_results(&self, results: &[StepResult]) -> DbResult<()> {
        let Some(first) = results.first() else {
            return Ok(());
        };

        let mut query_builder = sqlx::QueryBuilder::new(
            "INSERT INTO step_results (id, job_id, name, position, abort_on_failure, allowed_to_fail, status) ",
        );
        query_builder.push_values(results.iter(), |mut b, result| {
            b.push_bind(*result.id.as_uuid())
                .push_bind(*result.job_id.as_uuid())
                .push_bind(&result.name)
                .push_bind(result.position)
                .push_bind(result.abort_on_failure)
                .push_bind(result.allowed_to_fail)
                .push_bind(result.status.to_string());
        });

        query_builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| duplicate_on_conflict(e, format!("step results for job {}", first.job_id)))?;
        Ok(())
    }

    async fn get_step_result(&self, id: ResourceId) -> DbResult<StepResult> {
        sqlx::query_as::<_, StepResultRecord>("SELECT * FROM step_results WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("step result {}", id)))?
            .try_into()
    }

    async fn step_results_for_job(&self, job_id: ResourceId) -> DbResult<Vec<StepResult>> {
        let records = sqlx::query_as::<_, StepResultRecord>(
            "SELECT * FROM step_results WHERE job_id = $1 ORDER BY position",
        )
        .bind(job_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(StepResult::try_from).collect()
    }

    async fn update_step_result(&self, result: &StepResult) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE step_results SET
                exit_status = $2, status = $3, complete = $4, output = $5, seconds = $6
            WHERE id = $1
            "#,
        )
        .bind(result.id.as_uuid())
        .bind(result.exit_status)
        .bind(result.status.to_string())
        .bind(result.complete)
        .bind(&result.output)
        .bind(result.seconds)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_step_output(
        &self,
        id: ResourceId,
        chunk: &str,
        seconds: i64,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE step_results
            SET output = output || $2, seconds = $3,
                status = CASE WHEN status = 'CANCELED' THEN status ELSE 'RUNNING' END
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(chunk)
        .bind(seconds)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_step_results(&self, job_id: ResourceId) -> DbResult<()> {
        sqlx::query("DELETE FROM step_results WHERE job_id = $1")
            .bind(job_id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn add_change_log(&self, job_id: ResourceId, message: &str) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO job_change_log (id, job_id, message, created_at) VALUES ($1, $2, $3, NOW())",
        )
        .bind(uuid::Uuid::now_v7())
        .bind(job_id.as_uuid())
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn change_log(&self, job_id: ResourceId) -> DbResult<Vec<ChangeLogEntry>> {
        let records = sqlx::query_as::<_, ChangeLogRecord>(
            "SELECT job_id, message, created_at FROM job_change_log WHERE job_id = $1 ORDER BY created_at",
        )
        .bind(job_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        Ok(records
            .into_iter()
            .map(|r| ChangeLogEntry {
                job_id: ResourceId::from_uuid(r.job_id),
                message: r.message,
                created_at: r.created_at,
            })
            .collect())
    }
}
