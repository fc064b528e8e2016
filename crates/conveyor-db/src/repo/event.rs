//! Event, pull request and branch repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::event::{BranchStatus, CommitRef, Event, NewEvent, PullRequestStatus};
use conveyor_core::{ResourceId, Status};

use super::PgStore;
use crate::{DbError, DbResult};

#[derive(Debug, Clone, sqlx::FromRow)]
struct EventRecord {
    id: uuid::Uuid,
    cause: String,
    build_user: String,
    build_key: String,
    base_repository: String,
    base_branch: String,
    base_sha: String,
    base_ssh_url: String,
    head_repository: String,
    head_branch: String,
    head_sha: String,
    head_ssh_url: String,
    pr_number: Option<i64>,
    trigger_user: String,
    comments_url: Option<String>,
    description: String,
    duplicates: i32,
    status: String,
    complete: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<EventRecord> for Event {
    type Error = DbError;

    fn try_from(r: EventRecord) -> DbResult<Self> {
        Ok(Event {
            id: ResourceId::from_uuid(r.id),
            cause: r.cause.parse()?,
            build_user: r.build_user,
            build_key: r.build_key,
            base: CommitRef {
                repository: r.base_repository,
                branch: r.base_branch,
                sha: r.base_sha,
                ssh_url: r.base_ssh_url,
            },
            head: CommitRef {
                repository: r.head_repository,
                branch: r.head_branch,
                sha: r.head_sha,
                ssh_url: r.head_ssh_url,
            },
            pr_number: r.pr_number,
            trigger_user: r.trigger_user,
            comments_url: r.comments_url,
            description: r.description,
            duplicates: r.duplicates,
            status: r.status.parse()?,
            complete: r.complete,
            created_at: r.created_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct PullRequestRecord {
    repository: String,
    number: i64,
    title: String,
    status: String,
    closed: bool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct BranchRecord {
    repository: String,
    branch: String,
    status: String,
}

#[async_trait]
pub trait EventRepo: Send + Sync {
    /// Insert the event unless one already exists for the same build user,
    /// cause, commit pair and duplicate counter. Returns the event and
    /// whether it was created by this call.
    async fn get_or_create_event(
        &self,
        new: &NewEvent,
        duplicates: i32,
    ) -> DbResult<(Event, bool)>;

    /// Highest duplicate counter used for this commit pair so far.
    async fn latest_duplicate(&self, new: &NewEvent) -> DbResult<Option<i32>>;

    async fn get_event(&self, id: ResourceId) -> DbResult<Event>;

    async fn set_event_status(&self, id: ResourceId, status: Status, complete: bool)
    -> DbResult<()>;

    /// Every event of a pull request, oldest first.
    async fn events_for_pull_request(&self, repository: &str, number: i64)
    -> DbResult<Vec<Event>>;

    /// Every push event on a branch, oldest first.
    async fn push_events_for_branch(&self, repository: &str, branch: &str)
    -> DbResult<Vec<Event>>;

    async fn upsert_pull_request(&self, repository: &str, number: i64, title: &str)
    -> DbResult<()>;

    async fn close_pull_request(&self, repository: &str, number: i64) -> DbResult<()>;

    async fn set_pr_status(&self, repository: &str, number: i64, status: Status) -> DbResult<()>;

    async fn get_pull_request(
        &self,
        repository: &str,
        number: i64,
    ) -> DbResult<Option<PullRequestStatus>>;

    async fn set_branch_status(&self, repository: &str, branch: &str, status: Status)
    -> DbResult<()>;

    async fn get_branch(&self, repository: &str, branch: &str) -> DbResult<Option<BranchStatus>>;
}

#[async_trait]
impl EventRepo for PgStore {
    async fn get_or_create_event(
        &self,
        new: &NewEvent,
        duplicates: i32,
    ) -> DbResult<(Event, bool)> {
        let inserted = sqlx::query_as::<_, EventRecord>(
            r#"
            INSERT INTO events (
                id, cause, build_user, build_key,
                base_repository, base_branch, base_sha, base_ssh_url,
                head_repository, head_branch, head_sha, head_ssh_url,
                pr_number, trigger_user, comments_url, description, duplicates,
                status, complete, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    'NOT_STARTED', FALSE, NOW())
            ON CONFLICT DO NOTHING
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(new.cause.to_string())
        .bind(&new.build_user)
        .bind(&new.build_key)
        .bind(&new.base.repository)
        .bind(&new.base.branch)
        .bind(&new.base.sha)
        .bind(&new.base.ssh_url)
        .bind(&new.head.repository)
        .bind(&new.head.branch)
        .bind(&new.head.sha)
        .bind(&new.head.ssh_url)
        .bind(new.pull_request.as_ref().map(|pr| pr.number))
        .bind(&new.trigger_user)
        .bind(&new.comments_url)
        .bind(&new.description)
        .bind(duplicates)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(record) = inserted {
            return Ok((record.try_into()?, true));
        }

        let existing = sqlx::query_as::<_, EventRecord>(
            r#"
            SELECT * FROM events
            WHERE build_user = $1 AND cause = $2
              AND base_repository = $3 AND base_branch = $4 AND base_sha = $5
              AND head_repository = $6 AND head_branch = $7 AND head_sha = $8
              AND duplicates = $9
            "#,
        )
        .bind(&new.build_user)
        .bind(new.cause.to_string())
        .bind(&new.base.repository)
        .bind(&new.base.branch)
        .bind(&new.base.sha)
        .bind(&new.head.repository)
        .bind(&new.head.branch)
        .bind(&new.head.sha)
        .bind(duplicates)
        .fetch_one(&self.pool)
        .await?;
        Ok((existing.try_into()?, false))
    }

    async fn latest_duplicate(&self, new: &NewEvent) -> DbResult<Option<i32>> {
        let max: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT MAX(duplicates) FROM events
            WHERE build_user = $1 AND cause = $2
              AND base_repository = $3 AND base_branch = $4 AND base_sha = $5
              AND head_repository = $6 AND head_branch = $7 AND head_sha = $8
            "#,
        )
        .bind(&new.build_user)
        .bind(new.cause.to_string())
        .bind(&new.base.repository)
        .bind(&new.base.branch)
        .bind(&new.base.sha)
        .bind(&new.head.repository)
        .bind(&new.head.branch)
        .bind(&new.head.sha)
        .fetch_one(&self.pool)
        .await?;
        Ok(max)
    }

    async fn get_event(&self, id: ResourceId) -> DbResult<Event> {
        sqlx::query_as::<_, EventRecord>("SELECT * FROM events WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("event {}", id)))?
            .try_into()
    }

    async fn set_event_status(
        &self,
        id: ResourceId,
        status: Status,
        complete: bool,
    ) -> DbResult<()> {
        sqlx::query("UPDATE events SET status = $2, complete = $3 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(status.to_string())
            .bind(complete)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn events_for_pull_request(
        &self,
        repository: &str,
        number: i64,
    ) -> DbResult<Vec<Event>> {
        let records = sqlx::query_as::<_, EventRecord>(
            r#"
            SELECT * FROM events
            WHERE base_repository = $1 AND pr_number = $2
            ORDER BY created_at
            "#,
        )
        .bind(repository)
        .bind(number)
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(Event::try_from).collect()
    }

    async fn push_events_for_branch(
        &self,
        repository: &str,
        branch: &str,
    ) -> DbResult<Vec<Event>> {
        let records = sqlx::query_as::<_, EventRecord>(
            r#"
            SELECT * FROM events
            WHERE base_repository = $1 AND base_branch = $2 AND cause = 'push'
            ORDER BY created_at
            "#,
        )
        .bind(repository)
        .bind(branch)
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(Event::try_from).collect()
    }

    async fn upsert_pull_request(
        &self,
        repository: &str,
        number: i64,
        title: &str,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pull_requests (repository, number, title)
            VALUES ($1, $2, $3)
            ON CONFLICT (repository, number)
            DO UPDATE SET title = EXCLUDED.title, closed = FALSE
            "#,
        )
        .bind(repository)
        .bind(number)
        .bind(title)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn close_pull_request(&self, repository: &str, number: i64) -> DbResult<()> {
        sqlx::query("UPDATE pull_requests SET closed = TRUE WHERE repository = $1 AND number = $2")
            .bind(repository)
            .bind(number)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_pr_status(&self, repository: &str, number: i64, status: Status) -> DbResult<()> {
        sqlx::query("UPDATE pull_requests SET status = $3 WHERE repository = $1 AND number = $2")
            .bind(repository)
            .bind(number)
            .bind(status.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_pull_request(
        &self,
        repository: &str,
        number: i64,
    ) -> DbResult<Option<PullRequestStatus>> {
        let record = sqlx::query_as::<_, PullRequestRecord>(
            "SELECT * FROM pull_requests WHERE repository = $1 AND number = $2",
        )
        .bind(repository)
        .bind(number)
        .fetch_optional(&self.pool)
        .await?;

        record
            .map(|r| {
                Ok::<_, DbError>(PullRequestStatus {
                    repository: r.repository,
                    number: r.number,
                    title: r.title,
                    status: r.status.parse()?,
                    closed: r.closed,
                })
            })
            .transpose()
    }

    async fn set_branch_status(
        &self,
        repository: &str,
        branch: &str,
        status: Status,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO branches (repository, branch, status)
            VALUES ($1, $2, $3)
            ON CONFLICT (repository, branch) DO UPDATE SET status = EXCLUDED.status
            "#,
        )
        .bind(repository)
        .bind(branch)
        .bind(status.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_branch(&self, repository: &str, branch: &str) -> DbResult<Option<BranchStatus>> {
        let record = sqlx::query_as::<_, BranchRecord>(
            "SELECT * FROM branches WHERE repository = $1 AND branch = $2",
        )
        .bind(repository)
        .bind(branch)
        .fetch_optional(&self.pool)
        .await?;

        record
            .map(|r| {
                Ok::<_, DbError>(BranchStatus {
                    repository: r.repository,
                    branch: r.branch,
                    status: r.status.parse()?,
                })
            })
            .transpose()
    }
}
