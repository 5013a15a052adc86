use std::convert::TryFrom;

use async_trait::async_trait;
use sqlx::QueryBuilder;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::application::repos::{
    FailJobParams, JobsRepo, NewJob, QueueCounts, RepoError,
};
use crate::domain::entities::JobRecord;
use crate::domain::types::{BackoffPolicy, JobPriority, JobState};

use super::{PostgresRepositories, map_sqlx_error};

const JOB_COLUMNS: &str = "id, queue, kind, payload, priority, state, attempts_made, \
     max_attempts, backoff, keep_completed, keep_failed, run_at, last_error, \
     created_at, finished_at";

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    queue: String,
    kind: String,
    payload: serde_json::Value,
    priority: i32,
    state: String,
    attempts_made: i32,
    max_attempts: i32,
    backoff: serde_json::Value,
    keep_completed: i32,
    keep_failed: i32,
    run_at: OffsetDateTime,
    last_error: Option<String>,
    created_at: OffsetDateTime,
    finished_at: Option<OffsetDateTime>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = RepoError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let state = JobState::try_from(row.state.as_str())
            .map_err(|err| RepoError::from_persistence(err.to_string()))?;
        let backoff: BackoffPolicy = serde_json::from_value(row.backoff).map_err(|err| {
            RepoError::from_persistence(format!("undecodable backoff policy: {err}"))
        })?;

        Ok(Self {
            id: row.id,
            queue: row.queue,
            kind: row.kind,
            payload: row.payload,
            priority: JobPriority::from_rank(row.priority),
            state,
            attempts_made: row.attempts_made,
            max_attempts: row.max_attempts,
            backoff,
            keep_completed: row.keep_completed.max(0) as u32,
            keep_failed: row.keep_failed.max(0) as u32,
            run_at: row.run_at,
            last_error: row.last_error,
            created_at: row.created_at,
            finished_at: row.finished_at,
        })
    }
}

#[async_trait]
impl JobsRepo for PostgresRepositories {
    async fn insert_job(&self, job: NewJob) -> Result<Uuid, RepoError> {
        let backoff = serde_json::to_value(job.backoff)
            .map_err(|err| RepoError::from_persistence(format!("unserializable backoff: {err}")))?;

        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO gateway_jobs
                (queue, kind, payload, priority, state, max_attempts, backoff,
                 keep_completed, keep_failed, run_at)
            VALUES ($1, $2, $3, $4,
                    CASE WHEN $9 > now() THEN 'delayed' ELSE 'waiting' END,
                    $5, $6, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(&job.queue)
        .bind(&job.kind)
        .bind(&job.payload)
        .bind(job.priority.rank())
        .bind(job.max_attempts)
        .bind(backoff)
        .bind(job.keep_completed as i32)
        .bind(job.keep_failed as i32)
        .bind(job.run_at)
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(id)
    }

    async fn fetch_due_job(
        &self,
        queue: &str,
        now: OffsetDateTime,
    ) -> Result<Option<JobRecord>, RepoError> {
        if self.queue_paused(queue).await? {
            return Ok(None);
        }

        // SKIP LOCKED keeps concurrent pools from claiming the same row.
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            WITH claimed AS (
                SELECT id
                  FROM gateway_jobs
                 WHERE queue = $1
                   AND state IN ('waiting', 'delayed')
                   AND run_at <= $2
                 ORDER BY priority DESC, run_at ASC
                 FOR UPDATE SKIP LOCKED
                 LIMIT 1
            )
            UPDATE gateway_jobs j
               SET state = 'active'
              FROM claimed
             WHERE j.id = claimed.id
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(queue)
        .bind(now)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        row.map(JobRecord::try_from).transpose()
    }

    async fn complete_job(&self, id: Uuid, finished_at: OffsetDateTime) -> Result<(), RepoError> {
        sqlx::query(
            "UPDATE gateway_jobs SET state = 'completed', finished_at = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(finished_at)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn fail_job(&self, params: FailJobParams) -> Result<(), RepoError> {
        match params.retry_at {
            Some(run_at) => {
                sqlx::query(
                    r#"
                    UPDATE gateway_jobs
                       SET state = 'delayed',
                           run_at = $2,
                           attempts_made = $3,
                           last_error = $4
                     WHERE id = $1
                    "#,
                )
                .bind(params.id)
                .bind(run_at)
                .bind(params.attempts_made)
                .bind(&params.error)
                .execute(self.pool())
                .await
                .map_err(map_sqlx_error)?;
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE gateway_jobs
                       SET state = 'failed',
                           attempts_made = $2,
                           last_error = $3,
                           finished_at = now()
                     WHERE id = $1
                    "#,
                )
                .bind(params.id)
                .bind(params.attempts_made)
                .bind(&params.error)
                .execute(self.pool())
                .await
                .map_err(map_sqlx_error)?;
            }
        }
        Ok(())
    }

    async fn retry_job(&self, id: Uuid, run_at: OffsetDateTime) -> Result<bool, RepoError> {
        let result = sqlx::query(
            r#"
            UPDATE gateway_jobs
               SET state = 'waiting', run_at = $2, finished_at = NULL
             WHERE id = $1 AND state = 'failed'
            "#,
        )
        .bind(id)
        .bind(run_at)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn remove_job(&self, id: Uuid) -> Result<bool, RepoError> {
        let result = sqlx::query("DELETE FROM gateway_jobs WHERE id = $1")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_job(&self, id: Uuid) -> Result<Option<JobRecord>, RepoError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM gateway_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        row.map(JobRecord::try_from).transpose()
    }

    async fn list_jobs(
        &self,
        queue: &str,
        state: Option<JobState>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<JobRecord>, RepoError> {
        let mut qb = QueryBuilder::new(format!(
            "SELECT {JOB_COLUMNS} FROM gateway_jobs WHERE queue = "
        ));
        qb.push_bind(queue);

        if let Some(state) = state {
            qb.push(" AND state = ");
            qb.push_bind(state.as_str());
        }

        qb.push(" ORDER BY created_at DESC LIMIT ");
        qb.push_bind(i64::from(limit));
        qb.push(" OFFSET ");
        qb.push_bind(i64::from(offset));

        let rows = qb
            .build_query_as::<JobRow>()
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(JobRecord::try_from(row)?);
        }
        Ok(records)
    }

    async fn count_jobs(&self, queue: &str) -> Result<QueueCounts, RepoError> {
        let paused = self.queue_paused(queue).await?;

        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT state, COUNT(*) FROM gateway_jobs WHERE queue = $1 GROUP BY state",
        )
        .bind(queue)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        let mut counts = QueueCounts::default();
        for (state, count) in rows {
            let count = count.max(0) as u64;
            match state.as_str() {
                "waiting" if paused => counts.paused += count,
                "waiting" => counts.waiting += count,
                "active" => counts.active += count,
                "completed" => counts.completed += count,
                "failed" => counts.failed += count,
                "delayed" => counts.delayed += count,
                "paused" => counts.paused += count,
                other => {
                    return Err(RepoError::from_persistence(format!(
                        "unknown job state `{other}`"
                    )));
                }
            }
        }
        Ok(counts)
    }

    async fn set_queue_paused(&self, queue: &str, paused: bool) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            INSERT INTO queue_control (queue, paused, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (queue) DO UPDATE
               SET paused = EXCLUDED.paused, updated_at = now()
            "#,
        )
        .bind(queue)
        .bind(paused)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn queue_paused(&self, queue: &str) -> Result<bool, RepoError> {
        let row: Option<(bool,)> =
            sqlx::query_as("SELECT paused FROM queue_control WHERE queue = $1")
                .bind(queue)
                .fetch_optional(self.pool())
                .await
                .map_err(map_sqlx_error)?;

        Ok(row.is_some_and(|(paused,)| paused))
    }

    async fn clean_jobs(
        &self,
        queue: &str,
        older_than: OffsetDateTime,
        state: Option<JobState>,
    ) -> Result<u64, RepoError> {
        let mut qb = QueryBuilder::new("DELETE FROM gateway_jobs WHERE queue = ");
        qb.push_bind(queue);
        qb.push(" AND finished_at IS NOT NULL AND finished_at < ");
        qb.push_bind(older_than);
        match state {
            Some(state) => {
                qb.push(" AND state = ");
                qb.push_bind(state.as_str());
            }
            None => {
                qb.push(" AND state IN ('completed', 'failed')");
            }
        }

        let result = qb
            .build()
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(result.rows_affected())
    }

    async fn trim_finished(
        &self,
        queue: &str,
        state: JobState,
        keep: u32,
    ) -> Result<u64, RepoError> {
        let result = sqlx::query(
            r#"
            DELETE FROM gateway_jobs
             WHERE id IN (
                SELECT id
                  FROM gateway_jobs
                 WHERE queue = $1 AND state = $2
                 ORDER BY finished_at DESC NULLS LAST
                OFFSET $3
             )
            "#,
        )
        .bind(queue)
        .bind(state.as_str())
        .bind(i64::from(keep))
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected())
    }
}
