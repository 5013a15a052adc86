//! Repository traits describing persistence adapters.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::domain::entities::{CacheRow, CharacterRecord, JobRecord};
use crate::domain::types::{BackoffPolicy, JobPriority, JobState};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// Narrow interface over durable cache rows: get-by-key, upsert, delete,
/// delete-matching-fragment, delete-expired.
#[async_trait]
pub trait CacheRowsRepo: Send + Sync {
    async fn find_row(&self, key: &str) -> Result<Option<CacheRow>, RepoError>;

    async fn upsert_row(
        &self,
        key: &str,
        data: &Value,
        etag: Option<&str>,
        expires_at: OffsetDateTime,
    ) -> Result<(), RepoError>;

    async fn delete_row(&self, key: &str) -> Result<bool, RepoError>;

    /// Delete every row whose key starts with `prefix`. Returns the number
    /// of rows removed.
    async fn delete_rows_like(&self, prefix: &str) -> Result<u64, RepoError>;

    async fn delete_expired_rows(&self, now: OffsetDateTime) -> Result<u64, RepoError>;
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub queue: String,
    pub kind: String,
    pub payload: Value,
    pub priority: JobPriority,
    pub max_attempts: i32,
    pub backoff: BackoffPolicy,
    pub keep_completed: u32,
    pub keep_failed: u32,
    pub run_at: OffsetDateTime,
}

/// Outcome parameters for a failed attempt. `retry_at = Some(..)` reschedules
/// the job as delayed; `None` marks it failed for operator inspection.
#[derive(Debug, Clone)]
pub struct FailJobParams {
    pub id: Uuid,
    pub error: String,
    pub attempts_made: i32,
    pub retry_at: Option<OffsetDateTime>,
}

/// Aggregated per-queue job counts for introspection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub paused: u64,
}

#[async_trait]
pub trait JobsRepo: Send + Sync {
    async fn insert_job(&self, job: NewJob) -> Result<Uuid, RepoError>;

    /// Claim the next due job in `queue`: waiting or delayed with
    /// `run_at <= now`, highest priority first, oldest `run_at` first.
    /// Returns `None` when the queue is empty or paused. The claimed job is
    /// marked active; only the claiming worker mutates it afterwards.
    async fn fetch_due_job(
        &self,
        queue: &str,
        now: OffsetDateTime,
    ) -> Result<Option<JobRecord>, RepoError>;

    async fn complete_job(&self, id: Uuid, finished_at: OffsetDateTime) -> Result<(), RepoError>;

    async fn fail_job(&self, params: FailJobParams) -> Result<(), RepoError>;

    /// Reset a failed job to waiting, preserving its error history.
    async fn retry_job(&self, id: Uuid, run_at: OffsetDateTime) -> Result<bool, RepoError>;

    async fn remove_job(&self, id: Uuid) -> Result<bool, RepoError>;

    async fn find_job(&self, id: Uuid) -> Result<Option<JobRecord>, RepoError>;

    async fn list_jobs(
        &self,
        queue: &str,
        state: Option<JobState>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<JobRecord>, RepoError>;

    async fn count_jobs(&self, queue: &str) -> Result<QueueCounts, RepoError>;

    async fn set_queue_paused(&self, queue: &str, paused: bool) -> Result<(), RepoError>;

    async fn queue_paused(&self, queue: &str) -> Result<bool, RepoError>;

    /// Bulk-delete finished jobs older than `older_than`, optionally limited
    /// to one state. Returns the number of jobs removed.
    async fn clean_jobs(
        &self,
        queue: &str,
        older_than: OffsetDateTime,
        state: Option<JobState>,
    ) -> Result<u64, RepoError>;

    /// Keep only the newest `keep` finished jobs in `state`; delete the rest.
    async fn trim_finished(
        &self,
        queue: &str,
        state: JobState,
        keep: u32,
    ) -> Result<u64, RepoError>;
}

#[derive(Debug, Clone)]
pub struct UpdateTokensParams {
    pub character_id: i64,
    pub access_token: String,
    pub refresh_token_enc: String,
    pub token_expires_at: OffsetDateTime,
}

#[async_trait]
pub trait CharactersRepo: Send + Sync {
    /// Characters whose credentials expire at or before `before`, excluding
    /// those already flagged for reauthorization.
    async fn list_token_expiring(
        &self,
        before: OffsetDateTime,
    ) -> Result<Vec<CharacterRecord>, RepoError>;

    async fn find_character(&self, character_id: i64)
    -> Result<Option<CharacterRecord>, RepoError>;

    async fn update_character_tokens(&self, params: UpdateTokensParams) -> Result<(), RepoError>;

    async fn set_reauth_required(
        &self,
        character_id: i64,
        required: bool,
    ) -> Result<(), RepoError>;
}
