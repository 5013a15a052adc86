//! In-memory doubles shared across unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::application::auth::{AuthClient, AuthError, TokenGrant};
use crate::application::executor::{
    HttpTransport, TransportError, UpstreamRequest, UpstreamResponse,
};
use crate::application::repos::{
    CacheRowsRepo, CharactersRepo, FailJobParams, JobsRepo, NewJob, QueueCounts, RepoError,
    UpdateTokensParams,
};
use crate::domain::entities::{CacheRow, CharacterRecord, JobRecord};
use crate::domain::types::JobState;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Cache rows

#[derive(Default)]
pub(crate) struct MemoryCacheRows {
    rows: Mutex<HashMap<String, CacheRow>>,
    fail_next: AtomicBool,
}

impl MemoryCacheRows {
    pub(crate) fn rows(&self) -> Vec<CacheRow> {
        lock(&self.rows).values().cloned().collect()
    }

    pub(crate) fn insert_raw(
        &self,
        key: &str,
        data: Value,
        etag: Option<&str>,
        expires_at: OffsetDateTime,
    ) {
        lock(&self.rows).insert(
            key.to_string(),
            CacheRow {
                cache_key: key.to_string(),
                data,
                etag: etag.map(str::to_string),
                expires_at,
                updated_at: OffsetDateTime::now_utc(),
            },
        );
    }

    pub(crate) fn clear(&self) {
        lock(&self.rows).clear();
    }

    /// Make the next repo call fail with a persistence error.
    pub(crate) fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    fn check_failure(&self) -> Result<(), RepoError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(RepoError::Persistence("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheRowsRepo for MemoryCacheRows {
    async fn find_row(&self, key: &str) -> Result<Option<CacheRow>, RepoError> {
        self.check_failure()?;
        Ok(lock(&self.rows).get(key).cloned())
    }

    async fn upsert_row(
        &self,
        key: &str,
        data: &Value,
        etag: Option<&str>,
        expires_at: OffsetDateTime,
    ) -> Result<(), RepoError> {
        self.check_failure()?;
        self.insert_raw(key, data.clone(), etag, expires_at);
        Ok(())
    }

    async fn delete_row(&self, key: &str) -> Result<bool, RepoError> {
        self.check_failure()?;
        Ok(lock(&self.rows).remove(key).is_some())
    }

    async fn delete_rows_like(&self, prefix: &str) -> Result<u64, RepoError> {
        self.check_failure()?;
        let mut rows = lock(&self.rows);
        let doomed: Vec<String> = rows
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        for key in &doomed {
            rows.remove(key);
        }
        Ok(doomed.len() as u64)
    }

    async fn delete_expired_rows(&self, now: OffsetDateTime) -> Result<u64, RepoError> {
        self.check_failure()?;
        let mut rows = lock(&self.rows);
        let before = rows.len();
        rows.retain(|_, row| !row.is_expired(now));
        Ok((before - rows.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// Jobs

#[derive(Default)]
pub(crate) struct MemoryJobs {
    jobs: Mutex<Vec<JobRecord>>,
    paused: Mutex<HashMap<String, bool>>,
}

impl MemoryJobs {
    pub(crate) fn all(&self) -> Vec<JobRecord> {
        lock(&self.jobs).clone()
    }
}

#[async_trait]
impl JobsRepo for MemoryJobs {
    async fn insert_job(&self, job: NewJob) -> Result<Uuid, RepoError> {
        let id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();
        let state = if job.run_at > now {
            JobState::Delayed
        } else {
            JobState::Waiting
        };
        lock(&self.jobs).push(JobRecord {
            id,
            queue: job.queue,
            kind: job.kind,
            payload: job.payload,
            priority: job.priority,
            state,
            attempts_made: 0,
            max_attempts: job.max_attempts,
            backoff: job.backoff,
            keep_completed: job.keep_completed,
            keep_failed: job.keep_failed,
            run_at: job.run_at,
            last_error: None,
            created_at: now,
            finished_at: None,
        });
        Ok(id)
    }

    async fn fetch_due_job(
        &self,
        queue: &str,
        now: OffsetDateTime,
    ) -> Result<Option<JobRecord>, RepoError> {
        if *lock(&self.paused).get(queue).unwrap_or(&false) {
            return Ok(None);
        }
        let mut jobs = lock(&self.jobs);
        let mut due: Vec<&mut JobRecord> = jobs
            .iter_mut()
            .filter(|job| {
                job.queue == queue
                    && matches!(job.state, JobState::Waiting | JobState::Delayed)
                    && job.run_at <= now
            })
            .collect();
        due.sort_by(|a, b| {
            b.priority
                .rank()
                .cmp(&a.priority.rank())
                .then(a.run_at.cmp(&b.run_at))
        });
        match due.into_iter().next() {
            Some(job) => {
                job.state = JobState::Active;
                Ok(Some(job.clone()))
            }
            None => Ok(None),
        }
    }

    async fn complete_job(&self, id: Uuid, finished_at: OffsetDateTime) -> Result<(), RepoError> {
        let mut jobs = lock(&self.jobs);
        let job = jobs
            .iter_mut()
            .find(|job| job.id == id)
            .ok_or(RepoError::NotFound)?;
        job.state = JobState::Completed;
        job.finished_at = Some(finished_at);
        Ok(())
    }

    async fn fail_job(&self, params: FailJobParams) -> Result<(), RepoError> {
        let mut jobs = lock(&self.jobs);
        let job = jobs
            .iter_mut()
            .find(|job| job.id == params.id)
            .ok_or(RepoError::NotFound)?;
        job.attempts_made = params.attempts_made;
        job.last_error = Some(params.error);
        match params.retry_at {
            Some(run_at) => {
                job.state = JobState::Delayed;
                job.run_at = run_at;
            }
            None => {
                job.state = JobState::Failed;
                job.finished_at = Some(OffsetDateTime::now_utc());
            }
        }
        Ok(())
    }

    async fn retry_job(&self, id: Uuid, run_at: OffsetDateTime) -> Result<bool, RepoError> {
        let mut jobs = lock(&self.jobs);
        match jobs
            .iter_mut()
            .find(|job| job.id == id && job.state == JobState::Failed)
        {
            Some(job) => {
                job.state = JobState::Waiting;
                job.run_at = run_at;
                job.finished_at = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove_job(&self, id: Uuid) -> Result<bool, RepoError> {
        let mut jobs = lock(&self.jobs);
        let before = jobs.len();
        jobs.retain(|job| job.id != id);
        Ok(jobs.len() < before)
    }

    async fn find_job(&self, id: Uuid) -> Result<Option<JobRecord>, RepoError> {
        Ok(lock(&self.jobs).iter().find(|job| job.id == id).cloned())
    }

    async fn list_jobs(
        &self,
        queue: &str,
        state: Option<JobState>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<JobRecord>, RepoError> {
        let jobs = lock(&self.jobs);
        let mut matching: Vec<JobRecord> = jobs
            .iter()
            .filter(|job| job.queue == queue && state.is_none_or(|s| job.state == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matching
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn count_jobs(&self, queue: &str) -> Result<QueueCounts, RepoError> {
        let paused = *lock(&self.paused).get(queue).unwrap_or(&false);
        let jobs = lock(&self.jobs);
        let mut counts = QueueCounts::default();
        for job in jobs.iter().filter(|job| job.queue == queue) {
            match job.state {
                JobState::Waiting if paused => counts.paused += 1,
                JobState::Waiting => counts.waiting += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
                JobState::Delayed => counts.delayed += 1,
                JobState::Paused => counts.paused += 1,
            }
        }
        Ok(counts)
    }

    async fn set_queue_paused(&self, queue: &str, paused: bool) -> Result<(), RepoError> {
        lock(&self.paused).insert(queue.to_string(), paused);
        Ok(())
    }

    async fn queue_paused(&self, queue: &str) -> Result<bool, RepoError> {
        Ok(*lock(&self.paused).get(queue).unwrap_or(&false))
    }

    async fn clean_jobs(
        &self,
        queue: &str,
        older_than: OffsetDateTime,
        state: Option<JobState>,
    ) -> Result<u64, RepoError> {
        let mut jobs = lock(&self.jobs);
        let before = jobs.len();
        jobs.retain(|job| {
            !(job.queue == queue
                && job.state.is_finished()
                && state.is_none_or(|s| job.state == s)
                && job.finished_at.is_some_and(|at| at < older_than))
        });
        Ok((before - jobs.len()) as u64)
    }

    async fn trim_finished(
        &self,
        queue: &str,
        state: JobState,
        keep: u32,
    ) -> Result<u64, RepoError> {
        let mut jobs = lock(&self.jobs);
        let mut finished: Vec<(Uuid, OffsetDateTime)> = jobs
            .iter()
            .filter(|job| job.queue == queue && job.state == state)
            .map(|job| (job.id, job.finished_at.unwrap_or(job.created_at)))
            .collect();
        finished.sort_by(|a, b| b.1.cmp(&a.1));
        let doomed: Vec<Uuid> = finished
            .into_iter()
            .skip(keep as usize)
            .map(|(id, _)| id)
            .collect();
        let before = jobs.len();
        jobs.retain(|job| !doomed.contains(&job.id));
        Ok((before - jobs.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// Characters

#[derive(Default)]
pub(crate) struct MemoryCharacters {
    records: Mutex<HashMap<i64, CharacterRecord>>,
}

impl MemoryCharacters {
    pub(crate) fn insert(&self, record: CharacterRecord) {
        lock(&self.records).insert(record.character_id, record);
    }

    pub(crate) fn get(&self, character_id: i64) -> Option<CharacterRecord> {
        lock(&self.records).get(&character_id).cloned()
    }
}

#[async_trait]
impl CharactersRepo for MemoryCharacters {
    async fn list_token_expiring(
        &self,
        before: OffsetDateTime,
    ) -> Result<Vec<CharacterRecord>, RepoError> {
        Ok(lock(&self.records)
            .values()
            .filter(|record| !record.reauth_required && record.token_expires_at <= before)
            .cloned()
            .collect())
    }

    async fn find_character(
        &self,
        character_id: i64,
    ) -> Result<Option<CharacterRecord>, RepoError> {
        Ok(lock(&self.records).get(&character_id).cloned())
    }

    async fn update_character_tokens(&self, params: UpdateTokensParams) -> Result<(), RepoError> {
        let mut records = lock(&self.records);
        let record = records
            .get_mut(&params.character_id)
            .ok_or(RepoError::NotFound)?;
        record.access_token = Some(params.access_token);
        record.refresh_token_enc = params.refresh_token_enc;
        record.token_expires_at = params.token_expires_at;
        record.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn set_reauth_required(
        &self,
        character_id: i64,
        required: bool,
    ) -> Result<(), RepoError> {
        let mut records = lock(&self.records);
        let record = records
            .get_mut(&character_id)
            .ok_or(RepoError::NotFound)?;
        record.reauth_required = required;
        record.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SSO

#[derive(Default)]
pub(crate) struct MockAuth {
    grants: Mutex<VecDeque<Result<TokenGrant, AuthError>>>,
    seen: Mutex<Vec<String>>,
}

impl MockAuth {
    pub(crate) fn push_grant(&self, grant: TokenGrant) {
        lock(&self.grants).push_back(Ok(grant));
    }

    pub(crate) fn push_err(&self, err: AuthError) {
        lock(&self.grants).push_back(Err(err));
    }

    pub(crate) fn refresh_tokens_seen(&self) -> Vec<String> {
        lock(&self.seen).clone()
    }
}

#[async_trait]
impl AuthClient for MockAuth {
    async fn refresh_grant(&self, refresh_token: &str) -> Result<TokenGrant, AuthError> {
        lock(&self.seen).push(refresh_token.to_string());
        lock(&self.grants)
            .pop_front()
            .unwrap_or(Err(AuthError::Network("no scripted grant".into())))
    }
}

// ---------------------------------------------------------------------------
// Transport

#[derive(Default)]
pub(crate) struct MockTransport {
    responses: Mutex<VecDeque<Result<UpstreamResponse, TransportError>>>,
    requests: Mutex<Vec<UpstreamRequest>>,
    call_count: AtomicUsize,
}

impl MockTransport {
    pub(crate) fn push_ok(&self, response: UpstreamResponse) {
        lock(&self.responses).push_back(Ok(response));
    }

    pub(crate) fn push_err(&self, err: TransportError) {
        lock(&self.responses).push_back(Err(err));
    }

    pub(crate) fn calls(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    pub(crate) fn last_request(&self) -> Option<UpstreamRequest> {
        lock(&self.requests).last().cloned()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn execute(&self, request: &UpstreamRequest) -> Result<UpstreamResponse, TransportError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        lock(&self.requests).push(request.clone());
        lock(&self.responses)
            .pop_front()
            .unwrap_or(Err(TransportError::Network(
                "no scripted response".into(),
            )))
    }
}
