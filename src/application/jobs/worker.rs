//! Worker pool: claims due jobs, dispatches them, settles outcomes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use metrics::counter;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::application::repos::{FailJobParams, JobsRepo};
use crate::domain::entities::JobRecord;
use crate::domain::types::JobState;

const TARGET: &str = "esigate::jobs";

/// Handler verdict on a failed job. Retryable failures reschedule under the
/// job's backoff policy until attempts run out; terminal failures park the
/// job as failed immediately.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0}")]
    Terminal(String),
    #[error("{0}")]
    Retryable(String),
}

#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, job: &JobRecord) -> Result<(), JobError>;
}

/// Liveness registry for spawned worker pools, surfaced through the admin
/// health report.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, WorkerStatus>>,
}

#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub queue: String,
    pub concurrency: usize,
    pub started_at: OffsetDateTime,
    pub last_heartbeat: OffsetDateTime,
}

impl WorkerRegistry {
    pub fn register(&self, queue: &str, concurrency: usize) {
        let now = OffsetDateTime::now_utc();
        self.write("register").insert(
            queue.to_string(),
            WorkerStatus {
                queue: queue.to_string(),
                concurrency,
                started_at: now,
                last_heartbeat: now,
            },
        );
    }

    pub fn heartbeat(&self, queue: &str) {
        if let Some(status) = self.write("heartbeat").get_mut(queue) {
            status.last_heartbeat = OffsetDateTime::now_utc();
        }
    }

    pub fn snapshot(&self) -> Vec<WorkerStatus> {
        let mut statuses: Vec<WorkerStatus> = self.read("snapshot").values().cloned().collect();
        statuses.sort_by(|a, b| a.queue.cmp(&b.queue));
        statuses
    }

    /// A registry is healthy while every registered pool has polled within
    /// `stale_after`.
    pub fn is_healthy(&self, stale_after: Duration) -> bool {
        let cutoff = OffsetDateTime::now_utc() - stale_after;
        self.read("is_healthy")
            .values()
            .all(|status| status.last_heartbeat >= cutoff)
    }

    fn read(&self, op: &'static str) -> std::sync::RwLockReadGuard<'_, HashMap<String, WorkerStatus>> {
        match self.workers.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(op, lock_kind = "rwlock.read", result = "poisoned_recovered", "Recovered from poisoned registry lock");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self, op: &'static str) -> std::sync::RwLockWriteGuard<'_, HashMap<String, WorkerStatus>> {
        match self.workers.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(op, lock_kind = "rwlock.write", result = "poisoned_recovered", "Recovered from poisoned registry lock");
                poisoned.into_inner()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub queue: String,
    pub concurrency: usize,
    pub poll_interval: Duration,
}

pub struct WorkerPool {
    config: WorkerPoolConfig,
    jobs: Arc<dyn JobsRepo>,
    dispatcher: Arc<dyn Dispatch>,
    registry: Arc<WorkerRegistry>,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        jobs: Arc<dyn JobsRepo>,
        dispatcher: Arc<dyn Dispatch>,
        registry: Arc<WorkerRegistry>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            config,
            jobs,
            dispatcher,
            registry,
            permits,
        }
    }

    /// Spawn the polling loop. The returned handle is aborted at shutdown.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        self.registry
            .register(&self.config.queue, self.config.concurrency);
        info!(
            target: TARGET,
            queue = %self.config.queue,
            concurrency = self.config.concurrency,
            "worker pool started"
        );
        tokio::spawn(async move {
            loop {
                match self.claim_and_spawn().await {
                    Ok(true) => {}
                    Ok(false) => tokio::time::sleep(self.config.poll_interval).await,
                    Err(err) => {
                        error!(target: TARGET, queue = %self.config.queue, error = %err, "poll failed");
                        tokio::time::sleep(self.config.poll_interval).await;
                    }
                }
            }
        })
    }

    /// Claim one due job and process it on a fresh task, bounded by the
    /// concurrency semaphore. Returns whether a job was claimed.
    async fn claim_and_spawn(self: &Arc<Self>) -> Result<bool, crate::application::repos::RepoError> {
        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            // The semaphore is never closed while the pool lives.
            Err(_) => return Ok(false),
        };

        self.registry.heartbeat(&self.config.queue);
        match self
            .jobs
            .fetch_due_job(&self.config.queue, OffsetDateTime::now_utc())
            .await?
        {
            Some(job) => {
                let pool = self.clone();
                tokio::spawn(async move {
                    pool.process(job).await;
                    drop(permit);
                });
                Ok(true)
            }
            None => {
                drop(permit);
                Ok(false)
            }
        }
    }

    /// Single-shot claim-and-process for tests and one-shot CLI paths.
    /// Returns whether a job was processed.
    pub async fn poll_once(&self) -> bool {
        self.registry.heartbeat(&self.config.queue);
        let claimed = self
            .jobs
            .fetch_due_job(&self.config.queue, OffsetDateTime::now_utc())
            .await;
        match claimed {
            Ok(Some(job)) => {
                self.process(job).await;
                true
            }
            Ok(None) => false,
            Err(err) => {
                error!(target: TARGET, queue = %self.config.queue, error = %err, "poll failed");
                false
            }
        }
    }

    async fn process(&self, job: JobRecord) {
        let attempt = job.attempts_made + 1;
        debug!(target: TARGET, id = %job.id, kind = %job.kind, attempt, "job started");

        // A panicking handler must not take the pool down with it.
        let outcome = std::panic::AssertUnwindSafe(self.dispatcher.dispatch(&job))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(JobError::Retryable("job handler panicked".into())));

        match outcome {
            Ok(()) => self.settle_success(&job).await,
            Err(err) => self.settle_failure(&job, attempt, err).await,
        }
    }

    async fn settle_success(&self, job: &JobRecord) {
        counter!("esigate_jobs_completed_total", "queue" => self.config.queue.clone()).increment(1);
        if let Err(err) = self
            .jobs
            .complete_job(job.id, OffsetDateTime::now_utc())
            .await
        {
            error!(target: TARGET, id = %job.id, error = %err, "failed to mark job completed");
            return;
        }
        debug!(target: TARGET, id = %job.id, kind = %job.kind, "job completed");
        self.trim(JobState::Completed, job.keep_completed).await;
    }

    async fn settle_failure(&self, job: &JobRecord, attempt: i32, err: JobError) {
        let retry_at = match &err {
            JobError::Retryable(_) if attempt < job.max_attempts => {
                Some(OffsetDateTime::now_utc() + job.backoff.delay_for(attempt))
            }
            _ => None,
        };

        let params = FailJobParams {
            id: job.id,
            error: err.to_string(),
            attempts_made: attempt,
            retry_at,
        };
        let rescheduled = params.retry_at.is_some();
        if let Err(repo_err) = self.jobs.fail_job(params).await {
            error!(target: TARGET, id = %job.id, error = %repo_err, "failed to record job failure");
            return;
        }

        if rescheduled {
            counter!("esigate_jobs_retried_total", "queue" => self.config.queue.clone())
                .increment(1);
            warn!(
                target: TARGET,
                id = %job.id,
                kind = %job.kind,
                attempt,
                max_attempts = job.max_attempts,
                error = %err,
                "job attempt failed, rescheduled"
            );
        } else {
            counter!("esigate_jobs_failed_total", "queue" => self.config.queue.clone())
                .increment(1);
            error!(
                target: TARGET,
                id = %job.id,
                kind = %job.kind,
                attempt,
                error = %err,
                "job failed permanently"
            );
            self.trim(JobState::Failed, job.keep_failed).await;
        }
    }

    async fn trim(&self, state: JobState, keep: u32) {
        match self
            .jobs
            .trim_finished(&self.config.queue, state, keep)
            .await
        {
            Ok(0) => {}
            Ok(removed) => {
                debug!(target: TARGET, queue = %self.config.queue, state = state.as_str(), removed, "trimmed finished jobs");
            }
            Err(err) => {
                warn!(target: TARGET, queue = %self.config.queue, error = %err, "retention trim failed");
            }
        }
    }
}
