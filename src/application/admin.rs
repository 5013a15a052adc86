//! Operator facade over queues, schedules and the refresh pipeline.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use crate::application::error::AppError;
use crate::application::jobs::{TokenRefreshService, WorkerRegistry, WorkerStatus};
use crate::application::repos::{JobsRepo, QueueCounts};
use crate::application::scheduler::{ScheduleSummary, Scheduler};
use crate::domain::entities::JobRecord;
use crate::domain::types::{JobState, queues};

const TARGET: &str = "esigate::admin";

const MAX_PAGE_SIZE: u32 = 500;

/// Worker pools are unhealthy after this long without a poll.
const WORKER_STALE_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct QueueHealth {
    pub queue: String,
    pub paused: bool,
    pub counts: QueueCounts,
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub workers_healthy: bool,
    pub workers: Vec<WorkerStatus>,
    pub queues: Vec<QueueHealth>,
    pub schedules: Vec<ScheduleSummary>,
}

pub struct AdminService {
    jobs: Arc<dyn JobsRepo>,
    registry: Arc<WorkerRegistry>,
    scheduler: Arc<Scheduler>,
    refresh: Arc<TokenRefreshService>,
}

impl AdminService {
    pub fn new(
        jobs: Arc<dyn JobsRepo>,
        registry: Arc<WorkerRegistry>,
        scheduler: Arc<Scheduler>,
        refresh: Arc<TokenRefreshService>,
    ) -> Self {
        Self {
            jobs,
            registry,
            scheduler,
            refresh,
        }
    }

    pub async fn health(&self) -> Result<HealthReport, AppError> {
        let mut queue_health = Vec::with_capacity(queues::ALL.len());
        for queue in queues::ALL {
            queue_health.push(QueueHealth {
                queue: queue.to_string(),
                paused: self.jobs.queue_paused(queue).await?,
                counts: self.jobs.count_jobs(queue).await?,
            });
        }
        Ok(HealthReport {
            workers_healthy: self.registry.is_healthy(WORKER_STALE_AFTER),
            workers: self.registry.snapshot(),
            queues: queue_health,
            schedules: self.scheduler.summary(),
        })
    }

    pub async fn queue_counts(&self, queue: &str) -> Result<QueueCounts, AppError> {
        Self::known_queue(queue)?;
        Ok(self.jobs.count_jobs(queue).await?)
    }

    pub async fn list_jobs(
        &self,
        queue: &str,
        state: Option<JobState>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<JobRecord>, AppError> {
        Self::known_queue(queue)?;
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        Ok(self.jobs.list_jobs(queue, state, limit, offset).await?)
    }

    /// Put a failed job back on the queue for an immediate attempt.
    pub async fn retry_job(&self, id: Uuid) -> Result<(), AppError> {
        if !self.jobs.retry_job(id, OffsetDateTime::now_utc()).await? {
            return Err(AppError::NotFound);
        }
        info!(target: TARGET, %id, "job requeued by operator");
        Ok(())
    }

    pub async fn remove_job(&self, id: Uuid) -> Result<(), AppError> {
        if !self.jobs.remove_job(id).await? {
            return Err(AppError::NotFound);
        }
        info!(target: TARGET, %id, "job removed by operator");
        Ok(())
    }

    /// Stop dispatch on a queue. Already-active jobs run to completion.
    pub async fn pause_queue(&self, queue: &str) -> Result<(), AppError> {
        Self::known_queue(queue)?;
        self.jobs.set_queue_paused(queue, true).await?;
        info!(target: TARGET, queue, "queue paused");
        Ok(())
    }

    pub async fn resume_queue(&self, queue: &str) -> Result<(), AppError> {
        Self::known_queue(queue)?;
        self.jobs.set_queue_paused(queue, false).await?;
        info!(target: TARGET, queue, "queue resumed");
        Ok(())
    }

    /// Bulk-delete finished jobs older than `grace`, optionally limited to
    /// one finished state.
    pub async fn clean_queue(
        &self,
        queue: &str,
        grace: Duration,
        state: Option<JobState>,
    ) -> Result<u64, AppError> {
        Self::known_queue(queue)?;
        if let Some(state) = state
            && !state.is_finished()
        {
            return Err(AppError::validation(format!(
                "cannot clean live jobs in state `{}`",
                state.as_str()
            )));
        }
        let older_than = OffsetDateTime::now_utc() - grace;
        let removed = self.jobs.clean_jobs(queue, older_than, state).await?;
        info!(target: TARGET, queue, removed, "queue cleaned");
        Ok(removed)
    }

    pub fn schedules(&self) -> Vec<ScheduleSummary> {
        self.scheduler.summary()
    }

    pub fn start_schedule(&self, name: &str) -> Result<bool, AppError> {
        self.scheduler.start(name)
    }

    pub fn stop_schedule(&self, name: &str) -> Result<(), AppError> {
        if !self.scheduler.stop(name) {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    /// Queue an immediate token refresh for one character.
    pub async fn trigger_refresh(&self, character_id: i64) -> Result<Uuid, AppError> {
        let id = self.refresh.trigger_now(character_id).await?;
        info!(target: TARGET, character_id, job_id = %id, "manual refresh queued");
        Ok(id)
    }

    fn known_queue(queue: &str) -> Result<(), AppError> {
        if queues::ALL.contains(&queue) {
            Ok(())
        } else {
            Err(AppError::validation(format!("unknown queue `{queue}`")))
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::application::auth::PassthroughCipher;
    use crate::application::jobs::{
        DEFAULT_EXPIRY_BUFFER, EnqueueOptions, JobQueue,
    };
    use crate::domain::types::{JobPayload, JobPriority};
    use crate::test_support::{MemoryCharacters, MemoryJobs, MockAuth};

    use super::*;

    struct Fixture {
        jobs: Arc<MemoryJobs>,
        queue: Arc<JobQueue>,
        admin: AdminService,
    }

    fn fixture() -> Fixture {
        let jobs = Arc::new(MemoryJobs::default());
        let queue = Arc::new(JobQueue::new(jobs.clone()));
        let refresh = Arc::new(TokenRefreshService::new(
            Arc::new(MemoryCharacters::default()),
            Arc::new(MockAuth::default()),
            Arc::new(PassthroughCipher),
            queue.clone(),
            DEFAULT_EXPIRY_BUFFER,
        ));
        let admin = AdminService::new(
            jobs.clone(),
            Arc::new(WorkerRegistry::default()),
            Arc::new(Scheduler::default()),
            refresh,
        );
        Fixture { jobs, queue, admin }
    }

    #[tokio::test]
    async fn unknown_queue_is_rejected() {
        let fx = fixture();
        let err = fx.admin.queue_counts("no-such-queue").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn paused_queue_reports_waiting_as_paused() {
        let fx = fixture();
        fx.queue
            .enqueue(
                JobPayload::SweepExpiredCache,
                EnqueueOptions::priority(JobPriority::Normal),
            )
            .await
            .expect("enqueue");

        fx.admin.pause_queue(queues::MAINTENANCE).await.expect("pause");
        let counts = fx.admin.queue_counts(queues::MAINTENANCE).await.unwrap();
        assert_eq!(counts.paused, 1);
        assert_eq!(counts.waiting, 0);

        fx.admin
            .resume_queue(queues::MAINTENANCE)
            .await
            .expect("resume");
        let counts = fx.admin.queue_counts(queues::MAINTENANCE).await.unwrap();
        assert_eq!(counts.waiting, 1);
        assert_eq!(counts.paused, 0);
    }

    #[tokio::test]
    async fn retry_requeues_only_failed_jobs() {
        let fx = fixture();
        let id = fx
            .queue
            .enqueue(
                JobPayload::SweepExpiredCache,
                EnqueueOptions::priority(JobPriority::Normal),
            )
            .await
            .expect("enqueue");

        // Still waiting, not failed.
        let err = fx.admin.retry_job(id).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound));

        fx.jobs
            .fail_job(crate::application::repos::FailJobParams {
                id,
                error: "boom".into(),
                attempts_made: 1,
                retry_at: None,
            })
            .await
            .unwrap();

        fx.admin.retry_job(id).await.expect("retry");
        let job = fx.jobs.find_job(id).await.unwrap().expect("job");
        assert_eq!(job.state, JobState::Waiting);
    }

    #[tokio::test]
    async fn clean_rejects_live_states() {
        let fx = fixture();
        let err = fx
            .admin
            .clean_queue(queues::REFRESH, Duration::from_secs(0), Some(JobState::Waiting))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn clean_removes_old_finished_jobs() {
        let fx = fixture();
        let id = fx
            .queue
            .enqueue(
                JobPayload::SweepExpiredCache,
                EnqueueOptions::priority(JobPriority::Normal),
            )
            .await
            .expect("enqueue");
        fx.jobs
            .complete_job(id, OffsetDateTime::now_utc() - time::Duration::hours(2))
            .await
            .unwrap();

        let removed = fx
            .admin
            .clean_queue(queues::MAINTENANCE, Duration::from_secs(3600), None)
            .await
            .expect("clean");
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn health_reports_all_known_queues() {
        let fx = fixture();
        let report = fx.admin.health().await.expect("health");
        assert_eq!(report.queues.len(), queues::ALL.len());
        // No pools registered: vacuously healthy.
        assert!(report.workers_healthy);
    }

    #[tokio::test]
    async fn trigger_refresh_enqueues_critical_job() {
        let fx = fixture();
        fx.admin.trigger_refresh(42).await.expect("trigger");
        let jobs = fx.jobs.all();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].priority, JobPriority::Critical);
    }
}
