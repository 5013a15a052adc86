//! Job producer: payload routing, tier defaults and enqueue.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use crate::application::error::AppError;
use crate::application::repos::{JobsRepo, NewJob};
use crate::domain::types::{BackoffPolicy, JobPayload, JobPriority};

/// Producer-side knobs. Anything left `None` falls back to the priority
/// tier's defaults.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: JobPriority,
    pub max_attempts: Option<i32>,
    pub backoff: Option<BackoffPolicy>,
    pub keep_completed: Option<u32>,
    pub keep_failed: Option<u32>,
    pub delay: Option<Duration>,
}

impl EnqueueOptions {
    pub fn priority(priority: JobPriority) -> Self {
        Self {
            priority,
            ..Default::default()
        }
    }
}

pub struct JobQueue {
    jobs: Arc<dyn JobsRepo>,
}

impl JobQueue {
    pub fn new(jobs: Arc<dyn JobsRepo>) -> Self {
        Self { jobs }
    }

    /// Enqueue a payload on its designated queue. Tier defaults fill in any
    /// option the producer did not set; a delay schedules the job as delayed.
    pub async fn enqueue(
        &self,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<Uuid, AppError> {
        let defaults = options.priority.default_options();
        let run_at = OffsetDateTime::now_utc()
            + options.delay.unwrap_or(Duration::ZERO);

        let queue = payload.queue();
        let kind = payload.kind();
        let body = serde_json::to_value(&payload)
            .map_err(|err| AppError::unexpected(format!("unserializable payload: {err}")))?;

        let id = self
            .jobs
            .insert_job(NewJob {
                queue: queue.to_string(),
                kind: kind.to_string(),
                payload: body,
                priority: options.priority,
                max_attempts: options.max_attempts.unwrap_or(defaults.max_attempts),
                backoff: options.backoff.unwrap_or(defaults.backoff),
                keep_completed: options.keep_completed.unwrap_or(defaults.keep_completed),
                keep_failed: options.keep_failed.unwrap_or(defaults.keep_failed),
                run_at,
            })
            .await?;

        counter!("esigate_jobs_enqueued_total", "queue" => queue, "kind" => kind).increment(1);
        debug!(
            target: "esigate::jobs",
            %id,
            queue,
            kind,
            priority = options.priority.as_str(),
            "job enqueued"
        );
        Ok(id)
    }
}
