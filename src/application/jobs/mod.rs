//! Asynchronous job pipeline: producer, worker pools and handlers.

pub mod maintenance;
pub mod queue;
pub mod refresh;
pub mod worker;

pub use maintenance::MaintenanceService;
pub use queue::{EnqueueOptions, JobQueue};
pub use refresh::{DEFAULT_EXPIRY_BUFFER, ScanSummary, TokenRefreshService};
pub use worker::{
    Dispatch, JobError, WorkerPool, WorkerPoolConfig, WorkerRegistry, WorkerStatus,
};

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::entities::JobRecord;
use crate::domain::types::JobPayload;

/// Routes claimed jobs to their handlers by payload kind. A payload that no
/// longer deserializes is terminal; retrying cannot fix a bad row.
pub struct JobDispatcher {
    refresh: Arc<TokenRefreshService>,
    maintenance: Arc<MaintenanceService>,
}

impl JobDispatcher {
    pub fn new(refresh: Arc<TokenRefreshService>, maintenance: Arc<MaintenanceService>) -> Self {
        Self {
            refresh,
            maintenance,
        }
    }
}

#[async_trait]
impl Dispatch for JobDispatcher {
    async fn dispatch(&self, job: &JobRecord) -> Result<(), JobError> {
        let payload: JobPayload = serde_json::from_value(job.payload.clone())
            .map_err(|err| JobError::Terminal(format!("undecodable job payload: {err}")))?;

        match payload {
            JobPayload::RefreshToken { character_id } => {
                self.refresh.refresh_character(character_id).await
            }
            JobPayload::SweepExpiredCache => {
                self.maintenance.sweep_expired_cache().await;
                Ok(())
            }
            JobPayload::InvalidateCache { prefix } => {
                self.maintenance.invalidate_cache(&prefix).await;
                Ok(())
            }
        }
    }
}
