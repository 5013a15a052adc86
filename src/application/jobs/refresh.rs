//! Proactive SSO token refresh orchestration.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::application::auth::{AuthClient, AuthError, TokenCipher};
use crate::application::error::AppError;
use crate::application::jobs::queue::{EnqueueOptions, JobQueue};
use crate::application::jobs::worker::JobError;
use crate::application::repos::{CharactersRepo, UpdateTokensParams};
use crate::domain::types::{JobPayload, JobPriority};

const TARGET: &str = "esigate::refresh";

/// How far ahead of expiry the periodic scan refreshes tokens.
pub const DEFAULT_EXPIRY_BUFFER: Duration = Duration::from_secs(300);

/// Attempt cap for scan-enqueued refresh jobs, tighter than the HIGH tier
/// default.
const SCAN_MAX_ATTEMPTS: i32 = 3;

#[derive(Debug, Clone, Copy, Default)]
pub struct ScanSummary {
    pub total: usize,
    pub queued: usize,
    pub failed: usize,
}

pub struct TokenRefreshService {
    characters: Arc<dyn CharactersRepo>,
    auth: Arc<dyn AuthClient>,
    cipher: Arc<dyn TokenCipher>,
    queue: Arc<JobQueue>,
    expiry_buffer: Duration,
}

impl TokenRefreshService {
    pub fn new(
        characters: Arc<dyn CharactersRepo>,
        auth: Arc<dyn AuthClient>,
        cipher: Arc<dyn TokenCipher>,
        queue: Arc<JobQueue>,
        expiry_buffer: Duration,
    ) -> Self {
        Self {
            characters,
            auth,
            cipher,
            queue,
            expiry_buffer,
        }
    }

    /// Periodic scan: enqueue a refresh job for every character whose token
    /// expires within the buffer. One bad enqueue never aborts the scan.
    /// Scan jobs carry at most 3 attempts; the HIGH tier keeps its 2s
    /// exponential backoff.
    pub async fn scan_and_enqueue(&self) -> Result<ScanSummary, AppError> {
        let before = OffsetDateTime::now_utc() + self.expiry_buffer;
        let expiring = self.characters.list_token_expiring(before).await?;

        let mut summary = ScanSummary {
            total: expiring.len(),
            ..Default::default()
        };
        for character in &expiring {
            let enqueued = self
                .queue
                .enqueue(
                    JobPayload::RefreshToken {
                        character_id: character.character_id,
                    },
                    EnqueueOptions {
                        priority: JobPriority::High,
                        max_attempts: Some(SCAN_MAX_ATTEMPTS),
                        ..Default::default()
                    },
                )
                .await;
            match enqueued {
                Ok(_) => summary.queued += 1,
                Err(err) => {
                    summary.failed += 1;
                    warn!(
                        target: TARGET,
                        character_id = character.character_id,
                        error = %err,
                        "failed to enqueue refresh"
                    );
                }
            }
        }

        counter!("esigate_refresh_scans_total").increment(1);
        info!(
            target: TARGET,
            total = summary.total,
            queued = summary.queued,
            failed = summary.failed,
            "token refresh scan"
        );
        Ok(summary)
    }

    /// Operator-triggered refresh: jumps the queue at critical priority.
    pub async fn trigger_now(&self, character_id: i64) -> Result<Uuid, AppError> {
        self.queue
            .enqueue(
                JobPayload::RefreshToken { character_id },
                EnqueueOptions::priority(JobPriority::Critical),
            )
            .await
    }

    /// Worker-side refresh of a single character's credentials.
    ///
    /// Re-checks expiry first so a job that raced a successful refresh is a
    /// no-op. An `invalid_grant` flags the character for re-authorization
    /// and is terminal; upstream and network trouble are retryable.
    pub async fn refresh_character(&self, character_id: i64) -> Result<(), JobError> {
        let record = self
            .characters
            .find_character(character_id)
            .await
            .map_err(|err| JobError::Retryable(err.to_string()))?
            .ok_or_else(|| JobError::Terminal(format!("unknown character {character_id}")))?;

        if record.token_expires_at > OffsetDateTime::now_utc() + self.expiry_buffer {
            info!(target: TARGET, character_id, "token already fresh, skipping");
            return Ok(());
        }

        let refresh_token = self
            .cipher
            .decrypt(&record.refresh_token_enc)
            .map_err(|err| JobError::Terminal(format!("cannot decrypt refresh token: {err}")))?;

        let grant = match self.auth.refresh_grant(&refresh_token).await {
            Ok(grant) => grant,
            Err(AuthError::InvalidGrant { message }) => {
                warn!(target: TARGET, character_id, %message, "refresh grant invalid, flagging for reauthorization");
                counter!("esigate_refresh_total", "outcome" => "invalid_grant").increment(1);
                if let Err(err) = self.characters.set_reauth_required(character_id, true).await {
                    warn!(target: TARGET, character_id, error = %err, "failed to persist reauth flag");
                }
                return Err(JobError::Terminal(format!(
                    "refresh grant rejected: {message}"
                )));
            }
            Err(err @ (AuthError::Upstream { .. } | AuthError::Network(_))) => {
                counter!("esigate_refresh_total", "outcome" => "transient").increment(1);
                return Err(JobError::Retryable(err.to_string()));
            }
        };

        let refresh_token_enc = self
            .cipher
            .encrypt(&grant.refresh_token)
            .map_err(|err| JobError::Terminal(format!("cannot encrypt refresh token: {err}")))?;

        self.characters
            .update_character_tokens(UpdateTokensParams {
                character_id,
                access_token: grant.access_token,
                refresh_token_enc,
                token_expires_at: OffsetDateTime::now_utc()
                    + Duration::from_secs(u64::from(grant.expires_in)),
            })
            .await
            .map_err(|err| JobError::Retryable(err.to_string()))?;

        counter!("esigate_refresh_total", "outcome" => "refreshed").increment(1);
        info!(target: TARGET, character_id, "token refreshed");
        Ok(())
    }
}
