//! Shared domain enumerations aligned with persisted database values.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::error::DomainError;

/// Lifecycle states of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
    Paused,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Delayed => "delayed",
            JobState::Paused => "paused",
        }
    }

    /// Completed and failed jobs are finished; everything else is live.
    pub fn is_finished(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl TryFrom<&str> for JobState {
    type Error = DomainError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "waiting" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "delayed" => Ok(JobState::Delayed),
            "paused" => Ok(JobState::Paused),
            other => Err(DomainError::validation(format!(
                "unknown job state `{other}`"
            ))),
        }
    }
}

/// Dispatch priority tiers. Higher rank is dispatched first within a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Batch,
    Low,
    Normal,
    High,
    Critical,
}

impl Default for JobPriority {
    fn default() -> Self {
        JobPriority::Normal
    }
}

impl JobPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            JobPriority::Critical => "critical",
            JobPriority::High => "high",
            JobPriority::Normal => "normal",
            JobPriority::Low => "low",
            JobPriority::Batch => "batch",
        }
    }

    /// Numeric rank persisted to the jobs table; dispatch orders descending.
    pub fn rank(self) -> i32 {
        match self {
            JobPriority::Critical => 4,
            JobPriority::High => 3,
            JobPriority::Normal => 2,
            JobPriority::Low => 1,
            JobPriority::Batch => 0,
        }
    }

    pub fn from_rank(rank: i32) -> Self {
        match rank {
            4 => JobPriority::Critical,
            3 => JobPriority::High,
            2 => JobPriority::Normal,
            1 => JobPriority::Low,
            _ => JobPriority::Batch,
        }
    }

    /// Per-tier defaults applied when a producer does not override them.
    pub fn default_options(self) -> TierDefaults {
        match self {
            JobPriority::Critical => TierDefaults {
                max_attempts: 5,
                backoff: BackoffPolicy::Exponential { initial_ms: 1_000 },
                keep_completed: 100,
                keep_failed: 500,
            },
            JobPriority::High => TierDefaults {
                max_attempts: 4,
                backoff: BackoffPolicy::Exponential { initial_ms: 2_000 },
                keep_completed: 50,
                keep_failed: 500,
            },
            JobPriority::Normal => TierDefaults {
                max_attempts: 3,
                backoff: BackoffPolicy::Exponential { initial_ms: 5_000 },
                keep_completed: 25,
                keep_failed: 500,
            },
            JobPriority::Low => TierDefaults {
                max_attempts: 2,
                backoff: BackoffPolicy::Fixed { delay_ms: 10_000 },
                keep_completed: 10,
                keep_failed: 500,
            },
            JobPriority::Batch => TierDefaults {
                max_attempts: 1,
                backoff: BackoffPolicy::Fixed { delay_ms: 30_000 },
                keep_completed: 5,
                keep_failed: 500,
            },
        }
    }
}

/// Resolved per-tier job option defaults.
#[derive(Debug, Clone, Copy)]
pub struct TierDefaults {
    pub max_attempts: i32,
    pub backoff: BackoffPolicy,
    pub keep_completed: u32,
    pub keep_failed: u32,
}

/// Delay schedule applied between failed attempts of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    Exponential { initial_ms: u64 },
    Fixed { delay_ms: u64 },
}

impl BackoffPolicy {
    /// Delay before the next attempt, given how many attempts have been made
    /// (1-based: the first retry follows attempt 1).
    pub fn delay_for(self, attempts_made: i32) -> Duration {
        match self {
            BackoffPolicy::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            BackoffPolicy::Exponential { initial_ms } => {
                let exponent = attempts_made.saturating_sub(1).clamp(0, 20) as u32;
                Duration::from_millis(initial_ms.saturating_mul(1u64 << exponent))
            }
        }
    }
}

/// Tagged payload carried by a job, dispatched via pattern matching in the
/// worker. Adding a variant requires a matching arm in the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    RefreshToken { character_id: i64 },
    SweepExpiredCache,
    InvalidateCache { prefix: String },
}

impl JobPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            JobPayload::RefreshToken { .. } => "refresh_token",
            JobPayload::SweepExpiredCache => "sweep_expired_cache",
            JobPayload::InvalidateCache { .. } => "invalidate_cache",
        }
    }

    /// Queue this payload is routed to.
    pub fn queue(&self) -> &'static str {
        match self {
            JobPayload::RefreshToken { .. } => queues::REFRESH,
            JobPayload::SweepExpiredCache | JobPayload::InvalidateCache { .. } => {
                queues::MAINTENANCE
            }
        }
    }
}

/// Well-known queue names.
pub mod queues {
    pub const REFRESH: &str = "refresh";
    pub const MAINTENANCE: &str = "maintenance";

    pub const ALL: &[&str] = &[REFRESH, MAINTENANCE];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_parses_persisted_values() {
        assert!(matches!(JobState::try_from("delayed"), Ok(JobState::Delayed)));
        assert!(matches!(JobState::try_from("paused"), Ok(JobState::Paused)));

        let err = JobState::try_from("zombie").unwrap_err();
        assert!(err.to_string().contains("zombie"));
    }

    #[test]
    fn priority_rank_roundtrip() {
        for priority in [
            JobPriority::Critical,
            JobPriority::High,
            JobPriority::Normal,
            JobPriority::Low,
            JobPriority::Batch,
        ] {
            assert_eq!(JobPriority::from_rank(priority.rank()), priority);
        }
        assert!(JobPriority::Critical > JobPriority::Batch);
    }

    #[test]
    fn tier_defaults_follow_priority() {
        let critical = JobPriority::Critical.default_options();
        assert_eq!(critical.max_attempts, 5);
        assert_eq!(
            critical.backoff,
            BackoffPolicy::Exponential { initial_ms: 1_000 }
        );
        assert_eq!(critical.keep_completed, 100);

        let batch = JobPriority::Batch.default_options();
        assert_eq!(batch.max_attempts, 1);
        assert_eq!(batch.backoff, BackoffPolicy::Fixed { delay_ms: 30_000 });
        assert_eq!(batch.keep_completed, 5);
    }

    #[test]
    fn exponential_backoff_doubles() {
        let policy = BackoffPolicy::Exponential { initial_ms: 2_000 };
        assert_eq!(policy.delay_for(1), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(4_000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(8_000));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = BackoffPolicy::Fixed { delay_ms: 10_000 };
        assert_eq!(policy.delay_for(1), policy.delay_for(5));
    }

    #[test]
    fn payload_serde_uses_kind_tag() {
        let payload = JobPayload::RefreshToken { character_id: 42 };
        let value = serde_json::to_value(&payload).expect("serialize payload");
        assert_eq!(value["kind"], "refresh_token");
        assert_eq!(value["character_id"], 42);

        let back: JobPayload = serde_json::from_value(value).expect("deserialize payload");
        assert_eq!(back, payload);
    }

    #[test]
    fn payload_queue_routing() {
        assert_eq!(
            JobPayload::RefreshToken { character_id: 1 }.queue(),
            queues::REFRESH
        );
        assert_eq!(JobPayload::SweepExpiredCache.queue(), queues::MAINTENANCE);
    }
}
