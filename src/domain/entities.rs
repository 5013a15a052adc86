//! Persisted records shared across the application and infra layers.

use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::domain::types::{BackoffPolicy, JobPriority, JobState};

/// Durable cache row, authoritative second tier of the response cache.
/// Rows are swept explicitly; `expires_at` is advisory until then.
#[derive(Debug, Clone)]
pub struct CacheRow {
    pub cache_key: String,
    pub data: Value,
    pub etag: Option<String>,
    pub expires_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl CacheRow {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at <= now
    }
}

/// A fresh cache entry handed to callers. Never expired at hand-off time.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub payload: Value,
    pub expires_at: OffsetDateTime,
    pub etag: Option<String>,
}

/// A queued unit of asynchronous work.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: Uuid,
    pub queue: String,
    pub kind: String,
    pub payload: Value,
    pub priority: JobPriority,
    pub state: JobState,
    pub attempts_made: i32,
    pub max_attempts: i32,
    pub backoff: BackoffPolicy,
    pub keep_completed: u32,
    pub keep_failed: u32,
    pub run_at: OffsetDateTime,
    pub last_error: Option<String>,
    pub created_at: OffsetDateTime,
    pub finished_at: Option<OffsetDateTime>,
}

/// Character credential record. Owned by the auth collaborator; the gateway
/// reads expiry and writes refreshed tokens through `CharactersRepo` only.
#[derive(Debug, Clone)]
pub struct CharacterRecord {
    pub character_id: i64,
    pub name: String,
    pub refresh_token_enc: String,
    pub access_token: Option<String>,
    pub token_expires_at: OffsetDateTime,
    pub reauth_required: bool,
    pub updated_at: OffsetDateTime,
}
