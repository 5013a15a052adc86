//! Response cache manager coordinating the fast and durable tiers.

use std::collections::BTreeMap;
use std::sync::Arc;

use metrics::counter;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::application::repos::CacheRowsRepo;
use crate::domain::entities::{CacheEntry, CacheRow};

use super::config::CacheConfig;
use super::fast::FastCache;
use super::keys;

const TARGET: &str = "esigate::cache";

/// Result of an executor-side lookup. A stale hit carries the previous
/// payload and ETag so the request can be revalidated with `If-None-Match`.
#[derive(Debug)]
pub enum Lookup {
    Fresh(CacheEntry),
    Stale(StaleEntry),
    Miss,
}

#[derive(Debug)]
pub struct StaleEntry {
    pub payload: Value,
    pub etag: Option<String>,
}

pub struct ResponseCache {
    fast: Option<Arc<FastCache>>,
    store: Arc<dyn CacheRowsRepo>,
    config: CacheConfig,
}

impl ResponseCache {
    pub fn new(config: CacheConfig, store: Arc<dyn CacheRowsRepo>) -> Self {
        let fast = config
            .enable_fast_tier
            .then(|| Arc::new(FastCache::new(&config)));
        Self { fast, store, config }
    }

    /// Derive the cache key for an endpoint and its parameters.
    pub fn key(&self, endpoint: &str, params: &BTreeMap<String, String>) -> String {
        keys::cache_key(endpoint, params)
    }

    /// Fresh-only read path. Expired fast entries are deleted on read;
    /// expired durable rows are deleted and reported as a miss. A valid
    /// durable hit repopulates the fast tier with the remaining TTL.
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        let now = OffsetDateTime::now_utc();

        if let Some(fast) = &self.fast
            && let Some(entry) = fast.get(key, now)
        {
            counter!("esigate_cache_fast_hit_total").increment(1);
            debug!(target: TARGET, key, tier = "fast", "cache hit");
            return Some(entry);
        }

        let row = match self.store.find_row(key).await {
            Ok(row) => row,
            Err(err) => {
                warn!(target: TARGET, key, error = %err, "durable cache read failed, treating as miss");
                return None;
            }
        };

        match row {
            Some(row) if !row.is_expired(now) => {
                counter!("esigate_cache_store_hit_total").increment(1);
                debug!(target: TARGET, key, tier = "store", "cache hit");
                let entry = entry_from_row(row);
                if let Some(fast) = &self.fast {
                    fast.set(key.to_string(), entry.clone());
                }
                Some(entry)
            }
            Some(_) => {
                counter!("esigate_cache_expired_total").increment(1);
                debug!(target: TARGET, key, "expired durable row deleted on read");
                if let Err(err) = self.store.delete_row(key).await {
                    warn!(target: TARGET, key, error = %err, "failed to delete expired row");
                }
                None
            }
            None => {
                counter!("esigate_cache_miss_total").increment(1);
                debug!(target: TARGET, key, "cache miss");
                None
            }
        }
    }

    /// Executor read path: like `get`, but an expired durable row is kept in
    /// place and surfaced as `Stale` so its ETag can drive a conditional
    /// request. The row is overwritten on revalidation or removed by sweep.
    pub async fn lookup(&self, key: &str) -> Lookup {
        let now = OffsetDateTime::now_utc();

        if let Some(fast) = &self.fast
            && let Some(entry) = fast.get(key, now)
        {
            counter!("esigate_cache_fast_hit_total").increment(1);
            return Lookup::Fresh(entry);
        }

        let row = match self.store.find_row(key).await {
            Ok(row) => row,
            Err(err) => {
                warn!(target: TARGET, key, error = %err, "durable cache read failed, treating as miss");
                return Lookup::Miss;
            }
        };

        match row {
            Some(row) if !row.is_expired(now) => {
                counter!("esigate_cache_store_hit_total").increment(1);
                let entry = entry_from_row(row);
                if let Some(fast) = &self.fast {
                    fast.set(key.to_string(), entry.clone());
                }
                Lookup::Fresh(entry)
            }
            Some(row) => {
                counter!("esigate_cache_stale_total").increment(1);
                debug!(target: TARGET, key, "stale durable row retained for revalidation");
                Lookup::Stale(StaleEntry {
                    payload: row.data,
                    etag: row.etag,
                })
            }
            None => {
                counter!("esigate_cache_miss_total").increment(1);
                Lookup::Miss
            }
        }
    }

    /// Write-through set. A payload whose expiry is not in the future is not
    /// cached at all. Durable-store write failures are logged and absorbed;
    /// the caller already has the payload in hand.
    pub async fn set(
        &self,
        key: &str,
        payload: Value,
        expires_at: OffsetDateTime,
        etag: Option<String>,
    ) {
        let now = OffsetDateTime::now_utc();
        if expires_at <= now {
            debug!(target: TARGET, key, "skipping cache write with non-positive ttl");
            return;
        }

        let entry = CacheEntry {
            payload,
            expires_at,
            etag,
        };

        if let Some(fast) = &self.fast {
            fast.set(key.to_string(), entry.clone());
        }

        if let Err(err) = self
            .store
            .upsert_row(key, &entry.payload, entry.etag.as_deref(), expires_at)
            .await
        {
            warn!(target: TARGET, key, error = %err, "durable cache write failed, skipping");
        }
    }

    /// Point invalidation across both tiers.
    pub async fn delete(&self, key: &str) {
        if let Some(fast) = &self.fast {
            fast.delete(key);
        }
        if let Err(err) = self.store.delete_row(key).await {
            warn!(target: TARGET, key, error = %err, "durable cache delete failed");
        }
    }

    /// Prefix invalidation across both tiers. A trailing `*` from
    /// operator-supplied patterns is stripped before matching.
    pub async fn delete_prefix(&self, pattern: &str) -> u64 {
        let prefix = pattern.trim_end_matches('*');

        let mut removed = 0;
        if let Some(fast) = &self.fast {
            removed += fast.delete_prefix(prefix);
        }
        match self.store.delete_rows_like(prefix).await {
            Ok(count) => removed += count,
            Err(err) => {
                warn!(target: TARGET, prefix, error = %err, "durable prefix delete failed");
            }
        }
        debug!(target: TARGET, prefix, removed, "prefix invalidation");
        removed
    }

    /// Expiry resolution: `max-age` from Cache-Control wins, then a parseable
    /// `Expires` header, then the configured default TTL.
    pub fn calculate_expiration(
        &self,
        cache_control: Option<&str>,
        expires: Option<&str>,
    ) -> OffsetDateTime {
        let now = OffsetDateTime::now_utc();

        if let Some(value) = cache_control
            && let Some(max_age) = parse_max_age(value)
        {
            return now + time::Duration::seconds(max_age);
        }

        if let Some(value) = expires
            && let Some(at) = parse_http_date(value)
        {
            return at;
        }

        now + self.config.default_ttl
    }

    /// Delete every durable row already past its expiry. Idempotent.
    pub async fn sweep_expired(&self) -> u64 {
        let now = OffsetDateTime::now_utc();
        match self.store.delete_expired_rows(now).await {
            Ok(count) => {
                if count > 0 {
                    debug!(target: TARGET, count, "swept expired cache rows");
                }
                counter!("esigate_cache_swept_total").increment(count);
                count
            }
            Err(err) => {
                warn!(target: TARGET, error = %err, "expired-row sweep failed");
                0
            }
        }
    }
}

fn entry_from_row(row: CacheRow) -> CacheEntry {
    CacheEntry {
        payload: row.data,
        expires_at: row.expires_at,
        etag: row.etag,
    }
}

fn parse_max_age(cache_control: &str) -> Option<i64> {
    cache_control.split(',').find_map(|directive| {
        let directive = directive.trim();
        let seconds = directive.strip_prefix("max-age=")?;
        seconds.trim().parse::<i64>().ok()
    })
}

/// HTTP dates are RFC 7231 IMF-fixdate, which chrono's RFC 2822 parser
/// accepts (including the `GMT` zone name).
pub(crate) fn parse_http_date(value: &str) -> Option<OffsetDateTime> {
    let parsed = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    OffsetDateTime::from_unix_timestamp(parsed.timestamp()).ok()
}
