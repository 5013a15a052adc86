//! In-process fast tier: LRU keyed map with per-entry expiry.

use std::sync::RwLock;

use lru::LruCache;
use time::OffsetDateTime;
use tracing::warn;

use crate::domain::entities::CacheEntry;

use super::config::CacheConfig;

pub struct FastCache {
    entries: RwLock<LruCache<String, CacheEntry>>,
}

impl FastCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(config.fast_entry_limit_non_zero())),
        }
    }

    /// Fetch an entry, deleting it in place when already expired.
    pub fn get(&self, key: &str, now: OffsetDateTime) -> Option<CacheEntry> {
        let mut entries = self.write("get");
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.clone()),
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, key: String, entry: CacheEntry) {
        self.write("set").put(key, entry);
    }

    pub fn delete(&self, key: &str) -> bool {
        self.write("delete").pop(key).is_some()
    }

    /// Remove every entry whose key starts with `prefix`; returns the count.
    pub fn delete_prefix(&self, prefix: &str) -> u64 {
        let mut entries = self.write("delete_prefix");
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        doomed.len() as u64
    }

    pub fn len(&self) -> usize {
        self.write("len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write(&self, op: &'static str) -> std::sync::RwLockWriteGuard<'_, LruCache<String, CacheEntry>> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(
                    op,
                    lock_kind = "rwlock.write",
                    result = "poisoned_recovered",
                    "Recovered from poisoned fast-cache lock"
                );
                poisoned.into_inner()
            }
        }
    }
}
