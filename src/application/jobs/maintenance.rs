//! Cache maintenance handlers run from the maintenance queue.

use std::sync::Arc;

use metrics::counter;
use tracing::info;

use crate::cache::ResponseCache;

const TARGET: &str = "esigate::maintenance";

pub struct MaintenanceService {
    cache: Arc<ResponseCache>,
}

impl MaintenanceService {
    pub fn new(cache: Arc<ResponseCache>) -> Self {
        Self { cache }
    }

    /// Remove expired durable cache rows. Safe to run at any time.
    pub async fn sweep_expired_cache(&self) -> u64 {
        let removed = self.cache.sweep_expired().await;
        info!(target: TARGET, removed, "cache sweep finished");
        removed
    }

    /// Invalidate cached responses under a key prefix (trailing `*` allowed).
    pub async fn invalidate_cache(&self, prefix: &str) -> u64 {
        let removed = self.cache.delete_prefix(prefix).await;
        counter!("esigate_cache_invalidated_total").increment(removed);
        info!(target: TARGET, prefix, removed, "cache invalidation finished");
        removed
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::OffsetDateTime;

    use crate::cache::CacheConfig;
    use crate::test_support::MemoryCacheRows;

    use super::*;

    #[tokio::test]
    async fn sweep_and_invalidate_cooperate_with_the_cache() {
        let store = Arc::new(MemoryCacheRows::default());
        let cache = Arc::new(ResponseCache::new(CacheConfig::default(), store.clone()));
        let service = MaintenanceService::new(cache);

        let past = OffsetDateTime::now_utc() - time::Duration::minutes(1);
        let future = OffsetDateTime::now_utc() + time::Duration::minutes(10);
        store.insert_raw("esi:characters:1:assets", json!(1), None, future);
        store.insert_raw("esi:characters:1:orders", json!(2), None, past);
        store.insert_raw("esi:universe:types", json!(3), None, future);

        assert_eq!(service.sweep_expired_cache().await, 1);
        assert_eq!(service.invalidate_cache("esi:characters:*").await, 1);
        assert_eq!(store.rows().len(), 1);
    }
}
