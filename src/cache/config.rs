//! Cache tier configuration.

use std::num::NonZeroUsize;
use std::time::Duration;

const DEFAULT_FAST_ENTRY_LIMIT: usize = 2_048;
const DEFAULT_TTL_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Enable the in-process fast tier.
    pub enable_fast_tier: bool,
    /// Maximum entries held by the fast tier before LRU eviction.
    pub fast_entry_limit: usize,
    /// TTL applied when the upstream response carries no usable expiry.
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enable_fast_tier: true,
            fast_entry_limit: DEFAULT_FAST_ENTRY_LIMIT,
            default_ttl: Duration::from_secs(DEFAULT_TTL_SECS),
        }
    }
}

impl CacheConfig {
    /// Fast-tier entry limit as NonZeroUsize, clamping to 1 if zero.
    pub fn fast_entry_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.fast_entry_limit).unwrap_or(NonZeroUsize::MIN)
    }
}
