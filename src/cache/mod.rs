//! Two-tier response cache.
//!
//! Fast tier: in-process LRU with per-entry expiry, first look on every read.
//! Durable tier: Postgres rows behind `CacheRowsRepo`, authoritative, swept
//! explicitly. The manager keeps both tiers in sync on the write path and
//! degrades to a miss whenever either tier misbehaves.

mod config;
mod fast;
mod keys;
mod manager;

pub use config::CacheConfig;
pub use fast::FastCache;
pub use keys::{cache_key, normalize_endpoint, CACHE_KEY_PREFIX};
pub use manager::{Lookup, ResponseCache, StaleEntry};

pub(crate) use manager::parse_http_date;
