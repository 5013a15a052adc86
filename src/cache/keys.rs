//! Cache key derivation.
//!
//! Keys are deterministic in (endpoint, parameters): the same inputs always
//! produce the same key, so lookups need no secondary index.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

/// Prefix shared by every cache key the gateway writes.
pub const CACHE_KEY_PREFIX: &str = "esi";

const PARAM_HASH_LEN: usize = 8;

/// Normalize an endpoint path: strip leading/trailing separators, collapse
/// repeated separators, join segments with `:`.
pub fn normalize_endpoint(endpoint: &str) -> String {
    endpoint
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join(":")
}

/// Derive the cache key for an endpoint and its query parameters.
///
/// Parameters are carried in a sorted map, so the canonical JSON form is
/// invariant under insertion order; the key gets an 8-hex-char hash suffix
/// only when parameters are present.
pub fn cache_key(endpoint: &str, params: &BTreeMap<String, String>) -> String {
    let normalized = normalize_endpoint(endpoint);
    if params.is_empty() {
        return format!("{CACHE_KEY_PREFIX}:{normalized}");
    }

    format!(
        "{CACHE_KEY_PREFIX}:{normalized}:{}",
        param_hash(params)
    )
}

fn param_hash(params: &BTreeMap<String, String>) -> String {
    // BTreeMap serializes with sorted keys, which is canonical enough here.
    let canonical = serde_json::to_string(params).unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    let mut hash = hex::encode(digest);
    hash.truncate(PARAM_HASH_LEN);
    hash
}
