//! Shared rate and error-budget governor.
//!
//! The upstream advertises an error budget (`x-esi-error-limit-remain` /
//! `x-esi-error-limit-reset`) and per-route-group rate windows
//! (`x-ratelimit-group`, `x-ratelimit-limit`, `x-ratelimit-used`). The
//! governor records both through the response cache so every worker in the
//! process (and any process sharing the durable store) sees the same view.
//! Staleness is handled by giving each record a TTL equal to its reset
//! window; once the window passes, the record simply expires.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::cache::{ResponseCache, parse_http_date};

const TARGET: &str = "esigate::governor";

const ERROR_BUDGET_KEY: &str = "esi:governor:error-budget";
const RATE_LIMIT_KEY_PREFIX: &str = "esi:governor:rate-limit:";

/// Fallback when a `Retry-After` header is present but unparseable.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct GovernorConfig {
    /// Size of the upstream error budget per window.
    pub error_limit_total: u32,
    /// Fraction of the budget that may be consumed before soft throttling.
    pub warn_threshold: f64,
    /// Delay injected while in the soft-throttle band.
    pub soft_delay: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            error_limit_total: 100,
            warn_threshold: 0.8,
            soft_delay: Duration::from_millis(500),
        }
    }
}

/// Why and how long a caller should wait before dispatching.
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottleDecision {
    pub wait: Duration,
    pub reason: ThrottleReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleReason {
    /// The error budget is exhausted; wait for the window to reset.
    ErrorBudgetExhausted,
    /// The error budget is nearly exhausted; slow down.
    ErrorBudgetLow,
    /// A route group's rate window is fully consumed.
    RateWindowExhausted,
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorBudgetState {
    remain: u32,
    reset_at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct RateWindowState {
    limit: u32,
    used: u32,
    reset_at: i64,
}

pub struct RateGovernor {
    cache: Arc<ResponseCache>,
    config: GovernorConfig,
}

impl RateGovernor {
    pub fn new(config: GovernorConfig, cache: Arc<ResponseCache>) -> Self {
        Self { cache, config }
    }

    /// Record the error budget advertised on a response. Records expire with
    /// the budget window, so a missed update heals itself.
    pub async fn track_error_limit(&self, remain: u32, reset_seconds: u32) {
        let now = OffsetDateTime::now_utc();
        let reset_at = now + time::Duration::seconds(i64::from(reset_seconds));
        let state = ErrorBudgetState {
            remain,
            reset_at: reset_at.unix_timestamp(),
        };

        gauge!("esigate_error_budget_remaining").set(f64::from(remain));
        if remain == 0 {
            warn!(target: TARGET, reset_seconds, "upstream error budget exhausted");
        } else if self.in_warn_band(remain) {
            warn!(target: TARGET, remain, reset_seconds, "upstream error budget running low");
        }

        self.cache
            .set(ERROR_BUDGET_KEY, json!(state), reset_at, None)
            .await;
    }

    /// Record a route group's rate window from its response headers. The
    /// limit header reads `<total>/<window><unit>` with unit `s`, `m` or `h`.
    pub async fn track_rate_limit(&self, group: &str, limit_header: &str, used: u32) {
        let Some((limit, window)) = parse_rate_limit(limit_header) else {
            debug!(target: TARGET, group, limit_header, "unparseable rate-limit header ignored");
            return;
        };

        let now = OffsetDateTime::now_utc();
        let reset_at = now + time::Duration::seconds(window.as_secs() as i64);
        let state = RateWindowState {
            limit,
            used,
            reset_at: reset_at.unix_timestamp(),
        };

        gauge!("esigate_rate_window_used", "group" => group.to_string()).set(f64::from(used));
        let remaining = limit.saturating_sub(used);
        if limit > 0 && f64::from(remaining) / f64::from(limit) <= 0.2 {
            warn!(target: TARGET, group, used, limit, "route group rate window nearly consumed");
        }

        self.cache
            .set(&rate_limit_key(group), json!(state), reset_at, None)
            .await;
    }

    /// Consult the shared error budget before dispatching. Returns how long
    /// to wait, or `None` when the budget is healthy or unknown.
    pub async fn should_throttle_errors(&self) -> Option<ThrottleDecision> {
        let entry = self.cache.get(ERROR_BUDGET_KEY).await?;
        let state: ErrorBudgetState = serde_json::from_value(entry.payload).ok()?;

        let now = OffsetDateTime::now_utc();
        let until_reset = seconds_until(state.reset_at, now);

        if state.remain == 0 {
            counter!("esigate_throttle_total", "reason" => "error_budget").increment(1);
            return Some(ThrottleDecision {
                wait: until_reset,
                reason: ThrottleReason::ErrorBudgetExhausted,
            });
        }

        if self.in_warn_band(state.remain) {
            counter!("esigate_throttle_total", "reason" => "error_budget_low").increment(1);
            return Some(ThrottleDecision {
                wait: self.config.soft_delay,
                reason: ThrottleReason::ErrorBudgetLow,
            });
        }

        None
    }

    /// Consult a route group's rate window. Unknown groups never throttle.
    pub async fn should_throttle_rate(&self, group: &str) -> Option<ThrottleDecision> {
        let entry = self.cache.get(&rate_limit_key(group)).await?;
        let state: RateWindowState = serde_json::from_value(entry.payload).ok()?;

        if state.used < state.limit {
            return None;
        }

        let now = OffsetDateTime::now_utc();
        counter!("esigate_throttle_total", "reason" => "rate_window").increment(1);
        Some(ThrottleDecision {
            wait: seconds_until(state.reset_at, now),
            reason: ThrottleReason::RateWindowExhausted,
        })
    }

    /// Whether consumption has crossed the configured warning fraction.
    fn in_warn_band(&self, remain: u32) -> bool {
        let used = f64::from(self.config.error_limit_total.saturating_sub(remain));
        used / f64::from(self.config.error_limit_total) >= self.config.warn_threshold
    }

    /// Interpret a `Retry-After` header: integer seconds or an HTTP-date,
    /// falling back to a conservative default when neither parses.
    pub fn parse_retry_after(&self, value: &str) -> Duration {
        let value = value.trim();
        if let Ok(seconds) = value.parse::<u64>() {
            return Duration::from_secs(seconds);
        }
        if let Some(at) = parse_http_date(value) {
            let delta = at - OffsetDateTime::now_utc();
            return Duration::from_secs(delta.whole_seconds().max(0) as u64);
        }
        warn!(target: TARGET, value, "unparseable retry-after header, using default");
        DEFAULT_RETRY_AFTER
    }
}

fn rate_limit_key(group: &str) -> String {
    format!("{RATE_LIMIT_KEY_PREFIX}{group}")
}

fn seconds_until(reset_at: i64, now: OffsetDateTime) -> Duration {
    Duration::from_secs((reset_at - now.unix_timestamp()).max(0) as u64)
}

/// Parse `<total>/<window><unit>`, e.g. `100/60s`, `400/15m`, `2000/1h`.
fn parse_rate_limit(header: &str) -> Option<(u32, Duration)> {
    let (total, window) = header.trim().split_once('/')?;
    let total = total.trim().parse::<u32>().ok()?;

    let window = window.trim();
    // Index by char, not byte; header values are not guaranteed ASCII.
    let (unit_start, unit) = window.char_indices().next_back()?;
    let amount = window[..unit_start].parse::<u64>().ok()?;
    let seconds = match unit {
        's' => amount,
        'm' => amount * 60,
        'h' => amount * 3600,
        _ => return None,
    };
    Some((total, Duration::from_secs(seconds)))
}

#[cfg(test)]
mod tests {
    use crate::cache::CacheConfig;
    use crate::test_support::MemoryCacheRows;

    use super::*;

    fn governor() -> RateGovernor {
        governor_with(GovernorConfig::default())
    }

    fn governor_with(config: GovernorConfig) -> RateGovernor {
        let store = Arc::new(MemoryCacheRows::default());
        let cache = Arc::new(ResponseCache::new(CacheConfig::default(), store));
        RateGovernor::new(config, cache)
    }

    #[test]
    fn rate_limit_header_units() {
        assert_eq!(
            parse_rate_limit("100/60s"),
            Some((100, Duration::from_secs(60)))
        );
        assert_eq!(
            parse_rate_limit("400/15m"),
            Some((400, Duration::from_secs(900)))
        );
        assert_eq!(
            parse_rate_limit("2000/1h"),
            Some((2000, Duration::from_secs(3600)))
        );
        assert_eq!(parse_rate_limit("garbage"), None);
        assert_eq!(parse_rate_limit("100/60x"), None);
        // Multi-byte trailing characters must be rejected, not panic.
        assert_eq!(parse_rate_limit("100/60µ"), None);
        assert_eq!(parse_rate_limit("100/é"), None);
    }

    #[test]
    fn warn_band_tracks_the_configured_threshold() {
        let governor = governor();
        assert!(!governor.in_warn_band(25));
        // 80 of 100 consumed sits exactly on the 0.8 threshold.
        assert!(governor.in_warn_band(20));
        assert!(governor.in_warn_band(1));
    }

    #[tokio::test]
    async fn healthy_budget_does_not_throttle() {
        let governor = governor();
        governor.track_error_limit(95, 60).await;

        assert!(governor.should_throttle_errors().await.is_none());
    }

    #[tokio::test]
    async fn exhausted_budget_waits_for_reset() {
        let governor = governor();
        governor.track_error_limit(0, 30).await;

        let decision = governor.should_throttle_errors().await.expect("throttled");
        assert_eq!(decision.reason, ThrottleReason::ErrorBudgetExhausted);
        assert!(decision.wait <= Duration::from_secs(30));
        assert!(decision.wait >= Duration::from_secs(28));
    }

    #[tokio::test]
    async fn low_budget_applies_soft_delay() {
        let governor = governor_with(GovernorConfig {
            soft_delay: Duration::from_millis(250),
            ..Default::default()
        });
        // 85 of 100 consumed crosses the 0.8 warn threshold.
        governor.track_error_limit(15, 60).await;

        let decision = governor.should_throttle_errors().await.expect("throttled");
        assert_eq!(decision.reason, ThrottleReason::ErrorBudgetLow);
        assert_eq!(decision.wait, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn budget_records_expire_with_the_window() {
        let governor = governor();
        // Zero-second window: the record is already expired when written
        // and the cache refuses non-positive TTLs, so nothing persists.
        governor.track_error_limit(0, 0).await;

        assert!(governor.should_throttle_errors().await.is_none());
    }

    #[tokio::test]
    async fn rate_window_throttles_only_when_consumed() {
        let governor = governor();
        governor.track_rate_limit("char-assets", "100/60s", 40).await;
        assert!(governor.should_throttle_rate("char-assets").await.is_none());

        governor.track_rate_limit("char-assets", "100/60s", 100).await;
        let decision = governor
            .should_throttle_rate("char-assets")
            .await
            .expect("throttled");
        assert_eq!(decision.reason, ThrottleReason::RateWindowExhausted);
        assert!(decision.wait <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn unknown_group_never_throttles() {
        let governor = governor();
        assert!(governor.should_throttle_rate("no-such-group").await.is_none());
    }

    #[tokio::test]
    async fn retry_after_parses_seconds_and_dates() {
        let governor = governor();
        assert_eq!(
            governor.parse_retry_after("120"),
            Duration::from_secs(120)
        );

        let future = chrono::Utc::now() + chrono::Duration::seconds(90);
        let wait = governor.parse_retry_after(&future.to_rfc2822());
        assert!(wait <= Duration::from_secs(90) && wait >= Duration::from_secs(85));

        assert_eq!(
            governor.parse_retry_after("not a date"),
            DEFAULT_RETRY_AFTER
        );
    }
}
