use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "esigate_cache_fast_hit_total",
            Unit::Count,
            "Responses served from the in-process cache tier."
        );
        describe_counter!(
            "esigate_cache_store_hit_total",
            Unit::Count,
            "Responses served from the durable cache tier."
        );
        describe_counter!(
            "esigate_cache_miss_total",
            Unit::Count,
            "Cache lookups that found no usable entry."
        );
        describe_counter!(
            "esigate_cache_expired_total",
            Unit::Count,
            "Expired durable rows deleted on read."
        );
        describe_counter!(
            "esigate_cache_stale_total",
            Unit::Count,
            "Stale rows retained for conditional revalidation."
        );
        describe_counter!(
            "esigate_cache_swept_total",
            Unit::Count,
            "Expired durable rows removed by sweeps."
        );
        describe_counter!(
            "esigate_cache_invalidated_total",
            Unit::Count,
            "Cache entries removed by prefix invalidation."
        );
        describe_gauge!(
            "esigate_error_budget_remaining",
            Unit::Count,
            "Last observed upstream error budget remaining."
        );
        describe_gauge!(
            "esigate_rate_window_used",
            Unit::Count,
            "Last observed per-group rate window usage."
        );
        describe_counter!(
            "esigate_throttle_total",
            Unit::Count,
            "Dispatches delayed by the governor, by reason."
        );
        describe_counter!(
            "esigate_fetch_total",
            Unit::Count,
            "Upstream fetches by outcome."
        );
        describe_counter!(
            "esigate_fetch_retries_total",
            Unit::Count,
            "Upstream request attempts that were retried."
        );
        describe_counter!(
            "esigate_fetch_revalidated_total",
            Unit::Count,
            "Fetches satisfied by a 304 revalidation."
        );
        describe_histogram!(
            "esigate_fetch_duration_seconds",
            Unit::Seconds,
            "Wall time of upstream fetches including retries."
        );
        describe_counter!(
            "esigate_jobs_enqueued_total",
            Unit::Count,
            "Jobs accepted onto a queue."
        );
        describe_counter!(
            "esigate_jobs_completed_total",
            Unit::Count,
            "Jobs finished successfully."
        );
        describe_counter!(
            "esigate_jobs_retried_total",
            Unit::Count,
            "Failed job attempts rescheduled for retry."
        );
        describe_counter!(
            "esigate_jobs_failed_total",
            Unit::Count,
            "Jobs failed permanently."
        );
        describe_counter!(
            "esigate_refresh_scans_total",
            Unit::Count,
            "Token refresh scans executed."
        );
        describe_counter!(
            "esigate_refresh_total",
            Unit::Count,
            "Token refresh attempts by outcome."
        );
        describe_counter!(
            "esigate_schedule_fires_total",
            Unit::Count,
            "Scheduled task fires, by schedule."
        );
        describe_counter!(
            "esigate_schedule_panics_total",
            Unit::Count,
            "Scheduled task panics, by schedule."
        );
    });
}
