//! Resilient upstream request executor.
//!
//! Every fetch goes cache-first, consults the governor before dispatch,
//! feeds rate headers back into it on every response, and retries transient
//! failures under a bounded backoff policy. Conditional revalidation reuses
//! the ETag of an expired cache row so a `304 Not Modified` costs no body.

mod retry;
mod transport;

pub use retry::RetryPolicy;
pub use transport::{HttpTransport, TransportError, UpstreamRequest, UpstreamResponse};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::application::governor::RateGovernor;
use crate::cache::{Lookup, ResponseCache};

const TARGET: &str = "esigate::executor";

#[derive(Debug, Error)]
pub enum EsiError {
    #[error("upstream rejected credentials with status {status}")]
    Reauthorization { status: u16 },
    #[error("resource not found upstream")]
    NotFound,
    #[error("upstream client error {status}: {body}")]
    ClientError { status: u16, body: String },
    #[error("upstream error budget exceeded")]
    ErrorBudgetExceeded { retry_after: Duration },
    #[error("upstream rate limit hit")]
    RateLimited { retry_after: Duration },
    #[error("upstream server error {status}")]
    ServerError { status: u16 },
    #[error("network failure: {0}")]
    Network(String),
    #[error("response body is not valid json: {0}")]
    InvalidBody(String),
    #[error("not-modified response without a cached entry to serve")]
    MissingCachedEntry,
}

impl EsiError {
    /// Whether another attempt may succeed without operator intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ErrorBudgetExceeded { .. }
                | Self::RateLimited { .. }
                | Self::ServerError { .. }
                | Self::Network(_)
        )
    }
}

pub struct EsiClient {
    transport: Arc<dyn HttpTransport>,
    cache: Arc<ResponseCache>,
    governor: Arc<RateGovernor>,
    retry: RetryPolicy,
}

impl EsiClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        cache: Arc<ResponseCache>,
        governor: Arc<RateGovernor>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            cache,
            governor,
            retry,
        }
    }

    /// Fetch an endpoint through the cache, governor and retry pipeline.
    ///
    /// `route_group` is the caller's hint for which upstream rate window the
    /// endpoint belongs to; without it only the shared error budget applies.
    pub async fn fetch(
        &self,
        endpoint: &str,
        params: &BTreeMap<String, String>,
        token: Option<&str>,
        route_group: Option<&str>,
    ) -> Result<Value, EsiError> {
        let key = self.cache.key(endpoint, params);

        if let Some(decision) = self.governor.should_throttle_errors().await {
            debug!(target: TARGET, key, wait_ms = decision.wait.as_millis() as u64, reason = ?decision.reason, "throttled before dispatch");
            tokio::time::sleep(decision.wait).await;
        }
        if let Some(group) = route_group
            && let Some(decision) = self.governor.should_throttle_rate(group).await
        {
            debug!(target: TARGET, key, group, wait_ms = decision.wait.as_millis() as u64, "route group throttled before dispatch");
            tokio::time::sleep(decision.wait).await;
        }

        let mut etag = match self.cache.lookup(&key).await {
            Lookup::Fresh(entry) => {
                counter!("esigate_fetch_total", "outcome" => "cache_hit").increment(1);
                return Ok(entry.payload);
            }
            Lookup::Stale(stale) => Some(stale),
            Lookup::Miss => None,
        };

        let started = std::time::Instant::now();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let request = UpstreamRequest {
                path: endpoint.to_string(),
                query: params
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                headers: etag
                    .as_ref()
                    .and_then(|stale| stale.etag.clone())
                    .map(|tag| vec![("if-none-match".to_string(), tag)])
                    .unwrap_or_default(),
                bearer_token: token.map(str::to_string),
            };

            let outcome = match self.transport.execute(&request).await {
                Ok(response) => {
                    self.track_governor(&response).await;
                    self.classify(&key, response, &mut etag).await
                }
                Err(err) => Err(EsiError::Network(err.to_string())),
            };

            match outcome {
                Ok(payload) => {
                    counter!("esigate_fetch_total", "outcome" => "upstream").increment(1);
                    histogram!("esigate_fetch_duration_seconds")
                        .record(started.elapsed().as_secs_f64());
                    return Ok(payload);
                }
                Err(err) if err.is_retryable() && attempt <= self.retry.max_retries => {
                    let wait = match &err {
                        EsiError::ErrorBudgetExceeded { retry_after }
                        | EsiError::RateLimited { retry_after } => *retry_after,
                        _ => self.retry.delay(attempt),
                    };
                    warn!(
                        target: TARGET,
                        key,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        error = %err,
                        "retrying upstream request"
                    );
                    counter!("esigate_fetch_retries_total").increment(1);
                    tokio::time::sleep(wait).await;
                }
                Err(err) => {
                    counter!("esigate_fetch_total", "outcome" => "error").increment(1);
                    info!(target: TARGET, key, attempt, error = %err, "upstream request failed");
                    // Limit responses carry a mandatory wait; hold it even
                    // when no retries remain before surfacing the error.
                    if let EsiError::ErrorBudgetExceeded { retry_after }
                    | EsiError::RateLimited { retry_after } = &err
                    {
                        tokio::time::sleep(*retry_after).await;
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn track_governor(&self, response: &UpstreamResponse) {
        if let (Some(remain), Some(reset)) = (
            response.header_u32("x-esi-error-limit-remain"),
            response.header_u32("x-esi-error-limit-reset"),
        ) {
            self.governor.track_error_limit(remain, reset).await;
        }

        if let (Some(group), Some(limit)) = (
            response.header("x-ratelimit-group"),
            response.header("x-ratelimit-limit"),
        ) {
            let used = response.header_u32("x-ratelimit-used").unwrap_or(0);
            self.governor.track_rate_limit(group, limit, used).await;
        }
    }

    /// Turn a raw response into a payload or a classified error, updating
    /// the cache as a side effect of success and revalidation.
    async fn classify(
        &self,
        key: &str,
        response: UpstreamResponse,
        etag: &mut Option<crate::cache::StaleEntry>,
    ) -> Result<Value, EsiError> {
        match response.status {
            200 => {
                let payload: Value = serde_json::from_slice(&response.body)
                    .map_err(|err| EsiError::InvalidBody(err.to_string()))?;
                let expires_at = self.cache.calculate_expiration(
                    response.header("cache-control"),
                    response.header("expires"),
                );
                self.cache
                    .set(
                        key,
                        payload.clone(),
                        expires_at,
                        response.header("etag").map(str::to_string),
                    )
                    .await;
                Ok(payload)
            }
            304 => match etag.take() {
                Some(stale) => {
                    let expires_at = self.cache.calculate_expiration(
                        response.header("cache-control"),
                        response.header("expires"),
                    );
                    self.cache
                        .set(key, stale.payload.clone(), expires_at, stale.etag)
                        .await;
                    counter!("esigate_fetch_revalidated_total").increment(1);
                    Ok(stale.payload)
                }
                None => Err(EsiError::MissingCachedEntry),
            },
            status @ (401 | 403) => Err(EsiError::Reauthorization { status }),
            404 => {
                self.cache.delete(key).await;
                Err(EsiError::NotFound)
            }
            420 => Err(EsiError::ErrorBudgetExceeded {
                retry_after: self.retry_after(&response),
            }),
            429 => Err(EsiError::RateLimited {
                retry_after: self.retry_after(&response),
            }),
            status if status >= 500 => Err(EsiError::ServerError { status }),
            status => Err(EsiError::ClientError {
                status,
                body: String::from_utf8_lossy(&response.body).into_owned(),
            }),
        }
    }

    fn retry_after(&self, response: &UpstreamResponse) -> Duration {
        response
            .header("retry-after")
            .map(|value| self.governor.parse_retry_after(value))
            .unwrap_or(Duration::from_secs(60))
    }
}
