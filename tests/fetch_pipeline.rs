//! End-to-end exercises of the public fetch pipeline against an in-memory
//! store and a scripted transport.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};
use time::OffsetDateTime;

use esigate::application::executor::{
    EsiClient, HttpTransport, RetryPolicy, TransportError, UpstreamRequest, UpstreamResponse,
};
use esigate::application::governor::{GovernorConfig, RateGovernor};
use esigate::application::jobs::MaintenanceService;
use esigate::application::repos::{CacheRowsRepo, RepoError};
use esigate::cache::{CacheConfig, ResponseCache};
use esigate::domain::entities::CacheRow;

#[derive(Default)]
struct MemoryStore {
    rows: Mutex<HashMap<String, CacheRow>>,
}

impl MemoryStore {
    fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }
}

#[async_trait]
impl CacheRowsRepo for MemoryStore {
    async fn find_row(&self, key: &str) -> Result<Option<CacheRow>, RepoError> {
        Ok(self.rows.lock().unwrap().get(key).cloned())
    }

    async fn upsert_row(
        &self,
        key: &str,
        data: &Value,
        etag: Option<&str>,
        expires_at: OffsetDateTime,
    ) -> Result<(), RepoError> {
        self.rows.lock().unwrap().insert(
            key.to_string(),
            CacheRow {
                cache_key: key.to_string(),
                data: data.clone(),
                etag: etag.map(str::to_string),
                expires_at,
                updated_at: OffsetDateTime::now_utc(),
            },
        );
        Ok(())
    }

    async fn delete_row(&self, key: &str) -> Result<bool, RepoError> {
        Ok(self.rows.lock().unwrap().remove(key).is_some())
    }

    async fn delete_rows_like(&self, prefix: &str) -> Result<u64, RepoError> {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|key, _| !key.starts_with(prefix));
        Ok((before - rows.len()) as u64)
    }

    async fn delete_expired_rows(&self, now: OffsetDateTime) -> Result<u64, RepoError> {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|_, row| row.expires_at > now);
        Ok((before - rows.len()) as u64)
    }
}

#[derive(Default)]
struct ScriptedTransport {
    responses: Mutex<VecDeque<UpstreamResponse>>,
    calls: Mutex<u32>,
}

impl ScriptedTransport {
    fn push(&self, response: UpstreamResponse) {
        self.responses.lock().unwrap().push_back(response);
    }

    fn calls(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn execute(&self, _request: &UpstreamRequest) -> Result<UpstreamResponse, TransportError> {
        *self.calls.lock().unwrap() += 1;
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| TransportError::Network("script exhausted".into()))
    }
}

fn json_response(payload: Value, headers: &[(&str, &str)]) -> UpstreamResponse {
    UpstreamResponse {
        status: 200,
        headers: headers
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect(),
        body: Bytes::from(payload.to_string()),
    }
}

fn pipeline(
    transport: Arc<ScriptedTransport>,
) -> (EsiClient, Arc<ResponseCache>, Arc<RateGovernor>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::default());
    let cache = Arc::new(ResponseCache::new(CacheConfig::default(), store.clone()));
    let governor = Arc::new(RateGovernor::new(GovernorConfig::default(), cache.clone()));
    let retry = RetryPolicy {
        max_retries: 2,
        initial_delay: Duration::from_millis(1),
        multiplier: 2.0,
        max_delay: Duration::from_millis(5),
    };
    let client = EsiClient::new(transport, cache.clone(), governor.clone(), retry);
    (client, cache, governor, store)
}

#[tokio::test]
async fn fetch_caches_then_invalidation_forces_a_refetch() {
    let transport = Arc::new(ScriptedTransport::default());
    transport.push(json_response(
        json!({"solar_system_id": 30000142}),
        &[("cache-control", "max-age=3600")],
    ));
    transport.push(json_response(
        json!({"solar_system_id": 30000142}),
        &[("cache-control", "max-age=3600")],
    ));
    let (client, cache, _, _) = pipeline(transport.clone());

    let params = BTreeMap::from([("datasource".to_string(), "tranquility".to_string())]);
    client
        .fetch("/universe/systems/30000142", &params, None, None)
        .await
        .expect("first fetch");
    client
        .fetch("/universe/systems/30000142", &params, None, None)
        .await
        .expect("cached fetch");
    assert_eq!(transport.calls(), 1);

    cache.delete_prefix("esi:universe:").await;
    client
        .fetch("/universe/systems/30000142", &params, None, None)
        .await
        .expect("refetch after invalidation");
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn error_limit_headers_arm_the_governor_across_clients() {
    let transport = Arc::new(ScriptedTransport::default());
    transport.push(json_response(
        json!(1),
        &[
            ("x-esi-error-limit-remain", "0"),
            ("x-esi-error-limit-reset", "42"),
        ],
    ));
    let (client, cache, governor, _) = pipeline(transport);

    client
        .fetch("/status", &BTreeMap::new(), None, None)
        .await
        .expect("fetch");

    // Governor state lives in the shared cache, so a second governor over
    // the same store observes the exhausted budget.
    let other = RateGovernor::new(GovernorConfig::default(), cache);
    let decision = other.should_throttle_errors().await.expect("throttle");
    assert!(decision.wait <= Duration::from_secs(42));
    assert!(governor.should_throttle_errors().await.is_some());
}

#[tokio::test]
async fn maintenance_sweep_removes_only_expired_rows() {
    let transport = Arc::new(ScriptedTransport::default());
    transport.push(json_response(json!(1), &[("cache-control", "max-age=0")]));
    transport.push(json_response(json!(2), &[("cache-control", "max-age=3600")]));
    let (client, cache, _, store) = pipeline(transport);

    // max-age=0 yields an already-expired row that set() refuses to write,
    // so seed one directly through the repo.
    let _ = client.fetch("/status", &BTreeMap::new(), None, None).await;
    store
        .upsert_row(
            "esi:stale:row",
            &json!(0),
            None,
            OffsetDateTime::now_utc() - time::Duration::minutes(1),
        )
        .await
        .expect("seed");
    client
        .fetch("/universe/systems/30000142", &BTreeMap::new(), None, None)
        .await
        .expect("fetch");

    let maintenance = MaintenanceService::new(cache);
    let removed = maintenance.sweep_expired_cache().await;
    assert_eq!(removed, 1);
    assert_eq!(store.len(), 1);
}
