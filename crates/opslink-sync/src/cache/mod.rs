use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::error::RequestError;

mod backend;

pub use backend::{ApiBackend, ApiRequest, FallbackBackend, HttpBackend, Method};

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    cached_at: Instant,
}

struct CacheInner {
    backend: Arc<dyn ApiBackend>,
    ttl: Duration,
    retries: u32,
    retry_base_delay: Duration,
    entries: parking_lot::Mutex<HashMap<String, CacheEntry>>,
    in_flight: parking_lot::Mutex<HashMap<String, broadcast::Sender<Result<Value, RequestError>>>>,
}

/// TTL cache with in-flight coalescing and bounded retry around an
/// [`ApiBackend`]. Idempotent GETs are safe to issue redundantly from many
/// components without amplifying network load; entries are replaced
/// wholesale, never mutated in place.
#[derive(Clone)]
pub struct RequestCache {
    inner: Arc<CacheInner>,
}

impl RequestCache {
    pub fn new(
        backend: Arc<dyn ApiBackend>,
        ttl: Duration,
        retries: u32,
        retry_base_delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                backend,
                ttl,
                retries,
                retry_base_delay,
                entries: parking_lot::Mutex::new(HashMap::new()),
                in_flight: parking_lot::Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn from_config(config: &SyncConfig, backend: Arc<dyn ApiBackend>) -> Self {
        Self::new(
            backend,
            config.cache_ttl,
            config.request_retries,
            config.retry_base_delay,
        )
    }

    /// Deterministic key for (endpoint, params); parameter order does not
    /// matter.
    pub fn cache_key(endpoint: &str, params: &[(&str, &str)]) -> String {
        if params.is_empty() {
            return endpoint.to_string();
        }
        let mut sorted: Vec<_> = params.to_vec();
        sorted.sort();
        let query: Vec<String> = sorted
            .into_iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        format!("{endpoint}?{}", query.join("&"))
    }

    /// Cached-or-fresh read. Concurrent calls for the same key share one
    /// backend round trip. The round trip is owned by the cache, not the
    /// caller: a caller cancelled mid-flight (dropped future, timeout) does
    /// not abort the call, which still settles, caches, and releases the
    /// in-flight entry for later readers.
    pub async fn get(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> Result<Value, RequestError> {
        let key = Self::cache_key(endpoint, params);
        if let Some(entry) = self.inner.live_entry(&key) {
            debug!(%key, "cache hit");
            return Ok(entry.value);
        }

        let mut receiver = {
            let mut in_flight = self.inner.in_flight.lock();
            if let Some(sender) = in_flight.get(&key) {
                debug!(%key, "joining in-flight request");
                sender.subscribe()
            } else {
                let (sender, receiver) = broadcast::channel(1);
                in_flight.insert(key.clone(), sender.clone());
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    let request = ApiRequest {
                        method: Method::Get,
                        endpoint: key.clone(),
                        body: None,
                    };
                    let result = inner.execute_with_retry(&request).await;
                    if let Ok(value) = &result {
                        let mut entries = inner.entries.lock();
                        // Lazy sweep: drop anything already past its TTL so
                        // the map stays bounded by the live working set.
                        entries.retain(|_, entry| entry.cached_at.elapsed() < inner.ttl);
                        entries.insert(
                            key.clone(),
                            CacheEntry {
                                value: value.clone(),
                                cached_at: Instant::now(),
                            },
                        );
                    }
                    // The table entry goes away however the call settled.
                    inner.in_flight.lock().remove(&key);
                    let _ = sender.send(result);
                });
                receiver
            }
        };

        receiver
            .recv()
            .await
            .map_err(|_| RequestError::Network("in-flight request dropped".into()))?
    }

    /// Mutating call: never cached, application errors surface immediately,
    /// and success evicts every entry under the mutated resource's prefix.
    pub async fn mutate(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Value>,
    ) -> Result<Value, RequestError> {
        debug_assert!(method.is_mutation(), "use get() for reads");
        let request = ApiRequest {
            method,
            endpoint: endpoint.to_string(),
            body,
        };
        let result = self.inner.execute_with_retry(&request).await?;
        let prefix = resource_prefix(endpoint);
        debug!(%endpoint, %prefix, "invalidating cache prefix after mutation");
        self.invalidate_prefix(&prefix);
        Ok(result)
    }

    pub fn invalidate_prefix(&self, prefix: &str) {
        self.inner
            .entries
            .lock()
            .retain(|key, _| !key.starts_with(prefix));
    }

    pub fn clear(&self) {
        self.inner.entries.lock().clear();
    }
}

impl CacheInner {
    fn live_entry(&self, key: &str) -> Option<CacheEntry> {
        let entries = self.entries.lock();
        let entry = entries.get(key)?;
        if entry.cached_at.elapsed() < self.ttl {
            Some(entry.clone())
        } else {
            None
        }
    }

    async fn execute_with_retry(&self, request: &ApiRequest) -> Result<Value, RequestError> {
        let mut attempt = 0u32;
        loop {
            match self.backend.execute(request).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.retries => {
                    attempt += 1;
                    let delay = self.retry_base_delay.saturating_mul(1 << attempt.min(8));
                    warn!(
                        endpoint = %request.endpoint,
                        attempt,
                        error = %err,
                        "retrying request after network failure"
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// First path segment of an endpoint, the granularity at which mutations
/// invalidate reads.
fn resource_prefix(endpoint: &str) -> String {
    let trimmed = endpoint.trim_start_matches('/');
    match trimmed.split('/').next() {
        Some(first) if !first.is_empty() => format!("/{first}"),
        _ => endpoint.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::timeout;

    struct CountingBackend {
        calls: AtomicU32,
        fail_first: u32,
        delay: Duration,
    }

    impl CountingBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail_first: 0,
                delay: Duration::ZERO,
            })
        }

        fn failing(fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail_first,
                delay: Duration::ZERO,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail_first: 0,
                delay,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ApiBackend for CountingBackend {
        async fn execute(&self, request: &ApiRequest) -> Result<Value, RequestError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            if call <= self.fail_first {
                return Err(RequestError::Network("connection reset".into()));
            }
            Ok(json!({ "endpoint": request.endpoint, "call": call }))
        }
    }

    fn cache(backend: Arc<CountingBackend>) -> RequestCache {
        RequestCache::new(
            backend,
            Duration::from_secs(30),
            3,
            Duration::from_millis(50),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn read_before_ttl_expiry_skips_network() {
        let backend = CountingBackend::new();
        let cache = cache(backend.clone());
        let first = cache.get("/transits", &[]).await.unwrap();
        let second = cache.get("/transits", &[]).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn read_after_ttl_expiry_refetches_once() {
        let backend = CountingBackend::new();
        let cache = cache(backend.clone());
        cache.get("/transits", &[]).await.unwrap();
        sleep(Duration::from_secs(31)).await;
        cache.get("/transits", &[]).await.unwrap();
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_identical_reads_coalesce() {
        let backend = CountingBackend::slow(Duration::from_millis(100));
        let cache = Arc::new(cache(backend.clone()));
        let mut handles = Vec::new();
        for _ in 0..5 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.get("/alerts", &[("status", "active")]).await
            }));
        }
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }
        assert_eq!(backend.calls(), 1);
        assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_caller_does_not_strand_the_key() {
        let backend = CountingBackend::slow(Duration::from_secs(5));
        let cache = cache(backend.clone());

        // The first caller gives up long before the backend answers.
        let first = timeout(Duration::from_secs(1), cache.get("/transits", &[])).await;
        assert!(first.is_err());

        // The round trip keeps running in the background; a later reader
        // joins it instead of wedging on a dead in-flight entry.
        let second = timeout(Duration::from_secs(30), cache.get("/transits", &[]))
            .await
            .expect("second read stranded behind a cancelled caller")
            .unwrap();
        assert_eq!(backend.calls(), 1);

        // And the result was cached on settle.
        let third = cache.get("/transits", &[]).await.unwrap();
        assert_eq!(second, third);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_params_are_distinct_keys() {
        let backend = CountingBackend::new();
        let cache = cache(backend.clone());
        cache.get("/transits", &[("status", "pending")]).await.unwrap();
        cache.get("/transits", &[("status", "active")]).await.unwrap();
        assert_eq!(backend.calls(), 2);
        // Order-insensitive key derivation.
        assert_eq!(
            RequestCache::cache_key("/t", &[("b", "2"), ("a", "1")]),
            RequestCache::cache_key("/t", &[("a", "1"), ("b", "2")]),
        );
    }

    #[tokio::test(start_paused = true)]
    async fn network_failures_retry_then_succeed() {
        let backend = CountingBackend::failing(2);
        let cache = cache(backend.clone());
        cache.get("/metrics", &[]).await.unwrap();
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn application_errors_are_not_retried() {
        struct ApiErrorBackend {
            calls: AtomicU32,
        }
        #[async_trait]
        impl ApiBackend for ApiErrorBackend {
            async fn execute(&self, _request: &ApiRequest) -> Result<Value, RequestError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Err(RequestError::Api {
                    status: 403,
                    message: Some("forbidden".into()),
                })
            }
        }
        let backend = Arc::new(ApiErrorBackend {
            calls: AtomicU32::new(0),
        });
        let cache = RequestCache::new(
            backend.clone(),
            Duration::from_secs(30),
            3,
            Duration::from_millis(50),
        );
        let err = cache.get("/restricted", &[]).await.unwrap_err();
        assert!(matches!(err, RequestError::Api { status: 403, .. }));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn mutation_evicts_prefixed_entries() {
        let backend = CountingBackend::new();
        let cache = cache(backend.clone());
        cache.get("/transits", &[("status", "pending")]).await.unwrap();
        cache.get("/alerts", &[]).await.unwrap();
        assert_eq!(backend.calls(), 2);

        cache
            .mutate(Method::Post, "/transits/42/dispatch", Some(json!({})))
            .await
            .unwrap();
        // Transit reads refetch, alert reads stay cached.
        cache.get("/transits", &[("status", "pending")]).await.unwrap();
        cache.get("/alerts", &[]).await.unwrap();
        assert_eq!(backend.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_swept_on_insert() {
        let backend = CountingBackend::new();
        let cache = cache(backend.clone());
        cache.get("/transits", &[]).await.unwrap();
        cache.get("/alerts", &[]).await.unwrap();
        assert_eq!(cache.inner.entries.lock().len(), 2);

        sleep(Duration::from_secs(31)).await;
        cache.get("/metrics", &[]).await.unwrap();
        // Both stale entries were dropped when the fresh one landed.
        let entries = cache.inner.entries.lock();
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key("/metrics"));
    }
}
