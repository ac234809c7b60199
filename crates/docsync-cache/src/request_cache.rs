//! TTL response cache with request deduplication
//!
//! [`RequestCache::fetch_with_cache`] wraps every cacheable outbound call:
//! - fresh responses are served from memory
//! - stale responses inside the stale-while-revalidate window are served as-is
//!   (revalidation is the caller's job at this layer)
//! - identical in-flight requests are joined when the strategy deduplicates
//! - otherwise a new request supersedes (aborts) any predecessor on the key
//!
//! Responses live in a bounded moka cache; freshness is judged against the
//! injected [`Clock`], never by moka eviction.

use crate::clock::Clock;
use crate::error::FetchError;
use crate::strategy::CacheStrategy;
use crate::transport::{HttpRequest, Method, Transport};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use moka::future::Cache;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::AbortHandle;

/// Cached response body with its freshness window
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    /// Decoded JSON body
    pub data: Value,
    /// When the response settled (ms)
    pub fetched_at: u64,
    /// End of the fresh window (ms)
    pub expires_at: u64,
}

impl CachedResponse {
    /// Fresh at `now`
    #[inline]
    #[must_use]
    pub fn is_fresh(&self, now: u64) -> bool {
        now < self.expires_at
    }

    /// Servable at `now` under `strategy` (fresh, or stale inside the window)
    #[inline]
    #[must_use]
    pub fn is_servable(&self, now: u64, strategy: &CacheStrategy) -> bool {
        self.is_fresh(now)
            || strategy
                .stale_while_revalidate_ms
                .is_some_and(|swr| now < self.expires_at.saturating_add(swr))
    }
}

/// Options for one [`RequestCache::fetch_with_cache`] call
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOptions {
    /// Method
    pub method: Method,
    /// JSON body
    pub body: Option<Value>,
    /// Caching contract of the endpoint
    pub strategy: CacheStrategy,
    /// Bypass caching and deduplication entirely
    pub skip_cache: bool,
}

impl FetchOptions {
    /// GET under `strategy`
    #[inline]
    #[must_use]
    pub fn get(strategy: CacheStrategy) -> Self {
        Self {
            method: Method::Get,
            body: None,
            strategy,
            skip_cache: false,
        }
    }

    /// Request with body under `strategy`
    #[inline]
    #[must_use]
    pub fn with_body(method: Method, body: Value, strategy: CacheStrategy) -> Self {
        Self {
            method,
            body: Some(body),
            strategy,
            skip_cache: false,
        }
    }

    /// Uncached request, used for writes and forced reloads
    #[inline]
    #[must_use]
    pub fn direct(method: Method, body: Option<Value>) -> Self {
        Self {
            method,
            body,
            strategy: CacheStrategy::NONE,
            skip_cache: true,
        }
    }
}

/// Cache key: `method:url:body`
#[must_use]
pub fn cache_key(method: Method, url: &str, body: Option<&Value>) -> String {
    let body = body.map(Value::to_string).unwrap_or_default();
    format!("{}:{url}:{body}", method.as_str())
}

type SharedFetch = Shared<BoxFuture<'static, Result<Value, FetchError>>>;

struct InflightRequest {
    generation: u64,
    shared: SharedFetch,
    abort: AbortHandle,
}

/// Removes the in-flight marker when the request task ends, including on abort
struct InflightGuard {
    inflight: Arc<DashMap<String, InflightRequest>>,
    key: String,
    generation: u64,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.inflight
            .remove_if(&self.key, |_, req| req.generation == self.generation);
    }
}

/// Statistics for cache monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestCacheStats {
    /// Stored responses
    pub entry_count: u64,
    /// Requests currently in flight
    pub inflight_count: usize,
}

/// Shared response cache and request deduplicator
///
/// Constructed once and handed by reference (`Arc`) to every consumer.
/// Requires a tokio runtime: each network request runs on its own task so
/// that a superseding request can abort it.
pub struct RequestCache {
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    entries: Cache<String, Arc<CachedResponse>>,
    inflight: Arc<DashMap<String, InflightRequest>>,
    next_generation: AtomicU64,
}

impl RequestCache {
    /// Create cache holding at most `max_capacity` responses
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, clock: Arc<dyn Clock>, max_capacity: u64) -> Self {
        Self {
            transport,
            clock,
            entries: Cache::builder()
                .max_capacity(max_capacity)
                .support_invalidation_closures()
                .build(),
            inflight: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Clock used for freshness decisions
    #[inline]
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Fetch `url`, serving from cache or joining in-flight work when allowed
    ///
    /// # Errors
    /// Transport failures and non-2xx responses as [`FetchError`]. A request
    /// superseded by a newer one for the same key resolves to
    /// [`FetchError::Cancelled`].
    pub async fn fetch_with_cache(
        &self,
        url: &str,
        options: FetchOptions,
    ) -> Result<Value, FetchError> {
        let request = HttpRequest {
            method: options.method,
            url: url.to_string(),
            body: options.body,
        };

        if options.skip_cache {
            return execute_request(self.transport.as_ref(), request).await;
        }

        let strategy = options.strategy;
        let key = cache_key(request.method, &request.url, request.body.as_ref());

        if let Some(entry) = self.entries.get(&key).await {
            let now = self.clock.now_ms();
            if entry.is_servable(now, &strategy) {
                tracing::debug!(
                    key = %key,
                    fresh = entry.is_fresh(now),
                    "serving cached response"
                );
                return Ok(entry.data.clone());
            }
        }

        let shared = match self.inflight.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if strategy.deduplicate {
                    tracing::debug!(key = %key, "joining in-flight request");
                    occupied.get().shared.clone()
                } else {
                    tracing::debug!(key = %key, "superseding in-flight request");
                    occupied.get().abort.abort();
                    let next = self.spawn_request(key, request, strategy);
                    let shared = next.shared.clone();
                    occupied.insert(next);
                    shared
                }
            }
            Entry::Vacant(vacant) => {
                let next = self.spawn_request(key, request, strategy);
                let shared = next.shared.clone();
                vacant.insert(next);
                shared
            }
        };

        shared.await
    }

    /// Typed form of [`fetch_with_cache`](Self::fetch_with_cache)
    ///
    /// # Errors
    /// As `fetch_with_cache`, plus [`FetchError::Decode`] when the body does
    /// not match `T`.
    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        url: &str,
        options: FetchOptions,
    ) -> Result<T, FetchError> {
        let value = self.fetch_with_cache(url, options).await?;
        serde_json::from_value(value).map_err(|e| FetchError::Decode(e.to_string()))
    }

    /// Drop one cached response
    pub async fn invalidate(&self, key: &str) {
        self.entries.invalidate(key).await;
    }

    /// Drop every cached response whose key matches `predicate`
    pub fn invalidate_matching<P>(&self, predicate: P)
    where
        P: Fn(&str) -> bool + Send + Sync + 'static,
    {
        if let Err(e) = self.entries.invalidate_entries_if(move |k, _| predicate(k)) {
            tracing::warn!("falling back to full invalidation: {e}");
            self.entries.invalidate_all();
        }
    }

    /// Drop all cached responses and abort in-flight requests
    pub fn clear(&self) {
        self.entries.invalidate_all();
        for entry in self.inflight.iter() {
            entry.value().abort.abort();
        }
        self.inflight.clear();
    }

    /// Peek at a cached response without judging freshness
    pub async fn cached(&self, key: &str) -> Option<Arc<CachedResponse>> {
        self.entries.get(key).await
    }

    /// Check if a request for `key` is in flight
    #[inline]
    #[must_use]
    pub fn is_inflight(&self, key: &str) -> bool {
        self.inflight.contains_key(key)
    }

    /// Get cache statistics
    #[must_use]
    pub fn stats(&self) -> RequestCacheStats {
        RequestCacheStats {
            entry_count: self.entries.entry_count(),
            inflight_count: self.inflight.len(),
        }
    }

    fn spawn_request(
        &self,
        key: String,
        request: HttpRequest,
        strategy: CacheStrategy,
    ) -> InflightRequest {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let transport = Arc::clone(&self.transport);
        let clock = Arc::clone(&self.clock);
        let entries = self.entries.clone();
        let guard = InflightGuard {
            inflight: Arc::clone(&self.inflight),
            key: key.clone(),
            generation,
        };

        let task = tokio::spawn(async move {
            let _guard = guard;
            let data = execute_request(transport.as_ref(), request).await?;
            if strategy.stores() {
                let fetched_at = clock.now_ms();
                let entry = CachedResponse {
                    data: data.clone(),
                    fetched_at,
                    expires_at: fetched_at.saturating_add(strategy.ttl_ms),
                };
                entries.insert(key, Arc::new(entry)).await;
            }
            Ok(data)
        });

        let abort = task.abort_handle();
        let shared = async move { task.await.unwrap_or_else(|e| Err(FetchError::from(e))) }
            .boxed()
            .shared();

        InflightRequest {
            generation,
            shared,
            abort,
        }
    }
}

impl std::fmt::Debug for RequestCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCache")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Perform one request and decode its JSON body
///
/// # Errors
/// Transport errors, non-2xx statuses (message parsed from the body) and
/// undecodable bodies.
pub async fn execute_request(
    transport: &dyn Transport,
    request: HttpRequest,
) -> Result<Value, FetchError> {
    let response = transport.send(request).await?;
    if !response.is_success() {
        return Err(FetchError::from_response(
            response.status,
            &response.status_text,
            &response.body,
        ));
    }
    if response.body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&response.body).map_err(|e| FetchError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::transport::{HttpResponse, MockTransport};
    use async_trait::async_trait;
    use futures::future::join_all;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Counts calls and answers with the call number after a short delay
    struct CountingTransport {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl CountingTransport {
        fn new(delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: Duration::from_millis(delay_ms),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn send(&self, _request: HttpRequest) -> Result<HttpResponse, FetchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            Ok(HttpResponse::json(&json!({ "call": n })))
        }
    }

    fn cache_with(transport: Arc<dyn Transport>, clock: Arc<ManualClock>) -> RequestCache {
        RequestCache::new(transport, clock, 100)
    }

    fn ttl(ms: u64) -> CacheStrategy {
        CacheStrategy::with_ttl(Duration::from_millis(ms))
    }

    #[test]
    fn cache_key_format() {
        assert_eq!(cache_key(Method::Get, "/api/files", None), "GET:/api/files:");
        assert_eq!(
            cache_key(Method::Post, "/api/files/batch", Some(&json!({"ids": [1]}))),
            r#"POST:/api/files/batch:{"ids":[1]}"#
        );
    }

    #[tokio::test]
    async fn fresh_response_is_served_from_cache() {
        let transport = CountingTransport::new(0);
        let clock = Arc::new(ManualClock::new(1_000));
        let cache = cache_with(transport.clone(), clock.clone());

        let first = cache.fetch_with_cache("/a", FetchOptions::get(ttl(100))).await.unwrap();
        clock.advance(Duration::from_millis(99));
        let second = cache.fetch_with_cache("/a", FetchOptions::get(ttl(100))).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(transport.calls(), 1);

        clock.advance(Duration::from_millis(1));
        let third = cache.fetch_with_cache("/a", FetchOptions::get(ttl(100))).await.unwrap();
        assert_eq!(third, json!({"call": 2}));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn stale_inside_window_is_served_without_network() {
        let transport = CountingTransport::new(0);
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache_with(transport.clone(), clock.clone());
        let strategy = ttl(100).with_stale_while_revalidate(Duration::from_millis(50));

        cache.fetch_with_cache("/a", FetchOptions::get(strategy)).await.unwrap();
        clock.set(149);
        let stale = cache.fetch_with_cache("/a", FetchOptions::get(strategy)).await.unwrap();
        assert_eq!(stale, json!({"call": 1}));
        assert_eq!(transport.calls(), 1);

        clock.set(150);
        cache.fetch_with_cache("/a", FetchOptions::get(strategy)).await.unwrap();
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn zero_ttl_never_stores() {
        let transport = CountingTransport::new(0);
        let cache = cache_with(transport.clone(), Arc::new(ManualClock::new(0)));

        cache.fetch_with_cache("/a", FetchOptions::get(CacheStrategy::NONE)).await.unwrap();
        cache.fetch_with_cache("/a", FetchOptions::get(CacheStrategy::NONE)).await.unwrap();
        assert_eq!(transport.calls(), 2);
        assert!(cache.cached("GET:/a:").await.is_none());
    }

    #[tokio::test]
    async fn concurrent_identical_requests_are_deduplicated() {
        let transport = CountingTransport::new(30);
        let cache = cache_with(transport.clone(), Arc::new(ManualClock::new(0)));
        let options = FetchOptions::get(CacheStrategy::NONE.deduplicated());

        let results = join_all((0..5).map(|_| cache.fetch_with_cache("/a", options.clone()))).await;

        assert_eq!(transport.calls(), 1);
        assert!(results.iter().all(|r| r.as_ref().unwrap() == &json!({"call": 1})));
        assert_eq!(cache.stats().inflight_count, 0);
    }

    #[tokio::test]
    async fn new_request_supersedes_in_flight_one() {
        let transport = CountingTransport::new(50);
        let cache = Arc::new(cache_with(transport.clone(), Arc::new(ManualClock::new(0))));
        let options = FetchOptions::get(ttl(1_000));

        let first = {
            let cache = Arc::clone(&cache);
            let options = options.clone();
            tokio::spawn(async move { cache.fetch_with_cache("/a", options).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = cache.fetch_with_cache("/a", options).await;

        assert_eq!(first.await.unwrap(), Err(FetchError::Cancelled));
        assert_eq!(second.unwrap(), json!({"call": 2}));
        let stored = cache.cached("GET:/a:").await.unwrap();
        assert_eq!(stored.data, json!({"call": 2}));
        assert!(!cache.is_inflight("GET:/a:"));
    }

    #[tokio::test]
    async fn skip_cache_bypasses_everything() {
        let transport = CountingTransport::new(0);
        let cache = cache_with(transport.clone(), Arc::new(ManualClock::new(0)));

        cache.fetch_with_cache("/a", FetchOptions::get(ttl(1_000))).await.unwrap();
        let direct = cache
            .fetch_with_cache("/a", FetchOptions::direct(Method::Get, None))
            .await
            .unwrap();

        assert_eq!(direct, json!({"call": 2}));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn failures_are_not_cached_and_release_the_key() {
        let mut mock = MockTransport::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(HttpResponse::with_status(500, &json!({"message": "db down"}))));
        mock.expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(HttpResponse::json(&json!({"ok": true}))));

        let cache = cache_with(Arc::new(mock), Arc::new(ManualClock::new(0)));
        let options = FetchOptions::get(ttl(1_000).deduplicated());

        let err = cache.fetch_with_cache("/a", options.clone()).await.unwrap_err();
        assert_eq!(
            err,
            FetchError::Server {
                status: 500,
                message: "db down".into()
            }
        );
        assert!(!cache.is_inflight("GET:/a:"));

        let ok = cache.fetch_with_cache("/a", options).await.unwrap();
        assert_eq!(ok, json!({"ok": true}));
    }

    #[tokio::test]
    async fn request_shape_reaches_transport() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .withf(|req| {
                req.method == Method::Post
                    && req.url == "/api/files/batch"
                    && req.body == Some(json!({"ids": [1, 2]}))
            })
            .times(1)
            .returning(|_| Ok(HttpResponse::json(&json!({"data": []}))));

        let cache = cache_with(Arc::new(mock), Arc::new(ManualClock::new(0)));
        let options =
            FetchOptions::with_body(Method::Post, json!({"ids": [1, 2]}), CacheStrategy::NONE);
        let value: serde_json::Map<String, Value> =
            cache.fetch_json("/api/files/batch", options).await.unwrap();
        assert!(value.contains_key("data"));
    }

    #[tokio::test]
    async fn invalidate_matching_drops_selected_entries() {
        let transport = CountingTransport::new(0);
        let cache = cache_with(transport.clone(), Arc::new(ManualClock::new(0)));

        cache
            .fetch_with_cache("/api/files?type=question", FetchOptions::get(ttl(1_000)))
            .await
            .unwrap();
        cache.fetch_with_cache("/other", FetchOptions::get(ttl(1_000))).await.unwrap();

        cache.invalidate_matching(|k| k.starts_with("GET:/api/files"));
        cache
            .fetch_with_cache("/api/files?type=question", FetchOptions::get(ttl(1_000)))
            .await
            .unwrap();
        cache.fetch_with_cache("/other", FetchOptions::get(ttl(1_000))).await.unwrap();

        assert_eq!(transport.calls(), 3);
    }
}
