//! Origin call coordination: the `fetch` path.
//!
//! Lookup order is hot tier, warm tier, then a build lease. Only the lease
//! holder calls the origin; concurrent callers for the same key wait on the
//! lease and are served the builder's result.

use super::clock::{system_clock, Clock};
use super::codec::Codec;
use super::config::CacheConfig;
use super::entry::CacheEntry;
use super::hot::HotTier;
use super::key::{CacheKey, CacheRequest, Fingerprinter};
use super::lease::{cancelled, Acquire, BuildLease, LeaseOutcome, LeaseTable, WaitResult};
use super::metrics::{CacheStats, HitTier, MetricsRecorder, MetricsSink, NoopMetricsSink};
use super::ttl::TtlPolicy;
use super::warm::{WarmStore, WarmTier};
use crate::pricing::CostTable;
use crate::resilience::circuit_breaker::CircuitBreakerSnapshot;
use crate::{Error, Result};
use arc_swap::ArcSwap;
use bytes::Bytes;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Lease acquisitions a single `fetch` attempts (abandoned or expired leases
/// are retried) before calling the origin uncached.
const MAX_LEASE_ATTEMPTS: usize = 3;

/// Result of a `fetch`.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    /// The original (decompressed) response bytes.
    pub payload: Bytes,
    pub tier: HitTier,
    pub key: CacheKey,
}

#[derive(Debug, Clone)]
pub struct CacheHealth {
    pub enabled: bool,
    pub hot_entries: usize,
    pub hot_capacity: usize,
    pub warm_backend: Option<&'static str>,
    pub warm_available: bool,
    pub warm_breaker: Option<CircuitBreakerSnapshot>,
    pub leases_in_flight: usize,
}

/// Outcome of contending for the cross-instance lease.
enum RemoteLease {
    /// This instance owns the shared lease and must release it.
    Held,
    /// Store unavailable; proceed with local-only coordination.
    Unavailable,
    /// Another instance finished the build while we polled.
    Built(CacheEntry),
    TimedOut,
    Cancelled,
}

pub struct ResponseCacheBuilder {
    config: CacheConfig,
    warm_store: Option<Arc<dyn WarmStore>>,
    clock: Option<Arc<dyn Clock>>,
    sink: Option<Arc<dyn MetricsSink>>,
    costs: Option<CostTable>,
}

impl ResponseCacheBuilder {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            warm_store: None,
            clock: None,
            sink: None,
            costs: None,
        }
    }

    /// Use `store` as the warm tier instead of connecting to `redis_url`.
    pub fn with_warm_store(mut self, store: Arc<dyn WarmStore>) -> Self {
        self.warm_store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_cost_table(mut self, costs: CostTable) -> Self {
        self.costs = Some(costs);
        self
    }

    pub fn build(self) -> Result<ResponseCache> {
        self.config.validate()?;
        let store = match self.warm_store {
            Some(store) => Some(store),
            None => connect_warm_store(&self.config)?,
        };
        let warm = store.map(|s| WarmTier::new(s, self.config.warm_options()));

        let mut fingerprinter = Fingerprinter::new();
        if let Some(ref salt) = self.config.key_salt {
            fingerprinter = fingerprinter.with_salt(salt.clone());
        }
        let codec = Codec::new(self.config.compression_threshold)
            .with_level(self.config.compression_level);
        let metrics = MetricsRecorder::new(
            self.costs.unwrap_or_default(),
            self.sink.unwrap_or_else(|| Arc::new(NoopMetricsSink)),
        );

        tracing::info!(
            enabled = self.config.enabled,
            hot_capacity = self.config.hot_capacity,
            warm = warm.as_ref().map(|w| w.backend_name()).unwrap_or("none"),
            "response cache initialized"
        );

        Ok(ResponseCache {
            ttl: ArcSwap::from_pointee(self.config.ttl_policy()?),
            hot: HotTier::new(self.config.hot_capacity)?.with_max_ttl(self.config.hot_max_ttl),
            leases: Arc::new(LeaseTable::new(self.config.lease_ttl)),
            clock: self.clock.unwrap_or_else(system_clock),
            warned_classes: Mutex::new(HashSet::new()),
            fingerprinter,
            codec,
            warm,
            metrics,
            config: self.config,
        })
    }
}

#[cfg(feature = "redis")]
fn connect_warm_store(config: &CacheConfig) -> Result<Option<Arc<dyn WarmStore>>> {
    match config.redis_url {
        Some(ref url) => {
            let store = super::redis_store::RedisWarmStore::connect(
                url,
                config.namespace.clone(),
                config.redis_pool_size,
                config.warm_timeout,
            )?;
            Ok(Some(Arc::new(store)))
        }
        None => Ok(None),
    }
}

#[cfg(not(feature = "redis"))]
fn connect_warm_store(config: &CacheConfig) -> Result<Option<Arc<dyn WarmStore>>> {
    if config.redis_url.is_some() {
        tracing::warn!("redis_url set but the `redis` feature is disabled; running hot-tier only");
    }
    Ok(None)
}

/// Two-tier response cache with stampede protection.
///
/// One instance per process, shared behind an `Arc`. A `None` warm tier runs
/// hot-tier only, with leases coordinating callers within this process.
pub struct ResponseCache {
    pub(super) config: CacheConfig,
    pub(super) fingerprinter: Fingerprinter,
    pub(super) ttl: ArcSwap<TtlPolicy>,
    pub(super) codec: Codec,
    pub(super) hot: HotTier,
    pub(super) warm: Option<WarmTier>,
    pub(super) leases: Arc<LeaseTable>,
    pub(super) metrics: MetricsRecorder,
    pub(super) clock: Arc<dyn Clock>,
    warned_classes: Mutex<HashSet<String>>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Result<Self> {
        ResponseCacheBuilder::new(config).build()
    }

    pub fn builder(config: CacheConfig) -> ResponseCacheBuilder {
        ResponseCacheBuilder::new(config)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn key_for(&self, request: &CacheRequest) -> CacheKey {
        self.fingerprinter.fingerprint_request(request)
    }

    /// Serve `request` from cache, calling `origin` at most once per key across
    /// concurrent callers.
    pub async fn fetch<F, Fut>(&self, request: &CacheRequest, origin: F) -> Result<CachedResponse>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes>>,
    {
        self.fetch_inner(request, origin, None).await
    }

    /// Like [`fetch`](Self::fetch), but waiting on another caller's build stops
    /// with [`Error::Cancelled`] once `cancel` fires. The shared build carries on.
    pub async fn fetch_with_cancel<F, Fut>(
        &self,
        request: &CacheRequest,
        origin: F,
        cancel: &CancellationToken,
    ) -> Result<CachedResponse>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes>>,
    {
        self.fetch_inner(request, origin, Some(cancel)).await
    }

    async fn fetch_inner<F, Fut>(
        &self,
        request: &CacheRequest,
        origin: F,
        cancel: Option<&CancellationToken>,
    ) -> Result<CachedResponse>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes>>,
    {
        let key = self.key_for(request);
        if !self.config.enabled {
            return self.bypass(key, origin).await;
        }

        for attempt in 1..=MAX_LEASE_ATTEMPTS {
            if let Some((payload, tier)) = self.lookup(&key).await {
                return Ok(self.hit(request, key, payload, tier));
            }

            let waiter = match self.leases.acquire(&key) {
                Acquire::Builder(lease) => {
                    return self.build(request, key, lease, origin, cancel).await;
                }
                Acquire::Waiter(waiter) => waiter,
            };
            tracing::debug!(key = %key, attempt, "lease held elsewhere, waiting");
            match waiter.wait(self.config.lease_wait_timeout, cancel).await {
                WaitResult::Resolved(LeaseOutcome::Ready(built)) => {
                    let payload = match self.lookup(&key).await {
                        Some((payload, _)) => payload,
                        None => built,
                    };
                    return Ok(self.hit(request, key, payload, HitTier::Coordinated));
                }
                WaitResult::Resolved(LeaseOutcome::Failed(err)) => {
                    self.metrics.record_miss_with_error();
                    return Err(Error::Coalesced(err));
                }
                WaitResult::Resolved(LeaseOutcome::Abandoned) | WaitResult::Expired => {
                    tracing::debug!(key = %key, "lease abandoned, contending again");
                }
                WaitResult::TimedOut => {
                    tracing::warn!(key = %key, "lease wait timed out, calling origin uncached");
                    return self.bypass(key, origin).await;
                }
                WaitResult::Cancelled => return Err(Error::Cancelled { key: key.to_string() }),
            }
        }
        tracing::warn!(key = %key, "lease repeatedly abandoned, calling origin uncached");
        self.bypass(key, origin).await
    }

    fn hit(
        &self,
        request: &CacheRequest,
        key: CacheKey,
        payload: Bytes,
        tier: HitTier,
    ) -> CachedResponse {
        self.metrics.record_hit(tier);
        self.metrics.record_saving(&request.request_class);
        CachedResponse { payload, tier, key }
    }

    async fn bypass<F, Fut>(&self, key: CacheKey, origin: F) -> Result<CachedResponse>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes>>,
    {
        match origin().await {
            Ok(payload) => {
                self.metrics.record_bypass();
                Ok(CachedResponse {
                    payload,
                    tier: HitTier::Bypass,
                    key,
                })
            }
            Err(e) => {
                self.metrics.record_miss_with_error();
                Err(e)
            }
        }
    }

    /// Hot tier, then warm tier. Undecodable entries are dropped and count as misses.
    async fn lookup(&self, key: &CacheKey) -> Option<(Bytes, HitTier)> {
        let now = self.clock.now_ms();
        if let Some(entry) = self.hot.get(key, now) {
            match entry.response(&self.codec) {
                Ok(payload) => return Some((payload, HitTier::Hot)),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "corrupt hot tier entry dropped");
                    self.hot.remove(key);
                }
            }
        }

        let warm = self.warm.as_ref()?;
        let entry = warm.get(key).await?;
        if entry.is_expired(self.clock.now_ms()) {
            return None;
        }
        match entry.response(&self.codec) {
            Ok(payload) => {
                self.promote(key, entry);
                Some((payload, HitTier::Warm))
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "corrupt warm tier entry treated as miss");
                None
            }
        }
    }

    /// Copy a warm entry into the hot tier. The warm copy wins over a differing hot one.
    fn promote(&self, key: &CacheKey, entry: CacheEntry) {
        let now = self.clock.now_ms();
        match self.hot.peek_live(key, now) {
            Some(current) if current.same_value(&entry) => {}
            Some(_) => {
                tracing::debug!(key = %key, "hot copy differs from warm, refreshing");
                self.hot.put(key.clone(), entry, now);
            }
            None => self.hot.put(key.clone(), entry, now),
        }
    }

    async fn build<F, Fut>(
        &self,
        request: &CacheRequest,
        key: CacheKey,
        lease: BuildLease,
        origin: F,
        cancel: Option<&CancellationToken>,
    ) -> Result<CachedResponse>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes>>,
    {
        let holder = lease.holder_token().to_string();
        let remote = match self.warm {
            Some(ref warm) => self.contend_remote(warm, &key, &holder, cancel).await,
            None => RemoteLease::Unavailable,
        };
        let held = match remote {
            RemoteLease::Held => true,
            RemoteLease::Unavailable => false,
            RemoteLease::Built(entry) => {
                let payload = match entry.response(&self.codec) {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!(
                            key = %key,
                            error = %e,
                            "remote build unreadable, calling origin uncached"
                        );
                        return self.bypass_resolving(key, lease, origin).await;
                    }
                };
                self.promote(&key, entry);
                lease.resolve(LeaseOutcome::Ready(payload.clone()));
                return Ok(self.hit(request, key, payload, HitTier::Coordinated));
            }
            RemoteLease::TimedOut => {
                tracing::warn!(key = %key, "remote lease wait timed out, calling origin uncached");
                return self.bypass_resolving(key, lease, origin).await;
            }
            RemoteLease::Cancelled => return Err(Error::Cancelled { key: key.to_string() }),
        };

        // A build that finished between our miss and taking the lease is served as is.
        if let Some((payload, _)) = self.lookup(&key).await {
            tracing::debug!(key = %key, "entry landed while taking the lease, origin skipped");
            lease.resolve(LeaseOutcome::Ready(payload.clone()));
            if held {
                self.release_remote(&key, &holder).await;
            }
            return Ok(self.hit(request, key, payload, HitTier::Coordinated));
        }

        let result = origin().await;
        let outcome = match result {
            Ok(payload) => {
                let entry = self.make_entry(request, &key, payload.clone());
                let ttl = self.resolve_ttl(&request.request_class);
                if let Some(ref warm) = self.warm {
                    warm.put(&key, &entry, ttl).await;
                }
                self.hot.put(key.clone(), entry, self.clock.now_ms());
                lease.resolve(LeaseOutcome::Ready(payload.clone()));
                self.metrics.record_miss();
                tracing::debug!(
                    key = %key,
                    class = %request.request_class,
                    "origin response cached"
                );
                Ok(CachedResponse {
                    payload,
                    tier: HitTier::Origin,
                    key: key.clone(),
                })
            }
            Err(e) => {
                tracing::debug!(key = %key, error = %e, "origin failed, nothing cached");
                lease.resolve(LeaseOutcome::Failed(Arc::new(e.duplicate())));
                self.metrics.record_miss_with_error();
                Err(e)
            }
        };

        if held {
            self.release_remote(&key, &holder).await;
        }
        outcome
    }

    async fn release_remote(&self, key: &CacheKey, holder: &str) {
        if let Some(ref warm) = self.warm {
            if let Err(e) = warm.release_lease(key, holder).await {
                tracing::debug!(
                    key = %key,
                    error = %e,
                    "remote lease release failed, left to expire"
                );
            }
        }
    }

    /// Uncached origin call made while holding the local lease; local waiters
    /// still get the result.
    async fn bypass_resolving<F, Fut>(
        &self,
        key: CacheKey,
        lease: BuildLease,
        origin: F,
    ) -> Result<CachedResponse>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes>>,
    {
        match origin().await {
            Ok(payload) => {
                lease.resolve(LeaseOutcome::Ready(payload.clone()));
                self.metrics.record_bypass();
                Ok(CachedResponse {
                    payload,
                    tier: HitTier::Bypass,
                    key,
                })
            }
            Err(e) => {
                lease.resolve(LeaseOutcome::Failed(Arc::new(e.duplicate())));
                self.metrics.record_miss_with_error();
                Err(e)
            }
        }
    }

    /// Claim the shared lease, or poll the warm tier while another instance builds.
    async fn contend_remote(
        &self,
        warm: &WarmTier,
        key: &CacheKey,
        holder: &str,
        cancel: Option<&CancellationToken>,
    ) -> RemoteLease {
        let deadline = Instant::now() + self.config.lease_wait_timeout;
        loop {
            if Instant::now() >= deadline {
                return RemoteLease::TimedOut;
            }
            match warm.try_acquire_lease(key, holder, self.leases.lease_ttl()).await {
                Ok(true) => return RemoteLease::Held,
                Ok(false) => {}
                Err(e) => {
                    tracing::debug!(
                        key = %key,
                        error = %e,
                        "shared lease unavailable, coordinating locally"
                    );
                    return RemoteLease::Unavailable;
                }
            }
            tracing::debug!(key = %key, "key is being built by another instance");

            loop {
                match warm.lease_holder(key).await {
                    Ok(Some(ref owner)) if self.leases.is_stale_holder(owner) => {
                        // left behind by a build of ours that was dropped mid-flight
                        tracing::debug!(key = %key, %owner, "reclaiming stale shared lease");
                        if let Err(e) = warm.release_lease(key, owner).await {
                            tracing::debug!(key = %key, error = %e, "stale lease release failed");
                            return RemoteLease::Unavailable;
                        }
                        break;
                    }
                    Ok(Some(_)) => {}
                    // released or expired without a result: contend again
                    Ok(None) => break,
                    Err(_) => return RemoteLease::Unavailable,
                }

                let now = Instant::now();
                if now >= deadline {
                    return RemoteLease::TimedOut;
                }
                let nap = self.config.lease_poll_interval.min(deadline - now);
                tokio::select! {
                    _ = tokio::time::sleep(nap) => {}
                    _ = cancelled(cancel) => return RemoteLease::Cancelled,
                }
                if let Some(entry) = warm.get(key).await {
                    if !entry.is_expired(self.clock.now_ms()) {
                        return RemoteLease::Built(entry);
                    }
                }
            }
        }
    }

    fn make_entry(&self, request: &CacheRequest, key: &CacheKey, payload: Bytes) -> CacheEntry {
        CacheEntry::build(
            key.clone(),
            payload,
            &self.codec,
            request.request_class.clone(),
            request.requester.clone(),
            self.clock.now_ms(),
            self.resolve_ttl(&request.request_class),
        )
    }

    fn resolve_ttl(&self, request_class: &str) -> std::time::Duration {
        let resolution = self.ttl.load().resolve(request_class);
        if resolution.defaulted {
            let mut warned = self.warned_classes.lock().unwrap_or_else(|p| p.into_inner());
            if warned.insert(request_class.to_string()) {
                tracing::warn!(
                    class = %request_class,
                    ttl_secs = resolution.ttl.as_secs(),
                    "no TTL mapping for request class, using default"
                );
            }
        }
        resolution.ttl
    }

    /// Store a response without going through the origin (pre-warming).
    pub async fn put(&self, request: &CacheRequest, payload: Bytes) -> CacheKey {
        let key = self.key_for(request);
        if !self.config.enabled {
            return key;
        }
        let entry = self.make_entry(request, &key, payload);
        if let Some(ref warm) = self.warm {
            warm.put(&key, &entry, self.resolve_ttl(&request.request_class)).await;
        }
        self.hot.put(key.clone(), entry, self.clock.now_ms());
        key
    }

    /// Cached response for `key`, if any. Records no metrics and does not
    /// promote or touch recency.
    pub async fn get(&self, key: &CacheKey) -> Option<Bytes> {
        self.peek_entry(key)
            .await
            .and_then(|entry| entry.response(&self.codec).ok())
    }

    /// Raw stored entry, hot tier first.
    pub async fn peek_entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        let now = self.clock.now_ms();
        if let Some(entry) = self.hot.peek_live(key, now) {
            return Some(entry);
        }
        self.warm
            .as_ref()?
            .get(key)
            .await
            .filter(|e| !e.is_expired(now))
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hot_entries: self.hot.len(),
            hot_evictions: self.hot.evictions(),
            warm_failures: self.warm.as_ref().map(|w| w.failures()).unwrap_or(0),
            ..self.metrics.snapshot()
        }
    }

    pub async fn health(&self) -> CacheHealth {
        let warm_available = match self.warm {
            Some(ref warm) => warm.is_available().await,
            None => false,
        };
        CacheHealth {
            enabled: self.config.enabled,
            hot_entries: self.hot.len(),
            hot_capacity: self.hot.capacity(),
            warm_backend: self.warm.as_ref().map(|w| w.backend_name()),
            warm_available,
            warm_breaker: self.warm.as_ref().map(|w| w.breaker_snapshot()),
            leases_in_flight: self.leases.in_flight(),
        }
    }

    /// Drop every hot-tier entry of this process. The warm tier is untouched.
    pub fn clear_local(&self) {
        self.hot.clear();
    }

    pub fn ttl_policy(&self) -> Arc<TtlPolicy> {
        self.ttl.load_full()
    }

    /// Swap the TTL table at runtime. Applies to entries written afterwards.
    pub fn update_ttl_policy(&self, policy: TtlPolicy) {
        self.ttl.store(Arc::new(policy));
        self.warned_classes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
        tracing::info!("ttl policy updated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::ManualClock;
    use crate::cache::warm::MemoryWarmStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn setup() -> (Arc<ManualClock>, Arc<MemoryWarmStore>, ResponseCache) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = Arc::new(MemoryWarmStore::new(clock.clone()));
        let cache = ResponseCache::builder(CacheConfig::default().with_hot_capacity(4))
            .with_warm_store(store.clone())
            .with_clock(clock.clone())
            .build()
            .unwrap();
        (clock, store, cache)
    }

    fn req(prompt: &str) -> CacheRequest {
        CacheRequest::new("user-1", prompt, "chat", "gpt-4o")
    }

    #[tokio::test]
    async fn test_miss_then_hot_hit() {
        let (_clock, _store, cache) = setup();
        let first = cache
            .fetch(&req("hi"), || async { Ok(Bytes::from_static(b"hello")) })
            .await
            .unwrap();
        assert_eq!(first.tier, HitTier::Origin);

        let second = cache
            .fetch(&req("hi"), || async { Err(Error::origin("origin must not be called")) })
            .await
            .unwrap();
        assert_eq!(second.tier, HitTier::Hot);
        assert_eq!(second.payload, Bytes::from_static(b"hello"));
        assert_eq!(second.key, first.key);

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert!(stats.estimated_cost_saved > 0.0);
    }

    #[tokio::test]
    async fn test_warm_hit_promotes_to_hot() {
        let (_clock, _store, cache) = setup();
        let key = cache.put(&req("plan"), Bytes::from_static(b"v1")).await;
        cache.clear_local();

        let r = cache
            .fetch(&req("plan"), || async { Ok(Bytes::new()) })
            .await
            .unwrap();
        assert_eq!(r.tier, HitTier::Warm);
        assert!(cache.hot.contains(&key));
    }

    #[tokio::test]
    async fn test_warm_copy_wins_over_differing_hot_copy() {
        let (clock, _store, cache) = setup();
        let request = req("plan");
        let key = cache.put(&request, Bytes::from_static(b"warm")).await;
        let warm_entry = cache.warm.as_ref().unwrap().get(&key).await.unwrap();
        let divergent = CacheEntry::build(
            key.clone(),
            Bytes::from_static(b"divergent"),
            &cache.codec,
            "chat",
            "user-1",
            clock.now_ms() - 1,
            Duration::from_secs(60),
        );
        cache.hot.put(key.clone(), divergent, clock.now_ms());

        cache.promote(&key, warm_entry);
        let hot = cache.hot.peek(&key).unwrap();
        assert_eq!(hot.response(&cache.codec).unwrap(), Bytes::from_static(b"warm"));
    }

    #[tokio::test]
    async fn test_expired_hot_copy_is_refreshed_from_warm() {
        let (clock, _store, cache) = setup();
        let request = req("plan");
        let key = cache.put(&request, Bytes::from_static(b"warm")).await;
        let stale = CacheEntry::build(
            key.clone(),
            Bytes::from_static(b"stale"),
            &cache.codec,
            "chat",
            "user-1",
            clock.now_ms() - 10_000,
            Duration::from_secs(1),
        );
        cache.hot.put(key.clone(), stale, clock.now_ms());

        let r = cache
            .fetch(&request, || async { Ok(Bytes::new()) })
            .await
            .unwrap();
        assert_eq!(r.tier, HitTier::Warm);
        assert_eq!(r.payload, Bytes::from_static(b"warm"));
        assert!(cache.hot.peek(&key).unwrap().expires_at > clock.now_ms());
    }

    #[tokio::test]
    async fn test_corrupt_warm_payload_is_rebuilt() {
        let (_clock, store, cache) = setup();
        let request = req("x");
        let key = cache.key_for(&request);
        store.insert_raw(&key, b"garbage".to_vec(), Duration::from_secs(60));

        let r = cache
            .fetch(&request, || async { Ok(Bytes::from_static(b"fresh")) })
            .await
            .unwrap();
        assert_eq!(r.tier, HitTier::Origin);
        // overwritten by the successful build
        assert!(store.len() == 1 && cache.get(&key).await.is_some());
    }

    #[tokio::test]
    async fn test_origin_error_is_not_cached() {
        let (_clock, _store, cache) = setup();
        let err = cache
            .fetch(&req("boom"), || async { Err(Error::origin("503")) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Origin { .. }));
        assert!(cache.peek_entry(&cache.key_for(&req("boom"))).await.is_none());
        assert_eq!(cache.stats().miss_errors, 1);
    }

    #[tokio::test]
    async fn test_disabled_cache_is_pass_through() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryWarmStore::new(clock.clone()));
        let cache = ResponseCache::builder(CacheConfig::default().with_enabled(false))
            .with_warm_store(store.clone())
            .build()
            .unwrap();
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        for _ in 0..2 {
            let r = cache
                .fetch(&req("hi"), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Bytes::from_static(b"x"))
                })
                .await
                .unwrap();
            assert_eq!(r.tier, HitTier::Bypass);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(store.get_count() + store.put_count(), 0);
        assert_eq!(cache.stats().bypasses, 2);
    }

    #[tokio::test]
    async fn test_unknown_class_uses_default_ttl() {
        let (_clock, _store, cache) = setup();
        let request = CacheRequest::new("u", "q", "horoscope", "m");
        let key = cache.put(&request, Bytes::from_static(b"v")).await;
        let entry = cache.peek_entry(&key).await.unwrap();
        assert_eq!(entry.expires_at - entry.created_at, 3_600_000);
    }

    #[tokio::test]
    async fn test_ttl_policy_update_applies_to_new_entries() {
        let (_clock, _store, cache) = setup();
        cache.update_ttl_policy(
            TtlPolicy::new()
                .with_class("chat", Duration::from_secs(5))
                .unwrap(),
        );
        let key = cache.put(&req("q"), Bytes::from_static(b"v")).await;
        let entry = cache.peek_entry(&key).await.unwrap();
        assert_eq!(entry.expires_at - entry.created_at, 5_000);
        assert_eq!(cache.ttl_policy().resolve("chat").ttl, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_health_reports_tiers() {
        let (_clock, store, cache) = setup();
        let health = cache.health().await;
        assert!(health.enabled && health.warm_available);
        assert_eq!(health.warm_backend, Some("memory"));
        assert_eq!(health.hot_capacity, 4);

        store.set_available(false);
        assert!(!cache.health().await.warm_available);
    }

    #[tokio::test]
    async fn test_hot_only_cache() {
        let cache = ResponseCache::new(CacheConfig::default()).unwrap();
        let r = cache
            .fetch(&req("a"), || async { Ok(Bytes::from_static(b"1")) })
            .await
            .unwrap();
        assert_eq!(r.tier, HitTier::Origin);
        let r = cache.fetch(&req("a"), || async { Ok(Bytes::new()) }).await.unwrap();
        assert_eq!(r.tier, HitTier::Hot);
        assert!(cache.health().await.warm_backend.is_none());
    }
}
