//! End-to-end lookup/store behavior of `ResponseCache` against an in-memory warm store.

use ai_lib_cache::cache::{
    CacheConfig, CacheEvent, CacheRequest, HitTier, InMemoryMetricsSink, InvalidationFilter,
    ManualClock, MemoryWarmStore, RequestContext, ResponseCache,
};
use ai_lib_cache::{Error, Result};
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

struct Harness {
    clock: Arc<ManualClock>,
    store: Arc<MemoryWarmStore>,
    cache: ResponseCache,
    calls: Arc<AtomicUsize>,
}

impl Harness {
    fn new(config: CacheConfig) -> Self {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(MemoryWarmStore::new(clock.clone()));
        let cache = ResponseCache::builder(
            config
                .with_warm_timeout(Duration::from_millis(50))
                .with_warm_retry_backoff(Duration::from_millis(1)),
        )
        .with_warm_store(store.clone())
        .with_clock(clock.clone())
        .build()
        .unwrap();
        Self {
            clock,
            store,
            cache,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    async fn fetch(
        &self,
        request: &CacheRequest,
        body: &'static str,
    ) -> Result<(Bytes, HitTier)> {
        let calls = self.calls.clone();
        let r = self
            .cache
            .fetch(request, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Bytes::from(body))
            })
            .await?;
        Ok((r.payload, r.tier))
    }

    fn origin_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn chat(user: &str, prompt: &str) -> CacheRequest {
    CacheRequest::new(user, prompt, "chat", "gpt-4o")
}

#[tokio::test]
async fn test_cosmetic_variants_hit_the_same_entry() {
    let h = Harness::new(CacheConfig::default());
    let ctx = RequestContext::new()
        .with_stable("goal", "cut")
        .with_volatile("request_id", "r-1");
    let first = chat("u1", "What's my calorie target?").with_context(ctx);
    let ctx = RequestContext::new()
        .with_stable("goal", "cut")
        .with_volatile("request_id", "r-2");
    let second = chat("u1", "  what's my CALORIE target ").with_context(ctx);

    assert_eq!(h.fetch(&first, "2100").await.unwrap().1, HitTier::Origin);
    let (payload, tier) = h.fetch(&second, "unused").await.unwrap();
    assert_eq!(tier, HitTier::Hot);
    assert_eq!(payload, Bytes::from_static(b"2100"));
    assert_eq!(h.origin_calls(), 1);
}

#[tokio::test]
async fn test_progress_analysis_expires_after_thirty_minutes() {
    let h = Harness::new(CacheConfig::default());
    let request = CacheRequest::new("u1", "how am I doing", "progress_analysis", "gpt-4o");

    h.fetch(&request, "v1").await.unwrap();
    h.clock.advance(Duration::from_secs(29 * 60));
    // the hot copy is long gone; the warm copy still serves
    assert_eq!(h.fetch(&request, "v2").await.unwrap().1, HitTier::Warm);

    h.clock.advance(Duration::from_secs(2 * 60));
    let (payload, tier) = h.fetch(&request, "v2").await.unwrap();
    assert_eq!(tier, HitTier::Origin);
    assert_eq!(payload, Bytes::from_static(b"v2"));
    assert_eq!(h.origin_calls(), 2);
}

#[tokio::test]
async fn test_large_payload_is_stored_compressed() {
    let h = Harness::new(CacheConfig::default());
    let request = CacheRequest::new("u1", "plan my week", "meal_plan", "gpt-4o");
    let body: String = "Breakfast: oats, berries and yogurt. ".repeat(50 * 1024 / 37 + 1);
    let body = &body[..50 * 1024];
    let original = Bytes::copy_from_slice(body.as_bytes());

    let origin_body = original.clone();
    let r = h
        .cache
        .fetch(&request, move || async move { Ok(origin_body) })
        .await
        .unwrap();
    assert_eq!(r.payload.len(), 50 * 1024);

    let entry = h.cache.peek_entry(&r.key).await.unwrap();
    assert!(entry.compressed);
    assert_eq!(entry.original_size, 50 * 1024);
    assert!(entry.stored_size < 50 * 1024);

    h.cache.clear_local();
    let again = h
        .cache
        .fetch(&request, || async { Err(Error::origin("not expected")) })
        .await
        .unwrap();
    assert_eq!(again.tier, HitTier::Warm);
    assert_eq!(again.payload, original);
}

#[tokio::test]
async fn test_warm_outage_never_fails_fetch() {
    let h = Harness::new(CacheConfig::default());
    let cached = chat("u1", "cached");
    h.fetch(&cached, "hot copy").await.unwrap();
    h.store.set_available(false);

    let (payload, tier) = h.fetch(&cached, "unused").await.unwrap();
    assert_eq!(tier, HitTier::Hot);
    assert_eq!(payload, Bytes::from_static(b"hot copy"));

    let (payload, tier) = h.fetch(&chat("u1", "new"), "fresh").await.unwrap();
    assert_eq!(tier, HitTier::Origin);
    assert_eq!(payload, Bytes::from_static(b"fresh"));
    assert!(h.cache.stats().warm_failures > 0);
}

#[tokio::test]
async fn test_evicted_key_is_served_from_warm_tier() {
    let h = Harness::new(CacheConfig::default().with_hot_capacity(2));
    for prompt in ["a", "b", "c"] {
        h.fetch(&chat("u1", prompt), "v").await.unwrap();
    }
    let stats = h.cache.stats();
    assert_eq!(stats.hot_entries, 2);
    assert_eq!(stats.hot_evictions, 1);

    assert_eq!(h.fetch(&chat("u1", "a"), "v").await.unwrap().1, HitTier::Warm);
    // promotion pushed "b" out instead
    assert_eq!(h.fetch(&chat("u1", "a"), "v").await.unwrap().1, HitTier::Hot);
    assert_eq!(h.origin_calls(), 3);
}

#[tokio::test]
async fn test_invalidated_key_misses_immediately() {
    let h = Harness::new(CacheConfig::default());
    let request = chat("u1", "q");
    h.fetch(&request, "v1").await.unwrap();
    let key = h.cache.key_for(&request);

    assert_eq!(assert_ok!(h.cache.invalidate(&key).await), 2);
    let (payload, tier) = h.fetch(&request, "v2").await.unwrap();
    assert_eq!(tier, HitTier::Origin);
    assert_eq!(payload, Bytes::from_static(b"v2"));
}

#[tokio::test]
async fn test_filter_invalidation_by_class() {
    let h = Harness::new(CacheConfig::default());
    h.fetch(&chat("u1", "a"), "v").await.unwrap();
    h.fetch(&chat("u2", "b"), "v").await.unwrap();
    let plan = CacheRequest::new("u1", "week", "meal_plan", "gpt-4o");
    h.fetch(&plan, "v").await.unwrap();

    let report = h
        .cache
        .invalidate_by_filter(&InvalidationFilter::new().with_request_class("chat"))
        .await
        .unwrap();
    assert_eq!(report.total, 2);
    assert_eq!(h.fetch(&plan, "v").await.unwrap().1, HitTier::Hot);
    assert_eq!(h.fetch(&chat("u2", "b"), "v").await.unwrap().1, HitTier::Origin);
    assert_eq!(h.cache.stats().invalidations, 2);

    assert_err!(h.cache.invalidate_by_filter(&InvalidationFilter::new()).await);
}

#[tokio::test]
async fn test_remote_invalidation_reaches_other_hot_tiers_within_bound() {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let store = Arc::new(MemoryWarmStore::new(clock.clone()));
    let instance = || {
        ResponseCache::builder(CacheConfig::default().with_hot_max_ttl(Duration::from_secs(300)))
            .with_warm_store(store.clone())
            .with_clock(clock.clone())
            .build()
            .unwrap()
    };
    let (a, b) = (instance(), instance());
    let plan = CacheRequest::new("u1", "plan my week", "meal_plan", "gpt-4o");

    let r = assert_ok!(b.fetch(&plan, || async { Ok(Bytes::from_static(b"old plan")) }).await);
    assert_eq!(r.tier, HitTier::Origin);

    let report = assert_ok!(
        a.invalidate_by_filter(&InvalidationFilter::new().with_requester("u1"))
            .await
    );
    assert_eq!(report.warm_removed, 1);
    assert_eq!(report.hot_removed, 0);

    // b's hot copy survives the remote purge only until its hot bound
    clock.advance(Duration::from_secs(6 * 60));
    let r = assert_ok!(b.fetch(&plan, || async { Ok(Bytes::from_static(b"new plan")) }).await);
    assert_eq!(r.tier, HitTier::Origin);
    assert_eq!(r.payload, Bytes::from_static(b"new plan"));
}

#[tokio::test]
async fn test_long_lived_entry_is_rechecked_against_warm_tier() {
    let h = Harness::new(CacheConfig::default().with_hot_max_ttl(Duration::from_secs(60)));
    let plan = CacheRequest::new("u1", "plan my week", "meal_plan", "gpt-4o");
    h.fetch(&plan, "v1").await.unwrap();

    h.clock.advance(Duration::from_secs(30));
    assert_eq!(h.fetch(&plan, "v2").await.unwrap().1, HitTier::Hot);
    h.clock.advance(Duration::from_secs(31));
    assert_eq!(h.fetch(&plan, "v2").await.unwrap().1, HitTier::Warm);
    assert_eq!(h.fetch(&plan, "v2").await.unwrap().1, HitTier::Hot);
    assert_eq!(h.origin_calls(), 1);
}

#[tokio::test]
async fn test_disabled_cache_touches_no_tier() {
    let h = Harness::new(CacheConfig::default().with_enabled(false));
    for _ in 0..3 {
        assert_eq!(h.fetch(&chat("u1", "q"), "v").await.unwrap().1, HitTier::Bypass);
    }
    assert_eq!(h.origin_calls(), 3);
    assert_eq!(h.store.put_count(), 0);
    assert_eq!(h.cache.stats().hot_entries, 0);
}

#[tokio::test]
async fn test_metrics_sink_sees_every_outcome() {
    let clock = Arc::new(ManualClock::new(0));
    let sink = Arc::new(InMemoryMetricsSink::new(100));
    let cache = ResponseCache::builder(CacheConfig::default())
        .with_warm_store(Arc::new(MemoryWarmStore::new(clock.clone())))
        .with_clock(clock)
        .with_metrics_sink(sink.clone())
        .build()
        .unwrap();
    let request = chat("u1", "q");

    cache
        .fetch(&request, || async { Ok(Bytes::from_static(b"v")) })
        .await
        .unwrap();
    cache
        .fetch(&request, || async { Ok(Bytes::from_static(b"v")) })
        .await
        .unwrap();
    assert_err!(
        cache
            .fetch(&chat("u1", "other"), || async { Err(Error::origin("down")) })
            .await
    );

    let events = sink.events();
    assert_eq!(events[0], CacheEvent::Miss);
    assert_eq!(events[1], CacheEvent::Hit { tier: HitTier::Hot });
    assert!(matches!(
        events[2],
        CacheEvent::CostSaved { ref request_class, .. } if request_class == "chat"
    ));
    assert_eq!(events[3], CacheEvent::MissWithError);

    let stats = cache.stats();
    assert!((stats.hit_rate - 1.0 / 3.0).abs() < 1e-9);
}
