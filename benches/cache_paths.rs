//! Benchmarks for the request-path hot spots
//!
//! This benchmark measures:
//! - Fingerprint generation
//! - Hot tier get/put
//! - Payload compression around the threshold
//! - A full `fetch` served from the hot tier

use ai_lib_cache::cache::{
    CacheConfig, CacheEntry, CacheKey, CacheRequest, Codec, Fingerprinter, HotTier,
    RequestContext, ResponseCache,
};
use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;

fn bench_fingerprint(c: &mut Criterion) {
    let fp = Fingerprinter::new().with_salt("v1");
    let ctx = RequestContext::new()
        .with_stable("goal", "weight_loss")
        .with_stable("allergies", serde_json::json!(["peanut", "shellfish"]))
        .with_volatile("request_id", "r-123");

    c.bench_function("fingerprint", |b| {
        b.iter(|| {
            fp.fingerprint(
                black_box("user-42"),
                black_box("  What's my calorie   target? "),
                &ctx,
                "chat",
                "gpt-4o",
            )
        })
    });
}

fn entry(key: &CacheKey) -> CacheEntry {
    CacheEntry::build(
        key.clone(),
        Bytes::from_static(b"cached response body"),
        &Codec::default(),
        "chat",
        "user-42",
        0,
        Duration::from_secs(3600),
    )
}

fn bench_hot_tier(c: &mut Criterion) {
    let mut group = c.benchmark_group("hot_tier");
    for capacity in [1_000usize, 10_000] {
        let tier = HotTier::new(capacity).unwrap();
        let keys: Vec<CacheKey> = (0..capacity)
            .map(|i| CacheKey::new(format!("{:064x}", i)))
            .collect();
        for key in &keys {
            tier.put(key.clone(), entry(key), 0);
        }
        group.bench_with_input(BenchmarkId::new("get", capacity), &keys, |b, keys| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % keys.len();
                black_box(tier.get(&keys[i], 1))
            })
        });
        group.bench_with_input(BenchmarkId::new("put_evicting", capacity), &capacity, |b, _| {
            let mut i = 0u64;
            b.iter(|| {
                i += 1;
                let key = CacheKey::new(format!("new-{}", i));
                tier.put(key.clone(), entry(&key), 0);
            })
        });
    }
    group.finish();
}

fn bench_codec(c: &mut Criterion) {
    let codec = Codec::default();
    let mut group = c.benchmark_group("codec");
    for size in [4 * 1024usize, 50 * 1024] {
        let line = "Lunch: grilled chicken, quinoa, spinach. ";
        let payload = Bytes::from(line.repeat(size / line.len() + 1));
        group.throughput(Throughput::Bytes(payload.len() as u64));
        group.bench_with_input(BenchmarkId::new("maybe_compress", size), &payload, |b, p| {
            b.iter(|| codec.maybe_compress(black_box(p.clone())))
        });
    }
    group.finish();
}

fn bench_fetch_hot_hit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let cache = ResponseCache::new(CacheConfig::default()).unwrap();
    let request = CacheRequest::new("user-42", "What's my calorie target?", "chat", "gpt-4o");
    rt.block_on(cache.put(&request, Bytes::from_static(b"2100 kcal")));

    c.bench_function("fetch_hot_hit", |b| {
        b.to_async(&rt).iter(|| async {
            cache
                .fetch(&request, || async { Ok(Bytes::new()) })
                .await
                .unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_fingerprint,
    bench_hot_tier,
    bench_codec,
    bench_fetch_hot_hit
);
criterion_main!(benches);
