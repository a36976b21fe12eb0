//! 响应缓存模块：两级缓存与防击穿的源调用协调。
//!
//! # Response Cache
//!
//! Fronts an expensive generative inference call with a deterministic,
//! two-tier cache. Concurrent identical requests trigger at most one origin call.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`ResponseCache`] | Entry point: `fetch`, invalidation, stats |
//! | [`Fingerprinter`] | Deterministic request keys from normalized inputs |
//! | [`TtlPolicy`] | Per request-class expiry |
//! | [`Codec`] | Gzip for payloads above a size threshold |
//! | [`HotTier`] | Process-local LRU |
//! | [`WarmTier`] | Shared durable tier over a [`WarmStore`] (Redis or in-memory) |
//! | [`LeaseTable`] | Per-key single-flight build leases |
//! | [`MetricsRecorder`] | Hit/miss counters and cost-saved estimate |
//!
//! ## Example
//!
//! ```rust,no_run
//! use ai_lib_cache::cache::{CacheConfig, CacheRequest, ResponseCache};
//! use bytes::Bytes;
//!
//! # async fn run() -> ai_lib_cache::Result<()> {
//! let cache = ResponseCache::new(CacheConfig::default())?;
//! let request = CacheRequest::new("user-42", "What's my calorie target?", "chat", "gpt-4o");
//! let response = cache
//!     .fetch(&request, || async { Ok(Bytes::from_static(b"2100 kcal")) })
//!     .await?;
//! println!("served from {}", response.tier);
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod entry;
pub mod hot;
pub mod invalidation;
pub mod key;
pub mod lease;
pub mod metrics;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod ttl;
pub mod warm;

pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::Codec;
pub use config::CacheConfig;
pub use coordinator::{CacheHealth, CachedResponse, ResponseCache, ResponseCacheBuilder};
pub use entry::CacheEntry;
pub use hot::HotTier;
pub use invalidation::{InvalidationFilter, InvalidationReport};
pub use key::{normalize_prompt, CacheKey, CacheRequest, Fingerprinter, RequestContext};
pub use lease::{LeaseOutcome, LeaseTable};
pub use metrics::{
    CacheEvent, CacheStats, HitTier, InMemoryMetricsSink, MetricsRecorder, MetricsSink,
    NoopMetricsSink, TracingMetricsSink,
};
#[cfg(feature = "redis")]
pub use redis_store::RedisWarmStore;
pub use ttl::{TtlPolicy, TtlResolution};
pub use warm::{MemoryWarmStore, WarmStore, WarmTier, WarmTierOptions};
