//! # ai-lib-cache
//!
//! 面向生成式推理调用的智能响应缓存：请求指纹、两级存储、按类别 TTL、压缩与防击穿协调。
//!
//! Intelligent response cache for expensive, latency-heavy inference calls.
//!
//! ## Overview
//!
//! Every request is fingerprinted into a [`CacheKey`]. Lookups go to a
//! process-local LRU tier first, then to a shared warm tier (Redis), and only
//! then to the origin. Concurrent callers for the same key are coalesced
//! behind a build lease so the origin is invoked once.
//!
//! ## Key Features
//!
//! - **Deterministic keys**: cosmetic prompt variants and volatile context share a key
//! - **Two tiers**: the warm tier is authoritative and survives hot-tier eviction
//! - **Stampede protection**: in-process single-flight plus a write-if-absent
//!   lease in the warm tier
//! - **Graceful degradation**: warm-tier faults become misses behind a circuit breaker
//! - **Cost tracking**: hits are credited with the estimated origin cost they avoided
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`cache`] | Fingerprints, tiers, leases, the `fetch` path, invalidation, metrics |
//! | [`pricing`] | Model pricing and per-class origin cost estimates |
//! | [`resilience`] | Circuit breaker guarding the warm tier |
//! | [`error`] | Error type with structured context |

pub mod cache;
pub mod pricing;
pub mod resilience;

pub use cache::{
    CacheConfig, CacheKey, CacheRequest, CacheStats, CachedResponse, HitTier,
    InvalidationFilter, RequestContext, ResponseCache,
};
pub use pricing::{CostTable, ModelPricing};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
