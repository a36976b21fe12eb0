//! 弹性模式模块：保护共享缓存层的熔断器。
//!
//! # Resilience Primitives
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`circuit_breaker`] | Consecutive-failure breaker used by the warm tier |
//!
//! While open, the breaker fails calls fast so a down store costs no latency;
//! after the cooldown a single trial call decides whether it closes again.

pub mod circuit_breaker;
