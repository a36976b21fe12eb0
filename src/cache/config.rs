//! Cache configuration.
//!
//! Durations are expressed in milliseconds in YAML and environment variables.

use super::codec::DEFAULT_COMPRESSION_THRESHOLD;
use super::ttl::{TtlPolicy, DEFAULT_TTL};
use super::warm::WarmTierOptions;
use crate::resilience::circuit_breaker::CircuitBreakerConfig;
use crate::{Error, ErrorContext, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// When false, `fetch` is a pure pass-through to the origin.
    pub enabled: bool,
    pub hot_capacity: usize,
    /// Upper bound on how long a hot copy is served without consulting the
    /// warm tier, whatever the class TTL. Bounds staleness after an
    /// invalidation issued by another instance.
    #[serde(with = "duration_ms")]
    pub hot_max_ttl: Duration,
    pub compression_threshold: usize,
    pub compression_level: u32,
    #[serde(with = "duration_ms")]
    pub default_ttl: Duration,
    /// Per-class TTLs layered over the built-in table.
    #[serde(with = "duration_ms_map")]
    pub ttl: HashMap<String, Duration>,
    #[serde(with = "duration_ms")]
    pub lease_ttl: Duration,
    #[serde(with = "duration_ms")]
    pub lease_wait_timeout: Duration,
    /// How often a cross-instance waiter re-checks the warm tier.
    #[serde(with = "duration_ms")]
    pub lease_poll_interval: Duration,
    #[serde(with = "duration_ms")]
    pub warm_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub warm_retry_backoff: Duration,
    pub warm_breaker: CircuitBreakerConfig,
    pub namespace: String,
    pub key_salt: Option<String>,
    pub redis_url: Option<String>,
    pub redis_pool_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hot_capacity: 10_000,
            hot_max_ttl: Duration::from_secs(300),
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            compression_level: 1,
            default_ttl: DEFAULT_TTL,
            ttl: HashMap::new(),
            lease_ttl: Duration::from_secs(30),
            lease_wait_timeout: Duration::from_secs(10),
            lease_poll_interval: Duration::from_millis(100),
            warm_timeout: Duration::from_millis(250),
            warm_retry_backoff: Duration::from_millis(50),
            warm_breaker: CircuitBreakerConfig::default(),
            namespace: "ai-cache".to_string(),
            key_salt: None,
            redis_url: None,
            redis_pool_size: 16,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
    pub fn with_hot_capacity(mut self, capacity: usize) -> Self {
        self.hot_capacity = capacity;
        self
    }
    pub fn with_hot_max_ttl(mut self, ttl: Duration) -> Self {
        self.hot_max_ttl = ttl;
        self
    }
    pub fn with_compression_threshold(mut self, bytes: usize) -> Self {
        self.compression_threshold = bytes;
        self
    }
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }
    pub fn with_class_ttl(mut self, class: impl Into<String>, ttl: Duration) -> Self {
        self.ttl.insert(class.into(), ttl);
        self
    }
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }
    pub fn with_lease_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lease_wait_timeout = timeout;
        self
    }
    pub fn with_lease_poll_interval(mut self, interval: Duration) -> Self {
        self.lease_poll_interval = interval;
        self
    }
    pub fn with_warm_timeout(mut self, timeout: Duration) -> Self {
        self.warm_timeout = timeout;
        self
    }
    pub fn with_warm_retry_backoff(mut self, backoff: Duration) -> Self {
        self.warm_retry_backoff = backoff;
        self
    }
    pub fn with_warm_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.warm_breaker = breaker;
        self
    }
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }
    pub fn with_key_salt(mut self, salt: impl Into<String>) -> Self {
        self.key_salt = Some(salt.into());
        self
    }
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(yaml).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid cache config: {}", e),
                ErrorContext::new().with_source("yaml"),
            )
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults overridden by `AI_CACHE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(v) = lookup("AI_CACHE_ENABLED") {
            cfg.enabled = parse_bool("AI_CACHE_ENABLED", &v)?;
        }
        if let Some(v) = lookup("AI_CACHE_HOT_CAPACITY") {
            cfg.hot_capacity = parse_num("AI_CACHE_HOT_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("AI_CACHE_HOT_MAX_TTL_MS") {
            cfg.hot_max_ttl = Duration::from_millis(parse_num("AI_CACHE_HOT_MAX_TTL_MS", &v)?);
        }
        if let Some(v) = lookup("AI_CACHE_COMPRESSION_THRESHOLD") {
            cfg.compression_threshold = parse_num("AI_CACHE_COMPRESSION_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("AI_CACHE_DEFAULT_TTL_MS") {
            cfg.default_ttl = Duration::from_millis(parse_num("AI_CACHE_DEFAULT_TTL_MS", &v)?);
        }
        if let Some(v) = lookup("AI_CACHE_LEASE_TTL_MS") {
            cfg.lease_ttl = Duration::from_millis(parse_num("AI_CACHE_LEASE_TTL_MS", &v)?);
        }
        if let Some(v) = lookup("AI_CACHE_LEASE_WAIT_MS") {
            let ms = parse_num("AI_CACHE_LEASE_WAIT_MS", &v)?;
            cfg.lease_wait_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = lookup("AI_CACHE_WARM_TIMEOUT_MS") {
            cfg.warm_timeout = Duration::from_millis(parse_num("AI_CACHE_WARM_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = lookup("AI_CACHE_NAMESPACE") {
            cfg.namespace = v;
        }
        if let Some(v) = lookup("AI_CACHE_REDIS_URL") {
            cfg.redis_url = Some(v).filter(|s| !s.is_empty());
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let positive: [(&str, bool); 7] = [
            ("hot_capacity", self.hot_capacity > 0),
            ("hot_max_ttl", !self.hot_max_ttl.is_zero()),
            ("redis_pool_size", self.redis_pool_size > 0),
            ("lease_ttl", !self.lease_ttl.is_zero()),
            ("lease_wait_timeout", !self.lease_wait_timeout.is_zero()),
            ("lease_poll_interval", !self.lease_poll_interval.is_zero()),
            ("warm_timeout", !self.warm_timeout.is_zero()),
        ];
        for (field, ok) in positive {
            if !ok {
                return Err(Error::configuration_with_context(
                    "value must be greater than zero",
                    ErrorContext::new()
                        .with_field_path(field)
                        .with_source("cache_config"),
                ));
            }
        }
        self.ttl_policy().map(|_| ())
    }

    /// Built-in class table, overridden by `ttl`, with `default_ttl` as fallback.
    pub fn ttl_policy(&self) -> Result<TtlPolicy> {
        let mut policy = TtlPolicy::new().with_default(self.default_ttl)?;
        for (class, ttl) in &self.ttl {
            policy = policy.with_class(class.clone(), *ttl)?;
        }
        Ok(policy)
    }

    pub fn warm_options(&self) -> WarmTierOptions {
        WarmTierOptions {
            op_timeout: self.warm_timeout,
            retry_backoff: self.warm_retry_backoff,
            breaker: self.warm_breaker.clone(),
        }
    }
}

fn parse_num<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        Error::configuration_with_context(
            format!("expected a number, got '{}'", value),
            ErrorContext::new().with_field_path(name).with_source("env"),
        )
    })
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::configuration_with_context(
            format!("expected a boolean, got '{}'", value),
            ErrorContext::new().with_field_path(name).with_source("env"),
        )),
    }
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod duration_ms_map {
    use serde::{Deserialize, Deserializer};
    use std::collections::HashMap;
    use std::time::Duration;

    pub fn deserialize<'de, D>(d: D) -> Result<HashMap<String, Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = HashMap::<String, u64>::deserialize(d)?;
        Ok(raw
            .into_iter()
            .map(|(k, v)| (k, Duration::from_millis(v)))
            .collect())
    }
}
