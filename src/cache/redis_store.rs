//! Redis-backed warm store.
//!
//! Layout under a namespace `ns`:
//!
//! | Key | Value | Expiry |
//! |-----|-------|--------|
//! | `ns:entry:<hash>` | JSON [`CacheEntry`] record | `PSETEX`, the request-class TTL |
//! | `ns:lease:<hash>` | holder id | `SET NX PX`, the lease TTL |

use super::entry::CacheEntry;
use super::key::CacheKey;
use super::warm::WarmStore;
use crate::{Error, Result};
use async_trait::async_trait;
use deadpool_redis::{Config, Pool, PoolConfig, Runtime};
use redis::{AsyncCommands, ExistenceCheck, SetExpiry, SetOptions};
use std::time::Duration;

const RELEASE_LEASE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

const SCAN_BATCH: usize = 200;

fn storage_err(e: impl std::fmt::Display) -> Error {
    Error::storage("redis", e.to_string())
}

/// Escape glob metacharacters so a caller prefix is matched literally by `SCAN MATCH`.
fn escape_glob(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

pub struct RedisWarmStore {
    pool: Pool,
    namespace: String,
}

impl RedisWarmStore {
    pub fn from_pool(pool: Pool, namespace: impl Into<String>) -> Self {
        Self {
            pool,
            namespace: namespace.into(),
        }
    }

    /// Build a pooled store from a `redis://` URL. Does not touch the network.
    pub fn connect(
        url: &str,
        namespace: impl Into<String>,
        pool_size: usize,
        timeout: Duration,
    ) -> Result<Self> {
        let mut cfg = Config::from_url(url);
        // from_url leaves the pool section unset
        let pool_cfg = cfg.pool.get_or_insert_with(|| PoolConfig::new(pool_size));
        pool_cfg.max_size = pool_size;
        pool_cfg.timeouts.wait = Some(timeout);
        pool_cfg.timeouts.create = Some(timeout);
        pool_cfg.timeouts.recycle = Some(timeout);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(storage_err)?;
        tracing::info!(url = %url, "redis warm store configured");
        Ok(Self::from_pool(pool, namespace))
    }

    fn entry_key(&self, key: &CacheKey) -> String {
        format!("{}:entry:{}", self.namespace, key)
    }

    fn lease_key(&self, key: &CacheKey) -> String {
        format!("{}:lease:{}", self.namespace, key)
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.pool.get().await.map_err(storage_err)
    }

    fn decode(rkey: &str, data: &[u8]) -> Option<CacheEntry> {
        match CacheEntry::from_json(data) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(key = %rkey, error = %e, "undecodable warm record");
                None
            }
        }
    }
}

#[async_trait]
impl WarmStore for RedisWarmStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let mut conn = self.conn().await?;
        let data: Option<Vec<u8>> = conn.get(self.entry_key(key)).await.map_err(storage_err)?;
        match data {
            Some(bytes) => CacheEntry::from_json(&bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &CacheKey, entry: &CacheEntry, ttl: Duration) -> Result<()> {
        let data = entry.to_json()?;
        let ttl_ms = (ttl.as_millis() as u64).max(1);
        let mut conn = self.conn().await?;
        conn.pset_ex::<_, _, ()>(self.entry_key(key), data, ttl_ms as _)
            .await
            .map_err(storage_err)?;
        tracing::debug!(key = %key, ttl_ms, "warm tier set");
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool> {
        let mut conn = self.conn().await?;
        let removed: u64 = conn.del(self.entry_key(key)).await.map_err(storage_err)?;
        Ok(removed > 0)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<CacheEntry>> {
        let pattern = format!("{}:entry:{}*", self.namespace, escape_glob(prefix));
        let mut conn = self.conn().await?;
        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(storage_err)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        let mut entries = Vec::with_capacity(keys.len());
        for rkey in keys {
            // a key may expire between SCAN and GET
            let data: Option<Vec<u8>> = conn.get(&rkey).await.map_err(storage_err)?;
            if let Some(entry) = data.and_then(|d| Self::decode(&rkey, &d)) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    async fn try_acquire_lease(&self, key: &CacheKey, holder: &str, ttl: Duration) -> Result<bool> {
        let opts = SetOptions::default()
            .conditional_set(ExistenceCheck::NX)
            .with_expiration(SetExpiry::PX(ttl.as_millis() as _));
        let lkey = self.lease_key(key);
        let mut conn = self.conn().await?;
        let set: Option<String> = conn
            .set_options(&lkey, holder, opts)
            .await
            .map_err(storage_err)?;
        Ok(set.is_some())
    }

    async fn release_lease(&self, key: &CacheKey, holder: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let deleted: i64 = redis::Script::new(RELEASE_LEASE)
            .key(self.lease_key(key))
            .arg(holder)
            .invoke_async(&mut conn)
            .await
            .map_err(storage_err)?;
        Ok(deleted > 0)
    }

    async fn lease_holder(&self, key: &CacheKey) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        conn.get(self.lease_key(key)).await.map_err(storage_err)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
