//! Shared, durable tier.
//!
//! [`WarmStore`] is the raw store contract (Redis in production, an in-process
//! emulation for single-instance use and tests). [`WarmTier`] wraps a store with
//! timeouts, a single retry, a circuit breaker and silent degradation so that a
//! store outage only ever costs cache hits, never correctness.

use super::clock::Clock;
use super::entry::CacheEntry;
use super::key::CacheKey;
use crate::resilience::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot,
};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[async_trait]
pub trait WarmStore: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>>;
    /// Write (or replace) the single record for `key`; the store expires it after `ttl`.
    async fn put(&self, key: &CacheKey, entry: &CacheEntry, ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &CacheKey) -> Result<bool>;
    /// Live entries whose key starts with `prefix` (empty prefix = everything).
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<CacheEntry>>;
    /// Write-if-absent lease record. Returns true when `holder` now owns the
    /// lease; a live lease is never re-granted, not even to its own holder.
    async fn try_acquire_lease(&self, key: &CacheKey, holder: &str, ttl: Duration) -> Result<bool>;
    /// Delete the lease only if `holder` still owns it.
    async fn release_lease(&self, key: &CacheKey, holder: &str) -> Result<bool>;
    async fn lease_holder(&self, key: &CacheKey) -> Result<Option<String>>;
    async fn ping(&self) -> Result<()>;
    fn name(&self) -> &'static str;
}

struct Record {
    data: Vec<u8>,
    expires_at: u64,
}

struct Lease {
    holder: String,
    expires_at: u64,
}

#[derive(Default)]
struct MemoryState {
    records: HashMap<CacheKey, Record>,
    leases: HashMap<CacheKey, Lease>,
}

/// In-process warm store with lazy expiry on read.
///
/// Records are kept JSON-encoded exactly as Redis would hold them. Availability
/// can be toggled off to simulate an outage.
pub struct MemoryWarmStore {
    state: Mutex<MemoryState>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
    gets: AtomicU64,
    puts: AtomicU64,
}

impl MemoryWarmStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            clock,
            available: AtomicBool::new(true),
            gets: AtomicU64::new(0),
            puts: AtomicU64::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Store arbitrary bytes under `key`, bypassing encoding.
    pub fn insert_raw(&self, key: &CacheKey, data: Vec<u8>, ttl: Duration) {
        let expires_at = self.expiry(ttl);
        self.lock().records.insert(key.clone(), Record { data, expires_at });
    }

    pub fn get_count(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        self.lock()
            .records
            .values()
            .filter(|r| r.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn expiry(&self, ttl: Duration) -> u64 {
        self.clock.now_ms().saturating_add(ttl.as_millis() as u64)
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::storage("memory", "store unavailable"))
        }
    }
}

#[async_trait]
impl WarmStore for MemoryWarmStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        self.check()?;
        self.gets.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now_ms();
        let data = {
            let mut state = self.lock();
            let live = match state.records.get(key) {
                None => return Ok(None),
                Some(r) => (r.expires_at > now).then(|| r.data.clone()),
            };
            if live.is_none() {
                state.records.remove(key);
            }
            live
        };
        match data {
            Some(data) => CacheEntry::from_json(&data).map(Some),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &CacheKey, entry: &CacheEntry, ttl: Duration) -> Result<()> {
        self.check()?;
        self.puts.fetch_add(1, Ordering::Relaxed);
        let data = entry.to_json()?;
        let expires_at = self.expiry(ttl);
        self.lock().records.insert(key.clone(), Record { data, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool> {
        self.check()?;
        Ok(self.lock().records.remove(key).is_some())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<CacheEntry>> {
        self.check()?;
        let now = self.clock.now_ms();
        let raw: Vec<(CacheKey, Vec<u8>)> = self
            .lock()
            .records
            .iter()
            .filter(|(k, r)| r.expires_at > now && k.as_str().starts_with(prefix))
            .map(|(k, r)| (k.clone(), r.data.clone()))
            .collect();
        let mut entries = Vec::with_capacity(raw.len());
        for (key, data) in raw {
            match CacheEntry::from_json(&data) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "skipping undecodable warm record")
                }
            }
        }
        Ok(entries)
    }

    async fn try_acquire_lease(&self, key: &CacheKey, holder: &str, ttl: Duration) -> Result<bool> {
        self.check()?;
        let now = self.clock.now_ms();
        let expires_at = self.expiry(ttl);
        let mut state = self.lock();
        match state.leases.get(key) {
            Some(lease) if lease.expires_at > now => Ok(false),
            _ => {
                state.leases.insert(
                    key.clone(),
                    Lease {
                        holder: holder.to_string(),
                        expires_at,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn release_lease(&self, key: &CacheKey, holder: &str) -> Result<bool> {
        self.check()?;
        let mut state = self.lock();
        if state.leases.get(key).map(|l| l.holder == holder).unwrap_or(false) {
            state.leases.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn lease_holder(&self, key: &CacheKey) -> Result<Option<String>> {
        self.check()?;
        let now = self.clock.now_ms();
        Ok(self
            .lock()
            .leases
            .get(key)
            .filter(|l| l.expires_at > now)
            .map(|l| l.holder.clone()))
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[derive(Debug, Clone)]
pub struct WarmTierOptions {
    pub op_timeout: Duration,
    pub retry_backoff: Duration,
    pub breaker: CircuitBreakerConfig,
}

impl Default for WarmTierOptions {
    fn default() -> Self {
        Self {
            op_timeout: Duration::from_millis(250),
            retry_backoff: Duration::from_millis(50),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Fault-tolerant front for a [`WarmStore`].
pub struct WarmTier {
    store: Arc<dyn WarmStore>,
    opts: WarmTierOptions,
    breaker: CircuitBreaker,
    failures: AtomicU64,
}

fn is_transient(e: &Error) -> bool {
    matches!(e, Error::Storage { .. } | Error::Timeout { .. })
}

impl WarmTier {
    pub fn new(store: Arc<dyn WarmStore>, opts: WarmTierOptions) -> Self {
        let breaker = CircuitBreaker::new(format!("warm:{}", store.name()), opts.breaker.clone());
        Self {
            store,
            opts,
            breaker,
            failures: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<dyn WarmStore> {
        &self.store
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.name()
    }

    /// Total operations that failed after the retry.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn breaker_snapshot(&self) -> CircuitBreakerSnapshot {
        self.breaker.snapshot()
    }

    /// Run one store operation with a timeout and, for transient faults, one retry
    /// after a backoff. Skipped outright while the breaker is open.
    async fn call<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.breaker.allow()?;
        let mut attempt = 0;
        loop {
            let outcome = match tokio::time::timeout(self.opts.op_timeout, f()).await {
                Ok(r) => r,
                Err(_) => Err(Error::Timeout {
                    operation: format!("warm tier {}", op),
                    elapsed_ms: self.opts.op_timeout.as_millis() as u64,
                }),
            };
            match outcome {
                Ok(v) => {
                    self.breaker.on_success();
                    return Ok(v);
                }
                Err(e) if is_transient(&e) && attempt == 0 => {
                    attempt += 1;
                    tracing::debug!(op, error = %e, "warm tier call failed, retrying");
                    tokio::time::sleep(self.opts.retry_backoff).await;
                }
                Err(e) => {
                    if is_transient(&e) {
                        self.breaker.on_failure();
                        self.failures.fetch_add(1, Ordering::Relaxed);
                    } else {
                        // the store answered; only the payload was bad
                        self.breaker.on_success();
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Degrades to a miss on any fault, including undecodable records.
    pub async fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        match self.call("get", || self.store.get(key)).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "warm tier get failed, treating as miss");
                None
            }
        }
    }

    /// Returns false when the entry could not be persisted.
    pub async fn put(&self, key: &CacheKey, entry: &CacheEntry, ttl: Duration) -> bool {
        match self.call("put", || self.store.put(key, entry, ttl)).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "warm tier put failed, entry not persisted");
                false
            }
        }
    }

    pub async fn delete(&self, key: &CacheKey) -> Result<bool> {
        self.call("delete", || self.store.delete(key)).await
    }

    pub async fn scan_prefix(&self, prefix: &str) -> Result<Vec<CacheEntry>> {
        self.call("scan", || self.store.scan_prefix(prefix)).await
    }

    pub async fn try_acquire_lease(
        &self,
        key: &CacheKey,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool> {
        self.call("lease_acquire", || {
            self.store.try_acquire_lease(key, holder, ttl)
        })
        .await
    }

    pub async fn release_lease(&self, key: &CacheKey, holder: &str) -> Result<bool> {
        self.call("lease_release", || self.store.release_lease(key, holder))
            .await
    }

    pub async fn lease_holder(&self, key: &CacheKey) -> Result<Option<String>> {
        self.call("lease_holder", || self.store.lease_holder(key)).await
    }

    pub async fn is_available(&self) -> bool {
        self.call("ping", || self.store.ping()).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::ManualClock;
    use crate::cache::codec::Codec;
    use crate::cache::lease::{Acquire, LeaseTable};
    use bytes::Bytes;

    fn entry(key: &str, now: u64) -> CacheEntry {
        CacheEntry::build(
            CacheKey::new(key),
            Bytes::from_static(b"payload"),
            &Codec::default(),
            "chat",
            "user-1",
            now,
            Duration::from_secs(60),
        )
    }

    fn setup() -> (Arc<ManualClock>, Arc<MemoryWarmStore>, WarmTier) {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryWarmStore::new(clock.clone()));
        let opts = WarmTierOptions {
            op_timeout: Duration::from_millis(100),
            retry_backoff: Duration::from_millis(1),
            breaker: CircuitBreakerConfig::new().with_failure_threshold(2),
        };
        let tier = WarmTier::new(store.clone(), opts);
        (clock, store, tier)
    }

    #[tokio::test]
    async fn test_store_expires_natively() {
        let (clock, store, tier) = setup();
        let key = CacheKey::new("abc");
        assert!(tier.put(&key, &entry("abc", 0), Duration::from_secs(60)).await);
        assert!(tier.get(&key).await.is_some());
        clock.advance(Duration::from_secs(61));
        assert!(tier.get(&key).await.is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_outage_degrades_to_miss() {
        let (_clock, store, tier) = setup();
        let key = CacheKey::new("abc");
        tier.put(&key, &entry("abc", 0), Duration::from_secs(60)).await;
        store.set_available(false);
        assert!(tier.get(&key).await.is_none());
        assert!(!tier.put(&key, &entry("abc", 0), Duration::from_secs(60)).await);
        assert!(tier.delete(&key).await.is_err());
        assert!(tier.failures() >= 2);
    }

    #[tokio::test]
    async fn test_breaker_skips_store_while_open() {
        let (_clock, store, tier) = setup();
        store.set_available(false);
        let key = CacheKey::new("abc");
        tier.get(&key).await;
        tier.get(&key).await;
        assert!(tier.breaker_snapshot().open_remaining_ms.is_some());
        store.set_available(true);
        // still open: the store is not consulted
        let before = store.get_count();
        assert!(tier.get(&key).await.is_none());
        assert_eq!(store.get_count(), before);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_a_miss_without_tripping_breaker() {
        let (_clock, store, tier) = setup();
        let key = CacheKey::new("bad");
        store.insert_raw(&key, b"{not json".to_vec(), Duration::from_secs(60));
        assert!(tier.get(&key).await.is_none());
        assert_eq!(tier.failures(), 0);
        assert_eq!(tier.breaker_snapshot().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_scan_prefix() {
        let (_clock, _store, tier) = setup();
        for k in ["aa1", "aa2", "bb1"] {
            tier.put(&CacheKey::new(k), &entry(k, 0), Duration::from_secs(60)).await;
        }
        let mut found: Vec<String> = tier
            .scan_prefix("aa")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.key.hash)
            .collect();
        found.sort();
        assert_eq!(found, vec!["aa1", "aa2"]);
        assert_eq!(tier.scan_prefix("").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_lease_write_if_absent() {
        let (clock, _store, tier) = setup();
        let key = CacheKey::new("k");
        let ttl = Duration::from_secs(30);
        assert!(tier.try_acquire_lease(&key, "a", ttl).await.unwrap());
        assert!(!tier.try_acquire_lease(&key, "b", ttl).await.unwrap());
        assert!(!tier.try_acquire_lease(&key, "a", ttl).await.unwrap());
        assert_eq!(tier.lease_holder(&key).await.unwrap().as_deref(), Some("a"));
        assert!(!tier.release_lease(&key, "b").await.unwrap());

        // abandoned lease can be taken over after expiry
        clock.advance(Duration::from_secs(31));
        assert!(tier.try_acquire_lease(&key, "b", ttl).await.unwrap());
        assert!(!tier.release_lease(&key, "a").await.unwrap());
        assert!(tier.release_lease(&key, "b").await.unwrap());
        assert!(tier.lease_holder(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_builder_release_keeps_newer_lease() {
        let (clock, _store, tier) = setup();
        let table = Arc::new(LeaseTable::new(Duration::from_millis(20)));
        let key = CacheKey::new("k");
        let ttl = table.lease_ttl();

        let stale = match table.acquire(&key) {
            Acquire::Builder(lease) => lease,
            Acquire::Waiter(_) => panic!("expected builder"),
        };
        assert!(tier.try_acquire_lease(&key, stale.holder_token(), ttl).await.unwrap());

        // the local lease and its shared record both lapse while the build runs on
        tokio::time::sleep(Duration::from_millis(30)).await;
        clock.advance(Duration::from_millis(30));
        let fresh = match table.acquire(&key) {
            Acquire::Builder(lease) => lease,
            Acquire::Waiter(_) => panic!("expected takeover"),
        };
        assert_ne!(stale.holder_token(), fresh.holder_token());
        assert!(tier.try_acquire_lease(&key, fresh.holder_token(), ttl).await.unwrap());

        assert!(!tier.release_lease(&key, stale.holder_token()).await.unwrap());
        assert_eq!(
            tier.lease_holder(&key).await.unwrap().as_deref(),
            Some(fresh.holder_token())
        );
        assert!(!tier.try_acquire_lease(&key, "other-instance:1", ttl).await.unwrap());
    }
}
