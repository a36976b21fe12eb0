//! Process-local, capacity-bounded LRU tier.

use super::entry::CacheEntry;
use super::key::CacheKey;
use crate::{Error, ErrorContext, Result};
use lru::LruCache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// A hot copy and the instant (unix ms) this tier stops serving it.
struct Slot {
    entry: CacheEntry,
    expires_at: u64,
}

/// Bounded in-process LRU cache.
///
/// `LruCache` keeps a hash index into an intrusive doubly linked list, so recency
/// updates and tail eviction are O(1). The single mutex is held only for those
/// O(1) operations and never across an `.await`.
///
/// A copy lives until the entry's own expiry or `max_ttl` after it was stored,
/// whichever comes first.
pub struct HotTier {
    inner: Mutex<LruCache<CacheKey, Slot>>,
    capacity: usize,
    max_ttl: Option<Duration>,
    evictions: AtomicU64,
}

impl HotTier {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::configuration_with_context(
                "hot tier capacity must be non-zero",
                ErrorContext::new()
                    .with_field_path("hot_capacity")
                    .with_source("hot_tier"),
            ));
        }
        Ok(Self {
            inner: Mutex::new(LruCache::unbounded()),
            capacity,
            max_ttl: None,
            evictions: AtomicU64::new(0),
        })
    }

    pub fn with_max_ttl(mut self, max_ttl: Duration) -> Self {
        self.max_ttl = Some(max_ttl);
        self
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<CacheKey, Slot>> {
        // Entries are replaced wholesale, so a panic mid-operation cannot leave one half-written.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Look up a live entry, marking it most recently used and bumping its access count.
    /// Expired entries are dropped on sight.
    pub fn get(&self, key: &CacheKey, now_ms: u64) -> Option<CacheEntry> {
        let mut cache = self.lock();
        let expired = match cache.get_mut(key) {
            None => return None,
            Some(slot) if slot.expires_at <= now_ms => true,
            Some(slot) => {
                slot.entry.access_count = slot.entry.access_count.saturating_add(1);
                return Some(slot.entry.clone());
            }
        };
        if expired {
            cache.pop(key);
        }
        None
    }

    /// Read without touching recency or access count.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.lock().peek(key).map(|slot| slot.entry.clone())
    }

    /// Like [`peek`](Self::peek), but only while this tier would still serve the copy.
    pub fn peek_live(&self, key: &CacheKey, now_ms: u64) -> Option<CacheEntry> {
        self.lock()
            .peek(key)
            .filter(|slot| slot.expires_at > now_ms)
            .map(|slot| slot.entry.clone())
    }

    /// Store `entry` as of `now_ms`.
    pub fn put(&self, key: CacheKey, entry: CacheEntry, now_ms: u64) {
        let expires_at = match self.max_ttl {
            Some(max) => entry
                .expires_at
                .min(now_ms.saturating_add(max.as_millis() as u64)),
            None => entry.expires_at,
        };
        let mut cache = self.lock();
        cache.put(key, Slot { entry, expires_at });
        self.evict_locked(&mut cache);
    }

    /// Trim down to capacity, least recently used first. Returns the number evicted.
    pub fn evict_if_needed(&self) -> usize {
        let mut cache = self.lock();
        self.evict_locked(&mut cache)
    }

    fn evict_locked(&self, cache: &mut LruCache<CacheKey, Slot>) -> usize {
        let mut evicted = 0;
        while cache.len() > self.capacity {
            match cache.pop_lru() {
                Some((key, _)) => {
                    tracing::debug!(key = %key, "hot tier eviction");
                    evicted += 1;
                }
                None => break,
            }
        }
        if evicted > 0 {
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        }
        evicted
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        self.lock().pop(key).is_some()
    }

    /// Drop every entry for which `pred` returns true. Returns the removed keys.
    pub fn remove_matching<F>(&self, mut pred: F) -> Vec<CacheKey>
    where
        F: FnMut(&CacheKey, &CacheEntry) -> bool,
    {
        let mut cache = self.lock();
        let doomed: Vec<CacheKey> = cache
            .iter()
            .filter(|(k, slot)| pred(*k, &slot.entry))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            cache.pop(key);
        }
        doomed
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
