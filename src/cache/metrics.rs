//! Hit/miss accounting and cost-saved estimation.
//!
//! Counters are atomics, so recording never blocks and never fails. Every event is
//! also handed to a [`MetricsSink`] for an external telemetry collector.

use crate::pricing::CostTable;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Where a `fetch` result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitTier {
    Hot,
    Warm,
    /// Built by a concurrent caller while this one waited on the lease.
    Coordinated,
    /// This caller built it.
    Origin,
    /// Origin called directly with no caching (disabled cache or lease wait timeout).
    Bypass,
}

impl HitTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            HitTier::Hot => "hot",
            HitTier::Warm => "warm",
            HitTier::Coordinated => "coordinated",
            HitTier::Origin => "origin",
            HitTier::Bypass => "bypass",
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, HitTier::Hot | HitTier::Warm | HitTier::Coordinated)
    }
}

impl std::fmt::Display for HitTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheEvent {
    Hit { tier: HitTier },
    Miss,
    MissWithError,
    Bypass,
    Invalidation { count: u64 },
    CostSaved { request_class: String, usd: f64 },
}

pub trait MetricsSink: Send + Sync {
    /// Must not block; called on the request path.
    fn record(&self, event: &CacheEvent);
}

pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn record(&self, _: &CacheEvent) {}
}

/// Emits each event as a `tracing` debug record.
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn record(&self, event: &CacheEvent) {
        tracing::debug!(target: "ai_lib_cache::metrics", event = ?event, "cache event");
    }
}

/// In-memory sink for testing.
pub struct InMemoryMetricsSink {
    events: Mutex<Vec<CacheEvent>>,
    max_events: usize,
}

impl InMemoryMetricsSink {
    pub fn new(max: usize) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            max_events: max,
        }
    }
    pub fn events(&self) -> Vec<CacheEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MetricsSink for InMemoryMetricsSink {
    fn record(&self, event: &CacheEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
            if events.len() > self.max_events {
                events.remove(0);
            }
        }
    }
}

/// Read-only snapshot returned by `stats()`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub hot_hits: u64,
    pub warm_hits: u64,
    pub coordinated_hits: u64,
    pub misses: u64,
    pub miss_errors: u64,
    pub bypasses: u64,
    pub invalidations: u64,
    pub hit_rate: f64,
    pub estimated_cost_saved: f64,
    pub hot_entries: usize,
    pub hot_evictions: u64,
    pub warm_failures: u64,
}

// cost is accumulated in micro-dollars to stay atomic
const MICROS: f64 = 1_000_000.0;

pub struct MetricsRecorder {
    hot_hits: AtomicU64,
    warm_hits: AtomicU64,
    coordinated_hits: AtomicU64,
    misses: AtomicU64,
    miss_errors: AtomicU64,
    bypasses: AtomicU64,
    invalidations: AtomicU64,
    saved_micros: AtomicU64,
    costs: CostTable,
    sink: Arc<dyn MetricsSink>,
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new(CostTable::default(), Arc::new(NoopMetricsSink))
    }
}

impl MetricsRecorder {
    pub fn new(costs: CostTable, sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            hot_hits: AtomicU64::new(0),
            warm_hits: AtomicU64::new(0),
            coordinated_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            miss_errors: AtomicU64::new(0),
            bypasses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            saved_micros: AtomicU64::new(0),
            costs,
            sink,
        }
    }

    pub fn record_hit(&self, tier: HitTier) {
        let counter = match tier {
            HitTier::Hot => &self.hot_hits,
            HitTier::Warm => &self.warm_hits,
            HitTier::Coordinated => &self.coordinated_hits,
            HitTier::Origin => return self.record_miss(),
            HitTier::Bypass => return self.record_bypass(),
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.sink.record(&CacheEvent::Hit { tier });
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.sink.record(&CacheEvent::Miss);
    }

    pub fn record_miss_with_error(&self) {
        self.miss_errors.fetch_add(1, Ordering::Relaxed);
        self.sink.record(&CacheEvent::MissWithError);
    }

    pub fn record_bypass(&self) {
        self.bypasses.fetch_add(1, Ordering::Relaxed);
        self.sink.record(&CacheEvent::Bypass);
    }

    pub fn record_invalidation(&self, count: u64) {
        self.invalidations.fetch_add(count, Ordering::Relaxed);
        self.sink.record(&CacheEvent::Invalidation { count });
    }

    /// Estimated origin cost of one call of `request_class`, i.e. what a hit saves.
    pub fn estimate_cost_saved(&self, request_class: &str) -> f64 {
        self.costs.cost_for(request_class)
    }

    /// Credit one avoided origin call to the savings total.
    pub fn record_saving(&self, request_class: &str) {
        let usd = self.estimate_cost_saved(request_class);
        self.saved_micros
            .fetch_add((usd * MICROS).round() as u64, Ordering::Relaxed);
        self.sink.record(&CacheEvent::CostSaved {
            request_class: request_class.to_string(),
            usd,
        });
    }

    pub fn snapshot(&self) -> CacheStats {
        let hot_hits = self.hot_hits.load(Ordering::Relaxed);
        let warm_hits = self.warm_hits.load(Ordering::Relaxed);
        let coordinated_hits = self.coordinated_hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let miss_errors = self.miss_errors.load(Ordering::Relaxed);
        let bypasses = self.bypasses.load(Ordering::Relaxed);
        let hits = hot_hits + warm_hits + coordinated_hits;
        let total = hits + misses + miss_errors + bypasses;
        CacheStats {
            hits,
            hot_hits,
            warm_hits,
            coordinated_hits,
            misses,
            miss_errors,
            bypasses,
            invalidations: self.invalidations.load(Ordering::Relaxed),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            estimated_cost_saved: self.saved_micros.load(Ordering::Relaxed) as f64 / MICROS,
            ..CacheStats::default()
        }
    }
}
