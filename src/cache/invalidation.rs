//! Administrative invalidation by key or by filter.
//!
//! Filter invalidation scans the warm tier and purges the hot tier of this
//! process only. Hot copies held by other instances age out at their own TTL.

use super::coordinator::ResponseCache;
use super::entry::CacheEntry;
use super::key::CacheKey;
use crate::{Error, ErrorContext, Result};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Criteria for bulk invalidation. Every criterion that is set must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationFilter {
    pub requester: Option<String>,
    pub request_class: Option<String>,
    pub key_prefix: Option<String>,
}

impl InvalidationFilter {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_requester(mut self, requester: impl Into<String>) -> Self {
        self.requester = Some(requester.into());
        self
    }
    pub fn with_request_class(mut self, class: impl Into<String>) -> Self {
        self.request_class = Some(class.into());
        self
    }
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.requester.is_none() && self.request_class.is_none() && self.key_prefix.is_none()
    }

    pub fn matches(&self, key: &CacheKey, entry: &CacheEntry) -> bool {
        self.requester.as_deref().map_or(true, |r| entry.requester == r)
            && self
                .request_class
                .as_deref()
                .map_or(true, |c| entry.request_class == c)
            && self
                .key_prefix
                .as_deref()
                .map_or(true, |p| key.as_str().starts_with(p))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InvalidationReport {
    pub warm_removed: usize,
    pub hot_removed: usize,
    /// Distinct keys removed from either tier.
    pub total: usize,
    /// False when the warm tier could not be scanned; only the hot tier was purged.
    pub warm_available: bool,
}

impl ResponseCache {
    /// Remove `key` from both tiers. Returns how many tier copies were removed.
    ///
    /// The hot copy is always dropped; a warm-tier fault is returned so the
    /// caller can retry, since the warm copy would otherwise be served again.
    pub async fn invalidate(&self, key: &CacheKey) -> Result<usize> {
        let hot = self.hot.remove(key);
        let warm = match self.warm {
            Some(ref warm) => match warm.delete(key).await {
                Ok(removed) => removed,
                Err(e) => {
                    tracing::warn!(
                        key = %key,
                        error = %e,
                        "warm tier delete failed during invalidation"
                    );
                    if hot {
                        self.metrics.record_invalidation(1);
                    }
                    return Err(e);
                }
            },
            None => false,
        };
        let removed = usize::from(hot) + usize::from(warm);
        if removed > 0 {
            self.metrics.record_invalidation(1);
        }
        tracing::debug!(key = %key, hot, warm, "invalidated");
        Ok(removed)
    }

    pub async fn invalidate_by_filter(
        &self,
        filter: &InvalidationFilter,
    ) -> Result<InvalidationReport> {
        if filter.is_empty() {
            return Err(Error::validation_with_context(
                "invalidation filter must set at least one criterion",
                ErrorContext::new()
                    .with_field_path("filter")
                    .with_source("invalidation"),
            ));
        }

        let mut removed: HashSet<CacheKey> = HashSet::new();
        let mut report = InvalidationReport::default();

        if let Some(ref warm) = self.warm {
            let prefix = filter.key_prefix.as_deref().unwrap_or("");
            match warm.scan_prefix(prefix).await {
                Ok(entries) => {
                    report.warm_available = true;
                    let targets: Vec<CacheKey> = entries
                        .into_iter()
                        .filter(|e| filter.matches(&e.key, e))
                        .map(|e| e.key)
                        .collect();
                    let results = join_all(targets.iter().map(|k| warm.delete(k))).await;
                    for (key, result) in targets.into_iter().zip(results) {
                        match result {
                            Ok(true) => {
                                report.warm_removed += 1;
                                removed.insert(key);
                            }
                            Ok(false) => {}
                            Err(e) => {
                                tracing::warn!(key = %key, error = %e, "warm tier delete failed")
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "warm tier scan failed, purging hot tier only");
                }
            }
        }

        let hot_keys = self.hot.remove_matching(|k, e| filter.matches(k, e));
        report.hot_removed = hot_keys.len();
        removed.extend(hot_keys);
        report.total = removed.len();

        if report.total > 0 {
            self.metrics.record_invalidation(report.total as u64);
        }
        tracing::info!(
            warm_removed = report.warm_removed,
            hot_removed = report.hot_removed,
            "invalidated by filter"
        );
        Ok(report)
    }
}
