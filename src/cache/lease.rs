//! Per-key build leases (single-flight).
//!
//! The first caller to miss on a key becomes the *builder* and holds a lease;
//! everyone else arriving while the lease is live becomes a *waiter* subscribed
//! to the lease's resolution. A lease carries an expiry so a builder that never
//! resolves (crashed task, leaked future) stalls others for at most `lease_ttl`.

use super::key::CacheKey;
use crate::Error;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How a lease was resolved by its builder.
#[derive(Debug, Clone)]
pub enum LeaseOutcome {
    /// Origin succeeded; the response is also in the tiers.
    Ready(Bytes),
    /// Origin failed; the error is shared verbatim with all waiters.
    Failed(Arc<Error>),
    /// The builder went away without resolving.
    Abandoned,
}

#[derive(Debug, Clone)]
enum FlightState {
    Pending,
    Done(LeaseOutcome),
}

struct Flight {
    id: u64,
    /// `{instance}:{id}`, the owner recorded in the shared lease.
    holder: String,
    expires_at: Instant,
    tx: watch::Sender<FlightState>,
}

/// Outcome of waiting on someone else's lease.
#[derive(Debug)]
pub enum WaitResult {
    Resolved(LeaseOutcome),
    /// The lease outlived its expiry without resolving; it may be taken over.
    Expired,
    TimedOut,
    Cancelled,
}

pub enum Acquire {
    Builder(BuildLease),
    Waiter(LeaseWaiter),
}

pub struct LeaseTable {
    flights: Mutex<HashMap<CacheKey, Arc<Flight>>>,
    lease_ttl: Duration,
    next_id: AtomicU64,
    instance_id: String,
}

impl LeaseTable {
    pub fn new(lease_ttl: Duration) -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
            lease_ttl,
            next_id: AtomicU64::new(1),
            instance_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Identity of this process/instance.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, Arc<Flight>>> {
        self.flights.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Become the builder for `key`, or a waiter on the live lease.
    /// An expired lease is replaced, making the caller the new builder.
    pub fn acquire(self: &Arc<Self>, key: &CacheKey) -> Acquire {
        let now = Instant::now();
        let mut flights = self.lock();
        if let Some(flight) = flights.get(key) {
            if flight.expires_at > now {
                return Acquire::Waiter(LeaseWaiter {
                    key: key.clone(),
                    rx: flight.tx.subscribe(),
                    expires_at: flight.expires_at,
                });
            }
            tracing::warn!(key = %key, "lease expired without resolution, taking over");
        }
        let (tx, _rx) = watch::channel(FlightState::Pending);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let flight = Arc::new(Flight {
            id,
            holder: format!("{}:{}", self.instance_id, id),
            expires_at: now + self.lease_ttl,
            tx,
        });
        flights.insert(key.clone(), Arc::clone(&flight));
        Acquire::Builder(BuildLease {
            table: Arc::clone(self),
            key: key.clone(),
            flight,
            resolved: false,
        })
    }

    /// True for a holder token minted by this table whose build is no longer
    /// registered: the builder was dropped, resolved, or replaced after expiry.
    pub fn is_stale_holder(&self, holder: &str) -> bool {
        let id = match holder.rsplit_once(':') {
            Some((instance, id)) if instance == self.instance_id => id.parse::<u64>().ok(),
            _ => None,
        };
        match id {
            Some(id) => !self.lock().values().any(|f| f.id == id),
            None => false,
        }
    }

    /// Number of keys with a lease currently registered.
    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    fn finish(&self, key: &CacheKey, flight: &Flight, outcome: LeaseOutcome) {
        {
            let mut flights = self.lock();
            // a newer lease may have replaced an expired one
            if flights.get(key).map(|f| f.id == flight.id).unwrap_or(false) {
                flights.remove(key);
            }
        }
        flight.tx.send_replace(FlightState::Done(outcome));
    }
}

/// Held by the single builder of a key. Dropping it unresolved marks the lease abandoned.
pub struct BuildLease {
    table: Arc<LeaseTable>,
    key: CacheKey,
    flight: Arc<Flight>,
    resolved: bool,
}

impl BuildLease {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn expires_at(&self) -> Instant {
        self.flight.expires_at
    }

    /// Owner string for the shared lease. Unique per build, so a stale builder
    /// can never release the lease of the one that took over from it.
    pub fn holder_token(&self) -> &str {
        &self.flight.holder
    }

    pub fn resolve(mut self, outcome: LeaseOutcome) {
        self.resolved = true;
        self.table.finish(&self.key, &self.flight, outcome);
    }
}

impl Drop for BuildLease {
    fn drop(&mut self) {
        if !self.resolved {
            tracing::debug!(key = %self.key, "builder dropped, lease abandoned");
            self.table
                .finish(&self.key, &self.flight, LeaseOutcome::Abandoned);
        }
    }
}

pub struct LeaseWaiter {
    key: CacheKey,
    rx: watch::Receiver<FlightState>,
    expires_at: Instant,
}

pub(crate) async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(t) => t.cancelled().await,
        None => std::future::pending().await,
    }
}

impl LeaseWaiter {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Wait for the builder, at most `timeout` and never past the lease's expiry.
    ///
    /// Giving up (timeout, cancellation, dropping this future) only detaches this
    /// waiter; the build and the other waiters are unaffected.
    pub async fn wait(
        mut self,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> WaitResult {
        let deadline = Instant::now() + timeout;
        let expired_first = self.expires_at < deadline;
        let until = if expired_first { self.expires_at } else { deadline };

        let rx = &mut self.rx;
        let resolution = async move {
            rx.wait_for(|s| matches!(s, FlightState::Done(_)))
                .await
                .map(|state| match &*state {
                    FlightState::Done(outcome) => outcome.clone(),
                    FlightState::Pending => LeaseOutcome::Abandoned,
                })
                .unwrap_or(LeaseOutcome::Abandoned)
        };

        tokio::select! {
            outcome = resolution => WaitResult::Resolved(outcome),
            _ = tokio::time::sleep_until(until) => {
                if expired_first { WaitResult::Expired } else { WaitResult::TimedOut }
            }
            _ = cancelled(cancel) => WaitResult::Cancelled,
        }
    }
}
