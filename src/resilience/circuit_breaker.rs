use crate::{Error, Result};
use serde::Deserialize;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub consecutive_failures: u32,
    pub trips: u64,
    /// Remaining open time in ms, if currently open.
    pub open_remaining_ms: Option<u64>,
    /// A half-open trial call is in flight.
    pub trial_in_flight: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    #[serde(with = "crate::cache::config::duration_ms")]
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(10),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

#[derive(Debug)]
struct State {
    consecutive_failures: u32,
    open_until: Option<Instant>,
    /// Start of the in-flight half-open trial call.
    trial_since: Option<Instant>,
    trips: u64,
}

/// Consecutive-failure breaker guarding a dependency that may be down.
///
/// - Counts consecutive failures
/// - Opens for a cooldown after the threshold, failing fast meanwhile
/// - The first call after the cooldown is let through as a trial call; others keep
///   failing fast until it reports back (or until another cooldown passes)
///
/// A threshold of zero disables the breaker.
pub struct CircuitBreaker {
    name: String,
    cfg: CircuitBreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, cfg: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            cfg,
            state: Mutex::new(State {
                consecutive_failures: 0,
                open_until: None,
                trial_since: None,
                trips: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn allow(&self) -> Result<()> {
        if self.cfg.failure_threshold == 0 {
            return Ok(());
        }
        let now = Instant::now();
        let mut st = self.lock();
        if let Some(since) = st.trial_since {
            if now < since + self.cfg.cooldown {
                return Err(Error::storage(
                    self.name.clone(),
                    "circuit breaker half-open, trial call in flight",
                ));
            }
            // the trial call never reported back; this call replaces it
            st.trial_since = Some(now);
            return Ok(());
        }
        if let Some(until) = st.open_until {
            if now < until {
                return Err(Error::storage(
                    self.name.clone(),
                    "circuit breaker open, skipping call",
                ));
            }
            // cooldown expired, half-open: let one trial call through
            st.open_until = None;
            st.trial_since = Some(now);
            st.consecutive_failures = self.cfg.failure_threshold.saturating_sub(1);
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.lock()
            .open_until
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }

    pub fn on_success(&self) {
        let mut st = self.lock();
        st.consecutive_failures = 0;
        st.open_until = None;
        st.trial_since = None;
    }

    pub fn on_failure(&self) {
        if self.cfg.failure_threshold == 0 {
            return;
        }
        let mut st = self.lock();
        st.trial_since = None;
        st.consecutive_failures = st.consecutive_failures.saturating_add(1);
        if st.consecutive_failures >= self.cfg.failure_threshold && st.open_until.is_none() {
            st.open_until = Some(Instant::now() + self.cfg.cooldown);
            st.trips += 1;
            tracing::warn!(
                breaker = %self.name,
                failures = st.consecutive_failures,
                cooldown_ms = self.cfg.cooldown.as_millis() as u64,
                "circuit breaker opened"
            );
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let now = Instant::now();
        let st = self.lock();
        let open_remaining_ms = st
            .open_until
            .and_then(|until| (until > now).then(|| (until - now).as_millis() as u64));
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            failure_threshold: self.cfg.failure_threshold,
            cooldown_ms: self.cfg.cooldown.as_millis() as u64,
            consecutive_failures: st.consecutive_failures,
            trips: st.trips,
            open_remaining_ms,
            trial_in_flight: st.trial_since.is_some(),
        }
    }
}
