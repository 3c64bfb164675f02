//! Per-relay failure bookkeeping: backoff, failure windows, circuit breakers.
//!
//! The registry is owned by the pool instance that consults it, so separate
//! pools (and tests) never share health state. All bookkeeping for one relay
//! is keyed by its trimmed URL and mutated under a single lock; the tokio
//! runtime schedules relay futures on OS threads, so responses can land
//! concurrently.
//!
//! State transitions are reported through [`SummaryLog`], a keyed throttle
//! that keeps a hundred simultaneously failing relays from storming the log.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::HealthConfig;

/// What tripped a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitTrigger {
    ConsecutiveFailures,
    WindowedFailures,
}

impl CircuitTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConsecutiveFailures => "consecutive-failures",
            Self::WindowedFailures => "windowed-failures",
        }
    }
}

/// Active backoff for one relay.
#[derive(Debug, Clone)]
pub struct BackoffEntry {
    /// When the relay becomes eligible for another attempt.
    pub retry_at: Instant,
    /// The delay that produced `retry_at`.
    pub backoff: Duration,
    /// Consecutive failures at the time this entry was written.
    pub failure_count: u32,
    /// Why the last failure was recorded.
    pub reason: String,
}

/// Open circuit breaker for one relay.
#[derive(Debug, Clone)]
pub struct CircuitBreakerState {
    /// The relay is excluded from fanouts until this deadline passes.
    pub open_until: Instant,
    /// Consecutive failures at the time the breaker (last) opened.
    pub failure_count: u32,
    /// Which threshold fired.
    pub trigger: CircuitTrigger,
}

#[derive(Debug, Default)]
struct RelayHealthState {
    failure_count: u32,
    window: Vec<Instant>,
    backoff: Option<BackoffEntry>,
    circuit: Option<CircuitBreakerState>,
    unreachable: bool,
}

/// Rate-limited log sink: at most one emission per key per interval.
#[derive(Debug)]
pub struct SummaryLog {
    interval: Duration,
    last_emitted: Mutex<HashMap<String, Instant>>,
}

impl SummaryLog {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emitted: Mutex::new(HashMap::new()),
        }
    }

    /// Record an emission for `key` unless one happened within the interval.
    pub fn should_emit(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut last_emitted = self
            .last_emitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(last) = last_emitted.get(key)
            && now.duration_since(*last) < self.interval
        {
            return false;
        }
        last_emitted.insert(key.to_string(), now);
        true
    }
}

/// Health bookkeeping for every relay a pool talks to.
#[derive(Debug)]
pub struct RelayHealthRegistry {
    config: HealthConfig,
    summary: SummaryLog,
    relays: Mutex<HashMap<String, RelayHealthState>>,
}

impl RelayHealthRegistry {
    pub fn new(config: HealthConfig) -> Self {
        let summary = SummaryLog::new(config.summary_log_interval);
        Self {
            config,
            summary,
            relays: Mutex::new(HashMap::new()),
        }
    }

    fn relays(&self) -> MutexGuard<'_, HashMap<String, RelayHealthState>> {
        self.relays.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a failure for `url`, applying backoff and possibly opening the
    /// circuit breaker.
    pub fn record_failure(&self, url: &str, reason: &str) {
        self.record_failure_with_ttl(url, reason, None);
    }

    /// Like [`Self::record_failure`], with an optional ceiling that caps the
    /// computed backoff further.
    pub fn record_failure_with_ttl(&self, url: &str, reason: &str, ttl: Option<Duration>) {
        let url = url.trim();
        if url.is_empty() {
            return;
        }

        let now = Instant::now();
        let mut relays = self.relays();
        let state = relays.entry(url.to_string()).or_default();

        let cutoff = now.checked_sub(self.config.failure_window);
        state
            .window
            .retain(|stamp| cutoff.is_none_or(|cutoff| *stamp >= cutoff));
        state.window.push(now);
        let windowed_failures = state.window.len();

        state.failure_count += 1;
        let backoff = self.resolve_backoff(state.failure_count, ttl);
        state.backoff = Some(BackoffEntry {
            retry_at: now + backoff,
            backoff,
            failure_count: state.failure_count,
            reason: reason.to_string(),
        });
        state.unreachable = true;

        let consecutive_trip = state.failure_count >= self.config.circuit_breaker_threshold;
        let windowed_trip = windowed_failures >= self.config.failure_window_threshold;
        if consecutive_trip || windowed_trip {
            let mut open_until = now + self.config.circuit_breaker_cooldown;
            if let Some(existing) = &state.circuit {
                open_until = open_until.max(existing.open_until);
            }
            let trigger = if consecutive_trip {
                CircuitTrigger::ConsecutiveFailures
            } else {
                CircuitTrigger::WindowedFailures
            };
            state.circuit = Some(CircuitBreakerState {
                open_until,
                failure_count: state.failure_count,
                trigger,
            });
            if self.summary.should_emit(&format!("relay-circuit:{url}")) {
                warn!(
                    relay = %url,
                    failure_count = state.failure_count,
                    trigger = trigger.as_str(),
                    "circuit breaker opened for relay"
                );
            }
        }

        if self.summary.should_emit(&format!("relay-backoff:{url}")) {
            warn!(
                relay = %url,
                backoff_ms = backoff.as_millis() as u64,
                failure_count = state.failure_count,
                reason,
                "relay backoff applied"
            );
        }
    }

    /// Forget all failure state for `url` after a verified success.
    ///
    /// This clears the failure window along with backoff and breaker state:
    /// a single success between failures restarts the windowed count rather
    /// than letting failures accumulate across intermittent recoveries.
    pub fn clear_failure(&self, url: &str) {
        let url = url.trim();
        if url.is_empty() {
            return;
        }
        let existed = self.relays().remove(url).is_some();
        if existed && self.summary.should_emit(&format!("relay-recovered:{url}")) {
            info!(relay = %url, "relay recovered; backoff cleared");
        }
    }

    /// The subset of `candidates` that is safe to contact now.
    ///
    /// Expired breakers and expired backoff windows are cleared here, at
    /// observation time; there is no background timer.
    pub fn filter_healthy(&self, candidates: &[String]) -> Vec<String> {
        let mut relays = self.relays();
        if relays.is_empty() {
            return candidates.to_vec();
        }

        enum Verdict {
            Healthy,
            Excluded,
            CircuitExpired,
            BackoffExpired,
        }

        let now = Instant::now();
        let mut healthy = Vec::with_capacity(candidates.len());
        for url in candidates {
            let verdict = match relays.get(url) {
                None => Verdict::Healthy,
                Some(state) => {
                    if let Some(circuit) = &state.circuit {
                        if circuit.open_until > now {
                            Verdict::Excluded
                        } else {
                            Verdict::CircuitExpired
                        }
                    } else if !state.unreachable {
                        Verdict::Healthy
                    } else {
                        match &state.backoff {
                            None => Verdict::Excluded,
                            Some(entry) if entry.retry_at > now => Verdict::Excluded,
                            Some(_) => Verdict::BackoffExpired,
                        }
                    }
                }
            };

            match verdict {
                Verdict::Excluded => {}
                Verdict::Healthy => healthy.push(url.clone()),
                Verdict::CircuitExpired => {
                    relays.remove(url);
                    if self.summary.should_emit(&format!("relay-circuit-reset:{url}")) {
                        info!(relay = %url, "circuit breaker reset for relay");
                    }
                    healthy.push(url.clone());
                }
                Verdict::BackoffExpired => {
                    relays.remove(url);
                    if self.summary.should_emit(&format!("relay-backoff-expired:{url}")) {
                        info!(relay = %url, "relay backoff expired");
                    }
                    healthy.push(url.clone());
                }
            }
        }

        healthy
    }

    /// True while the relay's breaker deadline is in the future.
    pub fn is_circuit_open(&self, url: &str) -> bool {
        let now = Instant::now();
        self.relays()
            .get(url.trim())
            .and_then(|state| state.circuit.as_ref())
            .is_some_and(|circuit| circuit.open_until > now)
    }

    /// Current backoff entry for `url`, if any.
    pub fn backoff_entry(&self, url: &str) -> Option<BackoffEntry> {
        self.relays()
            .get(url.trim())
            .and_then(|state| state.backoff.clone())
    }

    /// Current circuit breaker state for `url`, if any.
    pub fn circuit_state(&self, url: &str) -> Option<CircuitBreakerState> {
        self.relays()
            .get(url.trim())
            .and_then(|state| state.circuit.clone())
    }

    /// Failures currently recorded inside the rolling window for `url`.
    pub fn windowed_failure_count(&self, url: &str) -> usize {
        self.relays()
            .get(url.trim())
            .map_or(0, |state| state.window.len())
    }

    fn resolve_backoff(&self, failure_count: u32, ttl: Option<Duration>) -> Duration {
        let exponent = failure_count.saturating_sub(1).min(16);
        let computed = self
            .config
            .backoff_base
            .saturating_mul(1_u32 << exponent)
            .min(self.config.backoff_max);
        match ttl {
            Some(limit) if limit > Duration::ZERO => computed.min(limit),
            _ => computed,
        }
    }
}
