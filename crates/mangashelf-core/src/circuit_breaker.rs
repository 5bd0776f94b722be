//! Per-source circuit breakers for scraping resilience.
//!
//! Protects outbound calls to third-party sources: after enough consecutive
//! counted failures a source is short-circuited until a cooldown elapses.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED (healthy) --[N failures]--> OPEN (rejecting) --[cooldown]--> HALF_OPEN (one probe)
//!                                                                         |
//!                                       <--[failure]--                    |
//!                                                                         |
//! CLOSED <---------------------------[success]----------------------------+
//! ```
//!
//! Only server and network failures count. Not-found and rate-limit outcomes
//! say nothing about the health of the source and must never be recorded as
//! failures.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected immediately.
    Open,
    /// A single probe request is allowed to test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive counted failures before opening the circuit.
    pub failure_threshold: u32,

    /// Time to wait before an open circuit lets a probe through.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

#[derive(Debug)]
struct CircuitBreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    /// Set whenever `state` is `Open`.
    opened_at: Option<Instant>,
    /// Set while the half-open probe has not reported back.
    probe_started_at: Option<Instant>,
}

impl CircuitBreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_started_at: None,
        }
    }
}

/// Statistics about circuit breaker state for monitoring.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub time_until_half_open: Option<Duration>,
}

/// Thread-safe circuit breaker for one source.
///
/// Cloning shares the underlying state.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<CircuitBreakerInner>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(CircuitBreakerInner::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> MutexGuard<'_, CircuitBreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    pub fn state(&self) -> CircuitState {
        self.lock_inner().state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.lock_inner();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            time_until_half_open: (inner.state == CircuitState::Open)
                .then(|| self.remaining_cooldown(&inner)),
        }
    }

    /// Remaining cooldown before a probe is allowed, zero unless the circuit is open.
    pub fn retry_after(&self) -> Duration {
        let inner = self.lock_inner();
        if inner.state == CircuitState::Open {
            self.remaining_cooldown(&inner)
        } else {
            Duration::ZERO
        }
    }

    fn remaining_cooldown(&self, inner: &CircuitBreakerInner) -> Duration {
        inner
            .opened_at
            .map(|t| self.config.cooldown.saturating_sub(t.elapsed()))
            .unwrap_or(self.config.cooldown)
    }

    /// Decides whether a new network attempt may be made now.
    ///
    /// - Closed: always.
    /// - Open: never, until the cooldown has elapsed; then the circuit moves
    ///   to half-open and this call is granted the single probe.
    /// - HalfOpen: only if no probe is outstanding. A probe that has not
    ///   reported back within one cooldown is treated as abandoned.
    pub fn allow_attempt(&self) -> bool {
        let mut inner = self.lock_inner();
        let now = Instant::now();

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .is_none_or(|t| now.duration_since(t) >= self.config.cooldown);
                if cooled_down {
                    tracing::info!(
                        circuit = %self.name,
                        "Circuit breaker transitioning to half-open state"
                    );
                    inner.state = CircuitState::HalfOpen;
                    inner.opened_at = None;
                    inner.probe_started_at = Some(now);
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => match inner.probe_started_at {
                Some(started) if now.duration_since(started) < self.config.cooldown => false,
                _ => {
                    inner.probe_started_at = Some(now);
                    true
                }
            },
        }
    }

    /// Records a successful attempt: closes a half-open circuit and clears the failure streak.
    pub fn record_success(&self) {
        let mut inner = self.lock_inner();

        match inner.state {
            CircuitState::HalfOpen => {
                tracing::info!(circuit = %self.name, "Circuit breaker closing after successful probe");
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.probe_started_at = None;
            }
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Records an attempt that ended without saying anything about source health
    /// (not found, rate limited). Frees the half-open probe slot, nothing else.
    pub fn record_neutral(&self) {
        let mut inner = self.lock_inner();
        if inner.state == CircuitState::HalfOpen {
            inner.probe_started_at = None;
        }
    }

    /// Records a counted failure (server or network error).
    pub fn record_failure(&self) {
        let mut inner = self.lock_inner();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    tracing::warn!(
                        circuit = %self.name,
                        failures = inner.consecutive_failures,
                        cooldown_secs = self.config.cooldown.as_secs(),
                        "Circuit breaker opening after {} consecutive failures",
                        inner.consecutive_failures
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(
                    circuit = %self.name,
                    "Circuit breaker probe failed, returning to open state"
                );
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_started_at = None;
            }
            CircuitState::Open => {}
        }
    }

    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        tracing::info!(circuit = %self.name, "Circuit breaker manually reset");
        *inner = CircuitBreakerInner::new();
    }
}

/// Process-wide set of breakers, one per source, created lazily.
///
/// Each process owns its own view: breakers are not coordinated across
/// processes. Cloning shares the registry.
#[derive(Clone, Default)]
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    overrides: Arc<HashMap<String, CircuitBreakerConfig>>,
    breakers: Arc<Mutex<HashMap<String, CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            overrides: Arc::new(HashMap::new()),
            breakers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Use a different configuration for one source.
    pub fn with_override(mut self, source: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Arc::make_mut(&mut self.overrides).insert(source.into(), config);
        self
    }

    fn lock_breakers(&self) -> MutexGuard<'_, HashMap<String, CircuitBreaker>> {
        self.breakers.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned breaker registry");
            poisoned.into_inner()
        })
    }

    /// Returns the breaker for `source`, creating it on first reference.
    pub fn breaker(&self, source: &str) -> CircuitBreaker {
        let mut breakers = self.lock_breakers();
        breakers
            .entry(source.to_string())
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .get(source)
                    .cloned()
                    .unwrap_or_else(|| self.default_config.clone());
                CircuitBreaker::new(source, config)
            })
            .clone()
    }

    /// Stats for every registered source, sorted by name.
    pub fn snapshot(&self) -> Vec<CircuitBreakerStats> {
        let breakers: Vec<CircuitBreaker> = self.lock_breakers().values().cloned().collect();
        let mut stats: Vec<_> = breakers.iter().map(CircuitBreaker::stats).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn len(&self) -> usize {
        self.lock_breakers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Administrative reset: forgets every registered breaker.
    ///
    /// Breakers handed out earlier are reset too, so holders of a stale
    /// handle do not keep rejecting requests.
    pub fn reset_all(&self) {
        let drained: Vec<CircuitBreaker> = self.lock_breakers().drain().map(|(_, b)| b).collect();
        tracing::info!(count = drained.len(), "Resetting all circuit breakers");
        for breaker in drained {
            breaker.reset();
        }
    }
}
