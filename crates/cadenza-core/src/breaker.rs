//! Per-provider circuit breaker.
//!
//! Tracks consecutive failures per provider id and fails fast once a
//! provider has proven unhealthy. The open→half-open transition is lazy:
//! it happens when the state is read, not on a background timer, so the
//! whole machine is a function of `(state, now)` and tests can inject the
//! clock.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

/// Fixed provider set, in failover priority order.
pub const KNOWN_PROVIDERS: [&str; 5] = ["openai", "google", "anthropic", "xai", "moonshotai"];

/// Circuit phase for a single provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitPhase {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the circuit.
    pub failure_threshold: u32,
    /// How long an open circuit waits before allowing a half-open probe.
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
struct CircuitState {
    phase: CircuitPhase,
    failures: u32,
    total_failures: u64,
    last_failure_at: Option<Instant>,
    last_success_at: Option<Instant>,
}

impl Default for CircuitState {
    fn default() -> Self {
        Self {
            phase: CircuitPhase::Closed,
            failures: 0,
            total_failures: 0,
            last_failure_at: None,
            last_success_at: None,
        }
    }
}

/// Health snapshot for one provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub healthy: bool,
    pub state: CircuitPhase,
    pub failures: u32,
    pub total_failures: u64,
}

/// Shared, lock-based circuit breaker tracking per-provider state.
///
/// Thread-safe via `RwLock`; contention is low because state only changes
/// on failures, successes, and the lazy half-open transition.
pub struct CircuitBreaker {
    config: BreakerConfig,
    states: RwLock<HashMap<String, CircuitState>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Record a failed call against `provider`.
    ///
    /// A failure while half-open re-opens the circuit immediately: the
    /// probe request was the single grace attempt.
    pub fn record_failure(&self, provider: &str, detail: Option<&str>) {
        let mut states = self.states.write().expect("CircuitBreaker lock poisoned");
        let state = states.entry(provider.to_string()).or_default();
        state.failures += 1;
        state.total_failures += 1;
        state.last_failure_at = Some(Instant::now());

        if state.phase == CircuitPhase::HalfOpen {
            state.phase = CircuitPhase::Open;
            warn!(
                provider,
                failures = state.failures,
                detail = detail.unwrap_or(""),
                "Half-open probe failed, circuit re-opened"
            );
        } else if state.phase != CircuitPhase::Open
            && state.failures >= self.config.failure_threshold
        {
            state.phase = CircuitPhase::Open;
            warn!(
                provider,
                failures = state.failures,
                detail = detail.unwrap_or(""),
                "Circuit opened"
            );
        }
    }

    /// Record a successful call: closes the circuit and resets the
    /// consecutive-failure counter. Lifetime `total_failures` is kept.
    pub fn record_success(&self, provider: &str) {
        let mut states = self.states.write().expect("CircuitBreaker lock poisoned");
        let state = states.entry(provider.to_string()).or_default();
        if state.phase != CircuitPhase::Closed {
            info!(provider, "Circuit closed after successful call");
        }
        state.phase = CircuitPhase::Closed;
        state.failures = 0;
        state.last_success_at = Some(Instant::now());
    }

    /// Whether `provider` should be skipped right now.
    ///
    /// Never-seen providers are allowed through. An open circuit past its
    /// recovery timeout transitions to half-open and lets one probe pass.
    pub fn is_open(&self, provider: &str) -> bool {
        self.is_open_at(provider, Instant::now())
    }

    /// Clock-injected variant of [`is_open`](Self::is_open).
    pub fn is_open_at(&self, provider: &str, now: Instant) -> bool {
        let mut states = self.states.write().expect("CircuitBreaker lock poisoned");
        let Some(state) = states.get_mut(provider) else {
            return false;
        };
        if state.phase != CircuitPhase::Open {
            return false;
        }
        let recovered = state
            .last_failure_at
            .is_none_or(|at| now.saturating_duration_since(at) >= self.config.recovery_timeout);
        if recovered {
            state.phase = CircuitPhase::HalfOpen;
            info!(provider, "Recovery timeout elapsed, allowing half-open probe");
            return false;
        }
        true
    }

    /// Snapshot of every known provider's health, defaulting never-seen
    /// providers to healthy/closed.
    pub fn provider_health(&self) -> BTreeMap<String, ProviderHealth> {
        let states = self.states.read().expect("CircuitBreaker lock poisoned");
        KNOWN_PROVIDERS
            .iter()
            .map(|&provider| {
                let state = states.get(provider).cloned().unwrap_or_default();
                let health = ProviderHealth {
                    healthy: state.phase != CircuitPhase::Open,
                    state: state.phase,
                    failures: state.failures,
                    total_failures: state.total_failures,
                };
                (provider.to_string(), health)
            })
            .collect()
    }

    /// Forget all recorded state. Used by tests and admin tooling.
    pub fn reset(&self) {
        self.states
            .write()
            .expect("CircuitBreaker lock poisoned")
            .clear();
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
