//! Failover orchestration.
//!
//! Routes a logical "ask the AI" call to a primary provider and falls back
//! to the next one when the primary is unhealthy or fails with a provider
//! fault. Client-caused errors are rethrown untouched: they would fail the
//! same way everywhere and must not trip any circuit.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::breaker::{CircuitBreaker, KNOWN_PROVIDERS};
use crate::classify::is_provider_error;
use crate::config::bool_env;
use crate::error::{CadenzaError, Result};

#[derive(Debug, Clone)]
pub struct FailoverConfig {
    /// Master switch; when off, a primary failure is surfaced directly.
    pub enabled: bool,
    /// Extra attempts against the fallback after its first failure.
    pub max_retries: u32,
    /// First backoff delay; doubles per retry.
    pub backoff_base: Duration,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 1,
            backoff_base: Duration::from_secs(1),
        }
    }
}

impl FailoverConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: bool_env("AI_FAILOVER_ENABLED").unwrap_or(true),
            ..Self::default()
        }
    }
}

/// Successful resilient call: the result plus which provider served it.
#[derive(Debug)]
pub struct FailoverOutcome<T> {
    pub result: T,
    pub provider: String,
    pub used_fallback: bool,
    pub duration: Duration,
}

/// Orchestrates primary/fallback routing against a shared circuit breaker.
pub struct Failover {
    breaker: Arc<CircuitBreaker>,
    config: FailoverConfig,
}

impl Failover {
    pub fn new(breaker: Arc<CircuitBreaker>, config: FailoverConfig) -> Self {
        Self { breaker, config }
    }

    pub fn config(&self) -> &FailoverConfig {
        &self.config
    }

    /// Execute `primary_fn` with automatic failover to `fallback_fn`.
    ///
    /// The primary is skipped outright when its circuit is open. A primary
    /// failure that matches the provider-fault table records against the
    /// circuit and, with failover enabled, hands the request to the
    /// fallback with up to `max_retries` extra attempts and exponential
    /// backoff between them.
    pub async fn execute<T, P, PF, F, FF>(
        &self,
        primary_fn: P,
        fallback_fn: F,
        primary: &str,
        fallback: &str,
    ) -> Result<FailoverOutcome<T>>
    where
        P: FnOnce() -> PF,
        PF: Future<Output = Result<T>>,
        F: Fn() -> FF,
        FF: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let request_id = Uuid::new_v4();

        if self.breaker.is_open(primary) {
            debug!(%request_id, provider = primary, "Circuit open, skipping primary");
            if !self.config.enabled {
                return Err(CadenzaError::AllProvidersUnavailable {
                    tried: vec![primary.to_string()],
                });
            }
            return self
                .run_fallback(fallback_fn, primary, fallback, started, request_id)
                .await;
        }

        let err = match primary_fn().await {
            Ok(result) => {
                self.breaker.record_success(primary);
                return Ok(FailoverOutcome {
                    result,
                    provider: primary.to_string(),
                    used_fallback: false,
                    duration: started.elapsed(),
                });
            }
            Err(err) => err,
        };

        let message = err.to_string();
        if !is_provider_error(&message) {
            return Err(err);
        }
        self.breaker.record_failure(primary, Some(&message));

        if !self.config.enabled {
            return Err(err);
        }

        warn!(
            %request_id,
            provider = primary,
            fallback,
            error = %message,
            "Primary provider failed, failing over"
        );
        self.run_fallback(fallback_fn, primary, fallback, started, request_id)
            .await
    }

    async fn run_fallback<T, F, FF>(
        &self,
        fallback_fn: F,
        primary: &str,
        fallback: &str,
        started: Instant,
        request_id: Uuid,
    ) -> Result<FailoverOutcome<T>>
    where
        F: Fn() -> FF,
        FF: Future<Output = Result<T>>,
    {
        if self.breaker.is_open(fallback) {
            warn!(%request_id, primary, fallback, "All provider circuits open");
            return Err(CadenzaError::AllProvidersUnavailable {
                tried: vec![primary.to_string(), fallback.to_string()],
            });
        }

        let mut last_error = None;
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = self.config.backoff_base * 2u32.pow(attempt - 1);
                warn!(
                    %request_id,
                    provider = fallback,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying fallback after backoff"
                );
                tokio::time::sleep(delay).await;
            }
            match fallback_fn().await {
                Ok(result) => {
                    self.breaker.record_success(fallback);
                    return Ok(FailoverOutcome {
                        result,
                        provider: fallback.to_string(),
                        used_fallback: true,
                        duration: started.elapsed(),
                    });
                }
                Err(err) => {
                    let message = err.to_string();
                    if !is_provider_error(&message) {
                        return Err(err);
                    }
                    self.breaker.record_failure(fallback, Some(&message));
                    last_error = Some(err);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| CadenzaError::internal("Fallback retries exhausted")))
    }

    /// Pick a provider whose circuit is not open: `preferred` when healthy,
    /// otherwise the first healthy provider in priority order, skipping
    /// `preferred`.
    pub fn select_healthy(&self, preferred: &str) -> Option<String> {
        if !self.breaker.is_open(preferred) {
            return Some(preferred.to_string());
        }
        KNOWN_PROVIDERS
            .iter()
            .filter(|&&p| p != preferred)
            .find(|&&p| !self.breaker.is_open(p))
            .map(|&p| p.to_string())
    }
}
