//! The composed resilience service.
//!
//! One `Resilience` instance is built at process startup and injected into
//! request handlers; all shared state (circuit states, cache entries,
//! rate-limit counters) lives inside it rather than in module-level
//! globals.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::breaker::{CircuitBreaker, ProviderHealth};
use crate::cache::{CacheStats, ResponseCache};
use crate::config::ResilienceConfig;
use crate::error::{CadenzaError, Result};
use crate::failover::Failover;
use crate::message::ChatMessage;
use crate::ratelimit::{ClientId, Decision, LimitPool, RateLimitMode, RateLimiter};
use crate::store::{HttpRateLimitStore, RateLimitStore};

/// A logical chat request entering the resilience pipeline.
#[derive(Debug, Clone)]
pub struct ChatRequest<'a> {
    pub client: &'a ClientId,
    pub messages: &'a [ChatMessage],
    /// Chat mode, part of the cache key (e.g. "adaptive").
    pub mode: &'a str,
    pub context_signature: Option<&'a str>,
    pub primary: &'a str,
    pub fallback: &'a str,
}

/// Result of a resilient chat call.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub text: String,
    /// Provider id that served the response, or "cache".
    pub provider: String,
    pub from_cache: bool,
    pub duration: Duration,
}

pub struct ResilienceBuilder {
    config: ResilienceConfig,
    store: Option<Arc<dyn RateLimitStore>>,
}

impl ResilienceBuilder {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            config,
            store: None,
        }
    }

    /// Use a distributed rate-limit store instead of the in-memory map.
    pub fn store(mut self, store: Arc<dyn RateLimitStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<Resilience> {
        let breaker = Arc::new(CircuitBreaker::new(self.config.breaker.clone()));
        let cache = ResponseCache::new(self.config.cache.clone());

        let store = match (self.store, &self.config.store) {
            (Some(store), _) => Some(store),
            (None, Some(cfg)) => {
                let http: Arc<dyn RateLimitStore> =
                    Arc::new(HttpRateLimitStore::new(&cfg.url, cfg.token.clone())?);
                Some(http)
            }
            (None, None) => None,
        };
        let mut limiter = RateLimiter::new(self.config.limits.clone());
        if let Some(store) = store {
            limiter = limiter.with_store(store);
        }

        let failover = Failover::new(Arc::clone(&breaker), self.config.failover.clone());
        Ok(Resilience {
            breaker,
            cache,
            limiter,
            failover,
        })
    }
}

/// Circuit breaker + cache + rate limiter + failover behind one handle.
pub struct Resilience {
    breaker: Arc<CircuitBreaker>,
    cache: ResponseCache,
    limiter: RateLimiter,
    failover: Failover,
}

impl Resilience {
    pub fn builder(config: ResilienceConfig) -> ResilienceBuilder {
        ResilienceBuilder::new(config)
    }

    pub fn from_env() -> Result<Self> {
        ResilienceBuilder::new(ResilienceConfig::from_env()).build()
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn failover(&self) -> &Failover {
        &self.failover
    }

    /// Run one chat request through the full pipeline: rate-limit
    /// admission, cache lookup, circuit-gated failover execution, and
    /// cache store on success.
    pub async fn chat<P, PF, F, FF>(
        &self,
        request: ChatRequest<'_>,
        primary_fn: P,
        fallback_fn: F,
    ) -> Result<ChatOutcome>
    where
        P: FnOnce() -> PF,
        PF: Future<Output = Result<String>>,
        F: Fn() -> FF,
        FF: Future<Output = Result<String>>,
    {
        let started = Instant::now();

        match self.limiter.check_async(request.client, LimitPool::Chat).await {
            Decision::Allowed => {}
            Decision::Denied { retry_after } => {
                return Err(CadenzaError::RateLimited {
                    retry_after_ms: retry_after.as_millis() as u64,
                });
            }
        }

        let key = self
            .cache
            .key(request.messages, request.mode, request.context_signature);
        if let Some(text) = self.cache.get(&key) {
            debug!(mode = request.mode, "Cache hit, skipping providers");
            return Ok(ChatOutcome {
                text,
                provider: "cache".to_string(),
                from_cache: true,
                duration: started.elapsed(),
            });
        }

        let outcome = self
            .failover
            .execute(primary_fn, fallback_fn, request.primary, request.fallback)
            .await?;

        self.cache
            .insert(&key, &outcome.result, &outcome.provider, None);

        Ok(ChatOutcome {
            text: outcome.result,
            provider: outcome.provider,
            from_cache: false,
            duration: started.elapsed(),
        })
    }

    pub fn provider_health(&self) -> BTreeMap<String, ProviderHealth> {
        self.breaker.provider_health()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn rate_limit_mode(&self) -> RateLimitMode {
        self.limiter.mode()
    }

    /// Forget all circuit, cache, and rate-limit state. Tests and admin
    /// tooling only.
    pub fn reset(&self) {
        self.breaker.reset();
        self.cache.clear();
        self.limiter.clear();
    }
}
