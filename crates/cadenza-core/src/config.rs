//! Environment-driven configuration.
//!
//! Every knob has a code default; the environment only overrides the few
//! switches operators actually flip: `AI_FAILOVER_ENABLED`,
//! `AI_CACHE_ENABLED`, `RATE_LIMIT_FAIL_CLOSED`, and the distributed-store
//! coordinates. Configuration is resolved once at startup and carried in
//! the service object, never re-read per request.

use crate::breaker::BreakerConfig;
use crate::cache::CacheConfig;
use crate::failover::FailoverConfig;
use crate::ratelimit::RateLimits;
use crate::stream::StreamRecoveryOptions;

/// Parse a bool-ish configuration string.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

/// Read a bool-ish environment variable. Unset or unparseable values
/// return `None` so callers fall back to their own default.
pub fn bool_env(name: &str) -> Option<bool> {
    std::env::var(name).ok().as_deref().and_then(parse_bool)
}

pub fn is_production() -> bool {
    std::env::var("APP_ENV").is_ok_and(|v| v == "production")
}

/// Coordinates of the distributed rate-limit store, when configured.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub url: String,
    pub token: String,
}

impl StoreConfig {
    /// Present only when both `RATE_LIMIT_STORE_URL` and
    /// `RATE_LIMIT_STORE_TOKEN` are set.
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("RATE_LIMIT_STORE_URL").ok()?;
        let token = std::env::var("RATE_LIMIT_STORE_TOKEN").ok()?;
        Some(Self { url, token })
    }
}

/// Aggregate configuration for the resilience service.
#[derive(Debug, Clone, Default)]
pub struct ResilienceConfig {
    pub breaker: BreakerConfig,
    pub cache: CacheConfig,
    pub limits: RateLimits,
    pub failover: FailoverConfig,
    pub stream: StreamRecoveryOptions,
    pub store: Option<StoreConfig>,
}

impl ResilienceConfig {
    pub fn from_env() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            cache: CacheConfig::from_env(),
            limits: RateLimits::from_env(),
            failover: FailoverConfig::from_env(),
            stream: StreamRecoveryOptions::default(),
            store: StoreConfig::from_env(),
        }
    }
}
