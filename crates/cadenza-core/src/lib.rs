//! # Cadenza Core
//!
//! AI provider resilience layer for a multi-provider chat backend.
//! Composes a per-provider circuit breaker, priority-ordered failover with
//! retry/backoff, per-client rate limiting, a TTL response cache, and
//! mid-stream fault recovery behind a single injectable service object.

pub mod breaker;
pub mod cache;
pub mod classify;
pub mod config;
pub mod error;
pub mod failover;
pub mod message;
pub mod ratelimit;
pub mod service;
pub mod store;
pub mod stream;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitPhase, KNOWN_PROVIDERS, ProviderHealth};
pub use cache::{CacheConfig, CacheEntrySummary, CacheStats, ResponseCache};
pub use classify::{
    StreamErrorKind, classify_stream_error, is_provider_error, is_recoverable,
    stream_error_message,
};
pub use config::ResilienceConfig;
pub use error::{CadenzaError, Result};
pub use failover::{Failover, FailoverConfig, FailoverOutcome};
pub use message::{ChatMessage, Role};
pub use ratelimit::{
    ClientId, Decision, HeaderSource, LimitPool, RateLimitMode, RateLimitResponse, RateLimiter,
    RateLimits, WindowLimit, client_identifier, rate_limit_response, sanitize_messages,
};
pub use service::{ChatOutcome, ChatRequest, Resilience, ResilienceBuilder};
pub use store::{HttpRateLimitStore, RateLimitStore, StoreWindow};
pub use stream::{
    ClassifiedStream, StreamEvent, StreamRecoveryOptions, recovering_stream, with_stream_recovery,
};
