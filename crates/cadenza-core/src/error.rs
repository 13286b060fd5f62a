use thiserror::Error;

use crate::classify::StreamErrorKind;

/// Root error type for all Cadenza operations.
#[derive(Error, Debug)]
pub enum CadenzaError {
    /// Client-caused failure. Never trips the circuit breaker and never
    /// triggers failover — it would fail the same way on every provider.
    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Provider error from '{provider}': {message}")]
    Provider {
        provider: String,
        message: String,
        status: Option<u16>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("All AI providers are unavailable right now. Please try again in a minute.")]
    AllProvidersUnavailable { tried: Vec<String> },

    #[error("Stream error ({kind}): {message}")]
    Stream {
        kind: StreamErrorKind,
        message: String,
    },

    /// Rate-limit or cache backing-store fault. The limiter resolves this
    /// into an explicit fail-open or fail-closed decision, never silently.
    #[error("Store error: {message}")]
    Store {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Request aborted")]
    Aborted,

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl CadenzaError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            status: None,
            source: None,
        }
    }

    pub fn provider_status(
        provider: impl Into<String>,
        message: impl Into<String>,
        status: u16,
    ) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            status: Some(status),
            source: None,
        }
    }

    pub fn stream(kind: StreamErrorKind, message: impl Into<String>) -> Self {
        Self::Stream {
            kind,
            message: message.into(),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
            source: None,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CadenzaError>;
