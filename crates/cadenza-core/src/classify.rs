//! String-pattern fault classification.
//!
//! Upstream SDKs are heterogeneous, so both classifiers match lowercased
//! substrings of error messages rather than typed hierarchies. These two
//! match tables are the only place patterns are defined; the rest of the
//! crate switches on the closed enums they produce.

use serde::{Deserialize, Serialize};

/// Message fragments that indicate a transient provider-side fault:
/// network, timeout, rate limit, 5xx, or a model that is not being served.
const PROVIDER_FAULT_PATTERNS: &[&str] = &[
    "network",
    "connection",
    "econnrefused",
    "econnreset",
    "socket hang up",
    "fetch failed",
    "timeout",
    "timed out",
    "etimedout",
    "rate limit",
    "rate_limit",
    "too many requests",
    "429",
    "500",
    "502",
    "503",
    "504",
    "internal server error",
    "bad gateway",
    "service unavailable",
    "gateway timeout",
    "overloaded",
    "server_error",
    "model not found",
    "model_not_found",
    "no such model",
    "model is not available",
];

/// Message fragments that indicate a client-caused 4xx failure. These must
/// not trip the breaker: the request would fail identically on retry and on
/// every other provider.
const CLIENT_FAULT_PATTERNS: &[&str] = &[
    "invalid api key",
    "incorrect api key",
    "invalid x-api-key",
    "authentication",
    "unauthorized",
    "401",
    "403",
    "bad request",
    "invalid request",
    "400",
    "content policy",
    "content_policy",
    "content management policy",
    "context length",
    "maximum context",
];

/// Whether an error message looks like a transient provider fault that
/// should count against the circuit breaker and is eligible for failover.
pub fn is_provider_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    if CLIENT_FAULT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return false;
    }
    PROVIDER_FAULT_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Classified kind of a mid-stream fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamErrorKind {
    Parse,
    Connection,
    Timeout,
    Incomplete,
    Provider,
    Unknown,
}

impl std::fmt::Display for StreamErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Parse => "parse_error",
            Self::Connection => "connection_error",
            Self::Timeout => "timeout_error",
            Self::Incomplete => "incomplete_error",
            Self::Provider => "provider_error",
            Self::Unknown => "unknown_error",
        };
        f.write_str(s)
    }
}

const PARSE_PATTERNS: &[&str] = &["parse", "json", "unexpected token", "malformed", "invalid chunk"];
const CONNECTION_PATTERNS: &[&str] = &[
    "connection",
    "network",
    "econnreset",
    "econnrefused",
    "socket",
    "fetch failed",
];
const TIMEOUT_PATTERNS: &[&str] = &["timeout", "timed out", "etimedout", "deadline"];
const INCOMPLETE_PATTERNS: &[&str] = &[
    "incomplete",
    "unexpected end",
    "truncated",
    "stream ended",
    "premature close",
];

/// Classify a mid-stream error message. First matching category wins, in
/// the fixed order parse → connection → timeout → incomplete → provider.
pub fn classify_stream_error(message: &str) -> StreamErrorKind {
    let lower = message.to_lowercase();
    if PARSE_PATTERNS.iter().any(|p| lower.contains(p)) {
        StreamErrorKind::Parse
    } else if CONNECTION_PATTERNS.iter().any(|p| lower.contains(p)) {
        StreamErrorKind::Connection
    } else if TIMEOUT_PATTERNS.iter().any(|p| lower.contains(p)) {
        StreamErrorKind::Timeout
    } else if INCOMPLETE_PATTERNS.iter().any(|p| lower.contains(p)) {
        StreamErrorKind::Incomplete
    } else if is_provider_error(&lower) {
        StreamErrorKind::Provider
    } else {
        StreamErrorKind::Unknown
    }
}

/// Whether a stream fault is worth retrying. Parse and provider faults are
/// not: re-reading the same broken payload or hammering a failing provider
/// does not help.
pub fn is_recoverable(kind: StreamErrorKind) -> bool {
    matches!(
        kind,
        StreamErrorKind::Connection | StreamErrorKind::Timeout | StreamErrorKind::Incomplete
    )
}

/// Fixed user-facing message per fault kind. Raw upstream error text never
/// reaches clients.
pub fn stream_error_message(kind: StreamErrorKind) -> &'static str {
    match kind {
        StreamErrorKind::Parse => "The response could not be read. Please try again.",
        StreamErrorKind::Connection => {
            "The connection was interrupted. Please check your network and try again."
        }
        StreamErrorKind::Timeout => "The response took too long. Please try again.",
        StreamErrorKind::Incomplete => "The response was cut off. Please try again.",
        StreamErrorKind::Provider => {
            "The AI service is having trouble right now. Please try again in a moment."
        }
        StreamErrorKind::Unknown => "Something went wrong. Please try again.",
    }
}
