//! Per-client rate limiting.
//!
//! Fixed-window counters keyed by (client id, pool). Chat and transcription
//! pools are tracked independently: exhausting one never affects the other.
//! Fingerprint-derived identifiers pass an additional short burst window,
//! so a client we cannot pin to a session is never treated more leniently
//! than one we can.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::{DashMap, mapref::entry::Entry};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::config::bool_env;
use crate::message::{ChatMessage, Role};
use crate::store::RateLimitStore;

const CLEANUP_EVERY_CHECKS: u64 = 512;

/// Maximum number of messages kept when sanitizing history.
pub const MAX_HISTORY: usize = 20;
/// Maximum characters kept per message content.
pub const MAX_CONTENT_LENGTH: usize = 4000;

/// Ordered header set hashed into a client fingerprint when no session
/// cookie is present. Order matters: it is part of the derivation.
pub const FINGERPRINT_HEADERS: [&str; 12] = [
    "user-agent",
    "accept",
    "accept-language",
    "accept-encoding",
    "sec-ch-ua",
    "sec-ch-ua-mobile",
    "sec-ch-ua-platform",
    "sec-fetch-dest",
    "sec-fetch-mode",
    "sec-fetch-site",
    "x-forwarded-for",
    "dnt",
];

/// Independently limited request pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitPool {
    Chat,
    Transcription,
}

impl LimitPool {
    fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Transcription => "transcription",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WindowLimit {
    pub max_requests: u32,
    pub window: Duration,
}

#[derive(Debug, Clone)]
pub struct RateLimits {
    pub chat: WindowLimit,
    pub transcription: WindowLimit,
    /// Short-window burst guard applied to fingerprint identifiers only.
    pub fingerprint_burst: WindowLimit,
    /// When the distributed store is configured but unreachable: reject
    /// everything (true) or admit everything (false).
    pub fail_closed: bool,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            chat: WindowLimit {
                max_requests: 20,
                window: Duration::from_secs(60),
            },
            transcription: WindowLimit {
                max_requests: 10,
                window: Duration::from_secs(60),
            },
            fingerprint_burst: WindowLimit {
                max_requests: 8,
                window: Duration::from_secs(10),
            },
            fail_closed: false,
        }
    }
}

impl RateLimits {
    pub fn from_env() -> Self {
        Self {
            fail_closed: bool_env("RATE_LIMIT_FAIL_CLOSED").unwrap_or(false),
            ..Self::default()
        }
    }
}

/// A rate-limited client identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientId {
    pub id: String,
    pub is_fingerprint: bool,
}

/// Source of request header values for fingerprint derivation.
pub trait HeaderSource {
    fn header(&self, name: &str) -> Option<String>;
}

impl HeaderSource for HashMap<String, String> {
    fn header(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Derive the rate-limit identity for a request: the session cookie value
/// when one exists, otherwise a SHA-256 fingerprint over a fixed ordered
/// header set. Collision-tolerant heuristic, not a security boundary.
pub fn client_identifier(session: Option<&str>, headers: &dyn HeaderSource) -> ClientId {
    if let Some(session) = session.filter(|s| !s.is_empty()) {
        return ClientId {
            id: session.to_string(),
            is_fingerprint: false,
        };
    }
    let mut hasher = Sha256::new();
    for name in FINGERPRINT_HEADERS {
        hasher.update(headers.header(name).unwrap_or_default().as_bytes());
        hasher.update([0u8]);
    }
    let digest = format!("{:x}", hasher.finalize());
    ClientId {
        id: format!("fp-{}", &digest[..32]),
        is_fingerprint: true,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum BucketScope {
    Pool(LimitPool),
    Burst,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    id: String,
    scope: BucketScope,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: Instant,
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied { retry_after: Duration },
}

impl Decision {
    pub fn allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Backing mode currently in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RateLimitMode {
    InMemory,
    Distributed,
}

/// Shared rate limiter. In-memory by default; consults a distributed store
/// through [`check_async`](Self::check_async) when one is configured.
pub struct RateLimiter {
    limits: RateLimits,
    buckets: DashMap<BucketKey, Window>,
    store: Option<Arc<dyn RateLimitStore>>,
    checks_seen: AtomicU64,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            buckets: DashMap::new(),
            store: None,
            checks_seen: AtomicU64::new(0),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn RateLimitStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn mode(&self) -> RateLimitMode {
        if self.store.is_some() {
            RateLimitMode::Distributed
        } else {
            RateLimitMode::InMemory
        }
    }

    fn limit_for(&self, pool: LimitPool) -> WindowLimit {
        match pool {
            LimitPool::Chat => self.limits.chat,
            LimitPool::Transcription => self.limits.transcription,
        }
    }

    /// In-memory window check.
    pub fn check(&self, client: &ClientId, pool: LimitPool) -> Decision {
        self.check_at(client, pool, Instant::now())
    }

    /// Clock-injected variant of [`check`](Self::check).
    pub fn check_at(&self, client: &ClientId, pool: LimitPool, now: Instant) -> Decision {
        if client.is_fingerprint {
            let burst_key = BucketKey {
                id: client.id.clone(),
                scope: BucketScope::Burst,
            };
            if let Decision::Denied { retry_after } =
                self.window_check(burst_key, self.limits.fingerprint_burst, now)
            {
                return Decision::Denied { retry_after };
            }
        }
        let key = BucketKey {
            id: client.id.clone(),
            scope: BucketScope::Pool(pool),
        };
        let decision = self.window_check(key, self.limit_for(pool), now);
        self.cleanup_if_needed(now);
        decision
    }

    fn window_check(&self, key: BucketKey, limit: WindowLimit, now: Instant) -> Decision {
        match self.buckets.entry(key) {
            Entry::Occupied(mut occupied) => {
                let window = occupied.get_mut();
                if now <= window.reset_at {
                    window.count += 1;
                    if window.count > limit.max_requests {
                        Decision::Denied {
                            retry_after: window.reset_at.saturating_duration_since(now),
                        }
                    } else {
                        Decision::Allowed
                    }
                } else {
                    window.count = 1;
                    window.reset_at = now + limit.window;
                    Decision::Allowed
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Window {
                    count: 1,
                    reset_at: now + limit.window,
                });
                Decision::Allowed
            }
        }
    }

    /// Window check against the distributed store when one is configured,
    /// falling back to the in-memory map otherwise.
    ///
    /// Store failures resolve to the explicit policy: fail-closed rejects,
    /// fail-open admits. Either way the fault is logged, never swallowed.
    /// The fingerprint burst guard always runs locally first.
    pub async fn check_async(&self, client: &ClientId, pool: LimitPool) -> Decision {
        let Some(store) = self.store.clone() else {
            return self.check(client, pool);
        };
        let now = Instant::now();
        if client.is_fingerprint {
            let burst_key = BucketKey {
                id: client.id.clone(),
                scope: BucketScope::Burst,
            };
            if let Decision::Denied { retry_after } =
                self.window_check(burst_key, self.limits.fingerprint_burst, now)
            {
                return Decision::Denied { retry_after };
            }
        }
        let limit = self.limit_for(pool);
        let key = format!("rl:{}:{}", pool.as_str(), client.id);
        match store.incr_window(&key, limit.window).await {
            Ok(window) => {
                if window.count > u64::from(limit.max_requests) {
                    Decision::Denied {
                        retry_after: Duration::from_millis(window.reset_in_ms),
                    }
                } else {
                    Decision::Allowed
                }
            }
            Err(err) => {
                warn!(
                    error = %err,
                    fail_closed = self.limits.fail_closed,
                    "Rate-limit store unreachable, applying failure policy"
                );
                if self.limits.fail_closed {
                    Decision::Denied {
                        retry_after: limit.window,
                    }
                } else {
                    Decision::Allowed
                }
            }
        }
    }

    fn cleanup_if_needed(&self, now: Instant) {
        let seen = self.checks_seen.fetch_add(1, Ordering::Relaxed) + 1;
        if seen % CLEANUP_EVERY_CHECKS != 0 {
            return;
        }
        let stale_after = self.max_window().saturating_mul(3);
        self.buckets
            .retain(|_, window| now.saturating_duration_since(window.reset_at) <= stale_after);
    }

    fn max_window(&self) -> Duration {
        [
            self.limits.chat.window,
            self.limits.transcription.window,
            self.limits.fingerprint_burst.window,
        ]
        .into_iter()
        .max()
        .unwrap_or(Duration::from_secs(60))
    }

    /// Drop all counters. Used by tests and admin tooling.
    pub fn clear(&self) {
        self.buckets.clear();
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimits::default())
    }
}

/// JSON body shape for a rejected request; route handlers serialize this
/// next to a `Retry-After` header.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitResponse {
    pub error: String,
    /// Whole seconds, rounded up.
    pub retry_after: u64,
}

pub fn rate_limit_response(retry_after: Duration) -> RateLimitResponse {
    RateLimitResponse {
        error: "Too many requests. Please slow down and try again.".to_string(),
        retry_after: (retry_after.as_millis() as u64).div_ceil(1000),
    }
}

/// Clamp and clean inbound conversation history before it reaches a
/// provider: cap length, truncate oversized content, strip HTML tags, and
/// normalize unexpected roles to user.
pub fn sanitize_messages(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    static HTML_TAG: std::sync::LazyLock<regex::Regex> =
        std::sync::LazyLock::new(|| regex::Regex::new(r"<[^>]*>").expect("valid regex"));

    let skip = messages.len().saturating_sub(MAX_HISTORY);
    messages
        .into_iter()
        .skip(skip)
        .map(|message| {
            let role = match message.role {
                Role::Assistant => Role::Assistant,
                _ => Role::User,
            };
            let stripped = HTML_TAG.replace_all(&message.content, "");
            let content = if stripped.chars().count() > MAX_CONTENT_LENGTH {
                stripped.chars().take(MAX_CONTENT_LENGTH).collect()
            } else {
                stripped.into_owned()
            };
            ChatMessage { role, content }
        })
        .collect()
}
