//! Response cache keyed by a normalized conversation fingerprint.
//!
//! Capacity-bounded and TTL-expiring. Expiry is checked on read; overflow
//! evicts the oldest ~20% of entries by insertion order, which approximates
//! LRU closely enough for a 100-entry cache.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::{bool_env, is_production};
use crate::message::{ChatMessage, Role};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Maximum number of entries held at once.
    pub capacity: usize,
    /// TTL applied when the caller does not specify one.
    pub default_ttl: Duration,
    /// Prompts shorter than this produce the empty "do not cache" key.
    pub min_prompt_len: usize,
    /// Responses shorter than this are never stored.
    pub min_response_len: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 100,
            default_ttl: Duration::from_secs(60 * 60),
            min_prompt_len: 10,
            min_response_len: 50,
        }
    }
}

impl CacheConfig {
    /// Explicit `AI_CACHE_ENABLED` wins; otherwise the cache is on only in
    /// production.
    pub fn from_env() -> Self {
        Self {
            enabled: bool_env("AI_CACHE_ENABLED").unwrap_or_else(is_production),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    model: String,
    hits: u64,
    created_at: Instant,
    ttl: Duration,
    seq: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    next_seq: u64,
}

/// Summary of one cached entry, for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntrySummary {
    pub key: String,
    pub hits: u64,
    pub age_ms: u64,
    pub model: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub enabled: bool,
    /// Top 10 entries by hit count, descending.
    pub top_entries: Vec<CacheEntrySummary>,
}

/// In-process response cache shared across requests.
pub struct ResponseCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Derive a cache key from the last user message, the chat mode, and an
    /// optional context signature.
    ///
    /// The text is whitespace-collapsed and lowercased before hashing, so
    /// trivially reworded prompts land on the same key. Returns the empty
    /// string when the prompt is too short to be worth caching; callers
    /// treat that as "do not cache". Mode and signature stay in clear text
    /// so invalidation can match on them.
    pub fn key(
        &self,
        messages: &[ChatMessage],
        mode: &str,
        context_signature: Option<&str>,
    ) -> String {
        let text = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("");
        let normalized = text
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        if normalized.chars().count() < self.config.min_prompt_len {
            return String::new();
        }
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        format!(
            "{mode}:{}:{}",
            context_signature.unwrap_or(""),
            &digest[..16]
        )
    }

    /// Store a response. No-op when the cache is disabled, the key is the
    /// "do not cache" sentinel, or the response is too short to be a real
    /// answer.
    pub fn insert(&self, key: &str, response: &str, model: &str, ttl: Option<Duration>) {
        if !self.config.enabled || key.is_empty() || response.len() < self.config.min_response_len {
            return;
        }
        let mut inner = self.inner.lock().expect("ResponseCache lock poisoned");
        if inner.entries.len() >= self.config.capacity && !inner.entries.contains_key(key) {
            let evict = self.config.capacity.div_ceil(5);
            Self::evict_oldest(&mut inner, evict);
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            key.to_string(),
            CacheEntry {
                value: response.to_string(),
                model: model.to_string(),
                hits: 0,
                created_at: Instant::now(),
                ttl: ttl.unwrap_or(self.config.default_ttl),
                seq,
            },
        );
    }

    fn evict_oldest(inner: &mut CacheInner, count: usize) {
        let mut by_age: Vec<(String, u64)> = inner
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.seq))
            .collect();
        by_age.sort_by_key(|(_, seq)| *seq);
        for (key, _) in by_age.into_iter().take(count) {
            inner.entries.remove(&key);
        }
        debug!(evicted = count, "Cache at capacity, evicted oldest entries");
    }

    /// Look up a response. Expired entries are removed as a side effect and
    /// reported as misses; hits bump the entry's counter.
    pub fn get(&self, key: &str) -> Option<String> {
        self.get_at(key, Instant::now())
    }

    /// Clock-injected variant of [`get`](Self::get).
    pub fn get_at(&self, key: &str, now: Instant) -> Option<String> {
        if !self.config.enabled || key.is_empty() {
            return None;
        }
        let mut inner = self.inner.lock().expect("ResponseCache lock poisoned");
        let expired = match inner.entries.get_mut(key) {
            None => return None,
            Some(entry) => {
                if now.saturating_duration_since(entry.created_at) >= entry.ttl {
                    true
                } else {
                    entry.hits += 1;
                    return Some(entry.value.clone());
                }
            }
        };
        if expired {
            inner.entries.remove(key);
        }
        None
    }

    /// Remove every entry whose key contains `pattern`. Returns how many
    /// were removed.
    pub fn invalidate_matching(&self, pattern: &str) -> usize {
        let mut inner = self.inner.lock().expect("ResponseCache lock poisoned");
        let before = inner.entries.len();
        inner.entries.retain(|key, _| !key.contains(pattern));
        before - inner.entries.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("ResponseCache lock poisoned");
        inner.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("ResponseCache lock poisoned")
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().expect("ResponseCache lock poisoned");
        let mut top: Vec<CacheEntrySummary> = inner
            .entries
            .iter()
            .map(|(key, entry)| CacheEntrySummary {
                key: key.clone(),
                hits: entry.hits,
                age_ms: entry.created_at.elapsed().as_millis() as u64,
                model: entry.model.clone(),
            })
            .collect();
        top.sort_by(|a, b| b.hits.cmp(&a.hits));
        top.truncate(10);
        CacheStats {
            size: inner.entries.len(),
            capacity: self.config.capacity,
            enabled: self.config.enabled,
            top_entries: top,
        }
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}
