use std::time::{Duration, Instant};

use cadenza_core::cache::{CacheConfig, ResponseCache};
use cadenza_core::message::ChatMessage;
use pretty_assertions::assert_eq;

fn cache() -> ResponseCache {
    ResponseCache::new(CacheConfig::default())
}

fn long_response(tag: &str) -> String {
    format!("{tag}: a response body comfortably past the fifty character floor")
}

#[test]
fn key_is_deterministic() {
    let cache = cache();
    let messages = vec![ChatMessage::user("what song is playing right now?")];
    let a = cache.key(&messages, "adaptive", None);
    let b = cache.key(&messages, "adaptive", None);
    assert_eq!(a, b);
    assert!(!a.is_empty());
}

#[test]
fn key_normalizes_case_and_whitespace() {
    let cache = cache();
    let a = cache.key(
        &[ChatMessage::user("What Song Is Playing Right Now?")],
        "adaptive",
        None,
    );
    let b = cache.key(
        &[ChatMessage::user("  what   song is playing right now?  ")],
        "adaptive",
        None,
    );
    assert_eq!(a, b);
}

#[test]
fn key_differs_by_mode() {
    let cache = cache();
    let messages = vec![ChatMessage::user("what song is playing right now?")];
    let a = cache.key(&messages, "adaptive", None);
    let b = cache.key(&messages, "focused", None);
    assert_ne!(a, b);
}

#[test]
fn key_differs_by_context_signature() {
    let cache = cache();
    let messages = vec![ChatMessage::user("what song is playing right now?")];
    let a = cache.key(&messages, "adaptive", Some("playlist-a"));
    let b = cache.key(&messages, "adaptive", Some("playlist-b"));
    assert_ne!(a, b);
}

#[test]
fn key_uses_last_user_message() {
    let cache = cache();
    let history = vec![
        ChatMessage::user("an earlier question about something else"),
        ChatMessage::assistant("an earlier answer"),
        ChatMessage::user("what song is playing right now?"),
    ];
    let solo = vec![ChatMessage::user("what song is playing right now?")];
    assert_eq!(
        cache.key(&history, "adaptive", None),
        cache.key(&solo, "adaptive", None)
    );
}

#[test]
fn short_prompt_yields_uncacheable_key() {
    let cache = cache();
    let key = cache.key(&[ChatMessage::user("hi")], "adaptive", None);
    assert_eq!(key, "");
}

#[test]
fn empty_key_is_never_stored_or_served() {
    let cache = cache();
    cache.insert("", &long_response("x"), "openai", None);
    assert_eq!(cache.len(), 0);
    assert_eq!(cache.get(""), None);
}

#[test]
fn short_responses_are_not_stored() {
    let cache = cache();
    cache.insert("adaptive::abc", "too short", "openai", None);
    assert_eq!(cache.len(), 0);
}

#[test]
fn hit_returns_value_and_counts() {
    let cache = cache();
    let response = long_response("hit");
    cache.insert("adaptive::abc", &response, "openai", None);

    assert_eq!(cache.get("adaptive::abc"), Some(response));
    assert!(cache.get("adaptive::abc").is_some());

    let stats = cache.stats();
    assert_eq!(stats.size, 1);
    assert_eq!(stats.top_entries[0].hits, 2);
    assert_eq!(stats.top_entries[0].model, "openai");
}

#[test]
fn expired_entry_is_removed_on_read() {
    let cache = cache();
    cache.insert(
        "adaptive::abc",
        &long_response("ttl"),
        "openai",
        Some(Duration::from_millis(100)),
    );
    assert!(cache.get("adaptive::abc").is_some());

    let later = Instant::now() + Duration::from_millis(150);
    assert_eq!(cache.get_at("adaptive::abc", later), None);
    assert_eq!(cache.len(), 0);
}

#[test]
fn overflow_evicts_oldest_fifth() {
    let cache = cache();
    for i in 0..100 {
        cache.insert(&format!("adaptive::key-{i}"), &long_response("fill"), "openai", None);
    }
    assert_eq!(cache.len(), 100);

    cache.insert("adaptive::key-100", &long_response("over"), "openai", None);
    assert_eq!(cache.len(), 81);

    // The oldest twenty made room; the newest survived.
    assert_eq!(cache.get("adaptive::key-0"), None);
    assert_eq!(cache.get("adaptive::key-19"), None);
    assert!(cache.get("adaptive::key-20").is_some());
    assert!(cache.get("adaptive::key-100").is_some());
}

#[test]
fn invalidate_matching_removes_by_substring() {
    let cache = cache();
    cache.insert("adaptive::aaa", &long_response("1"), "openai", None);
    cache.insert("adaptive::bbb", &long_response("2"), "openai", None);
    cache.insert("focused::ccc", &long_response("3"), "google", None);

    let removed = cache.invalidate_matching("adaptive");
    assert_eq!(removed, 2);
    assert_eq!(cache.len(), 1);
    assert!(cache.get("focused::ccc").is_some());
}

#[test]
fn clear_empties_the_cache() {
    let cache = cache();
    cache.insert("adaptive::aaa", &long_response("1"), "openai", None);
    cache.clear();
    assert!(cache.is_empty());
}

#[test]
fn disabled_cache_stores_nothing() {
    let cache = ResponseCache::new(CacheConfig {
        enabled: false,
        ..CacheConfig::default()
    });
    cache.insert("adaptive::aaa", &long_response("1"), "openai", None);
    assert_eq!(cache.len(), 0);
    assert_eq!(cache.get("adaptive::aaa"), None);
    assert!(!cache.enabled());
}

#[test]
fn stats_rank_by_hits() {
    let cache = cache();
    cache.insert("adaptive::cold", &long_response("cold"), "openai", None);
    cache.insert("adaptive::warm", &long_response("warm"), "google", None);
    for _ in 0..3 {
        cache.get("adaptive::warm");
    }
    cache.get("adaptive::cold");

    let stats = cache.stats();
    assert_eq!(stats.capacity, 100);
    assert_eq!(stats.top_entries[0].key, "adaptive::warm");
    assert_eq!(stats.top_entries[0].hits, 3);
}
