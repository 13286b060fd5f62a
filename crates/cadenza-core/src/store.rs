//! Distributed rate-limit store.
//!
//! The limiter talks to the store through the [`RateLimitStore`] trait so
//! tests can swap in fakes. [`HttpRateLimitStore`] speaks the REST pipeline
//! dialect of serverless Redis offerings: one round trip that increments
//! the counter, sets the window expiry if the key is new, and reads the
//! remaining TTL.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use url::Url;

use crate::error::{CadenzaError, Result};

/// Counter state after an increment.
#[derive(Debug, Clone, Copy)]
pub struct StoreWindow {
    /// Requests seen in the current window, including this one.
    pub count: u64,
    /// Milliseconds until the window resets.
    pub reset_in_ms: u64,
}

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Atomically increment the counter for `key`, starting a new window of
    /// `window` duration if none is active.
    async fn incr_window(&self, key: &str, window: Duration) -> Result<StoreWindow>;
}

/// REST-pipeline client for an Upstash-style Redis counter.
#[derive(Debug)]
pub struct HttpRateLimitStore {
    base_url: Url,
    token: SecretString,
    client: reqwest::Client,
}

impl HttpRateLimitStore {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self> {
        let base_url = Url::parse(base_url).map_err(|e| CadenzaError::Config {
            message: format!("Invalid rate-limit store URL: {e}"),
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .expect("Failed to build HTTP client");
        Ok(Self {
            base_url,
            token: SecretString::from(token.into()),
            client,
        })
    }

    fn pipeline_url(&self) -> Result<Url> {
        self.base_url
            .join("pipeline")
            .map_err(|e| CadenzaError::Config {
                message: format!("Invalid rate-limit store URL: {e}"),
            })
    }
}

#[async_trait]
impl RateLimitStore for HttpRateLimitStore {
    async fn incr_window(&self, key: &str, window: Duration) -> Result<StoreWindow> {
        let window_ms = window.as_millis() as u64;
        let body = serde_json::json!([
            ["INCR", key],
            ["PEXPIRE", key, window_ms, "NX"],
            ["PTTL", key],
        ]);

        let response = self
            .client
            .post(self.pipeline_url()?)
            .bearer_auth(self.token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| CadenzaError::Store {
                message: format!("Rate-limit store request failed: {e}"),
                source: Some(Box::new(e)),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CadenzaError::store(format!(
                "Rate-limit store returned {status}"
            )));
        }

        let results: Vec<serde_json::Value> =
            response.json().await.map_err(|e| CadenzaError::Store {
                message: format!("Rate-limit store returned malformed JSON: {e}"),
                source: Some(Box::new(e)),
            })?;

        let count = results
            .first()
            .and_then(|v| v.get("result"))
            .and_then(|v| v.as_u64())
            .ok_or_else(|| CadenzaError::store("Rate-limit store pipeline missing INCR result"))?;
        // PTTL is negative when the key has no expiry; treat that as a
        // fresh window.
        let reset_in_ms = results
            .get(2)
            .and_then(|v| v.get("result"))
            .and_then(|v| v.as_i64())
            .filter(|ttl| *ttl > 0)
            .map(|ttl| ttl as u64)
            .unwrap_or(window_ms);

        Ok(StoreWindow { count, reset_in_ms })
    }
}
