//! Advisory Semaphore
//!
//! Signals that expensive content is being regenerated so concurrent requests
//! wait instead of regenerating it too. State lives in the shared
//! [`KeyValueCache`] as a millisecond timestamp per key:
//!
//! ```text
//! idle ── signal() ──→ holding ── clear_signal() ──→ idle
//!   ↑                     │
//!   └── expiration ───────┘   (a stale timestamp counts as idle)
//! ```
//!
//! # Not a mutex
//!
//! The cache has no compare-and-set, so two callers can both observe "not
//! signalling" and both write their timestamp. The critical section must be
//! short and a rare duplicate regeneration must be acceptable. This race is
//! left as is; a backend with atomic insert-if-absent would be needed to
//! close it.
//!
//! # Example
//!
//! ```no_run
//! # use contextspace_core::cache::{MemoryCache, Semaphore, SemaphoreConfig};
//! # use std::sync::Arc;
//! # use tokio_util::sync::CancellationToken;
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let semaphore = Semaphore::new(Arc::new(MemoryCache::new()), SemaphoreConfig::default())?;
//! let cancel = CancellationToken::new();
//!
//! semaphore.signal("course_modinfo_7", &cancel).await?;
//! // ... regenerate the expensive content ...
//! semaphore.clear_signal("course_modinfo_7").await?;
//! # Ok(())
//! # }
//! ```

use crate::cache::{CacheError, KeyValueCache};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Semaphore errors
#[derive(Error, Debug)]
pub enum SemaphoreError {
    #[error("Invalid semaphore key prefix")]
    InvalidKeyPrefix,

    /// Someone else kept signalling for longer than the exception timeout
    #[error("Semaphore timeout on '{key}' after {waited:?}")]
    Timeout { key: String, waited: Duration },

    #[error("Semaphore wait on '{key}' cancelled")]
    Cancelled { key: String },

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// What to do when the exception timeout elapses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Abort with [`SemaphoreError::Timeout`] to protect the backing system
    #[default]
    Fail,
    /// Take the signal anyway, accepting a possible duplicate computation
    Proceed,
}

/// Delay between polls while another caller is signalling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    Fixed { interval_ms: u64 },
    Exponential { initial_ms: u64, max_ms: u64 },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed { interval_ms: 1000 }
    }
}

impl Backoff {
    /// Delay before poll number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed { interval_ms } => Duration::from_millis(interval_ms),
            Backoff::Exponential { initial_ms, max_ms } => {
                let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
                Duration::from_millis(initial_ms.saturating_mul(factor).min(max_ms))
            }
        }
    }
}

/// Semaphore settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SemaphoreConfig {
    /// Prefix for every cache key; must not be empty
    pub key_prefix: String,

    /// Age after which a signal is ignored
    pub expiration_ms: u64,

    /// How long `signal()` waits before applying `on_timeout`
    pub exception_timeout_ms: u64,

    pub backoff: Backoff,

    pub on_timeout: TimeoutPolicy,
}

impl Default for SemaphoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "semaphore_".to_string(),
            expiration_ms: 60_000,
            exception_timeout_ms: 30_000,
            backoff: Backoff::default(),
            on_timeout: TimeoutPolicy::Fail,
        }
    }
}

/// Advisory lock over a shared key-value cache
pub struct Semaphore {
    cache: Arc<dyn KeyValueCache>,
    config: SemaphoreConfig,
}

impl Semaphore {
    /// Create a semaphore; rejects an empty key prefix
    pub fn new(cache: Arc<dyn KeyValueCache>, config: SemaphoreConfig) -> Result<Self, SemaphoreError> {
        if config.key_prefix.is_empty() {
            return Err(SemaphoreError::InvalidKeyPrefix);
        }
        Ok(Self { cache, config })
    }

    pub fn config(&self) -> &SemaphoreConfig {
        &self.config
    }

    fn cache_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    /// Whether a fresh signal is stored for `key`
    pub async fn is_signalling(&self, key: &str) -> Result<bool, SemaphoreError> {
        let Some(value) = self.cache.get(&self.cache_key(key)).await? else {
            return Ok(false);
        };

        let Some(signalled_at) = value.as_i64() else {
            tracing::warn!("Ignoring malformed semaphore value for '{}': {}", key, value);
            return Ok(false);
        };

        let age = chrono::Utc::now().timestamp_millis() - signalled_at;
        Ok(age < self.config.expiration_ms as i64)
    }

    /// Take the signal for `key`, waiting while someone else holds it
    ///
    /// Polls with the configured backoff until the signal clears or expires.
    /// After `exception_timeout_ms` the [`TimeoutPolicy`] decides between
    /// failing and proceeding. Cancelling `cancel` aborts the wait without
    /// taking the signal. The caller must call [`Semaphore::clear_signal`]
    /// once the protected work is done.
    pub async fn signal(&self, key: &str, cancel: &CancellationToken) -> Result<(), SemaphoreError> {
        let timeout = Duration::from_millis(self.config.exception_timeout_ms);
        let start = Instant::now();
        let mut attempt = 0u32;

        while self.is_signalling(key).await? {
            let waited = start.elapsed();
            if waited >= timeout {
                match self.config.on_timeout {
                    TimeoutPolicy::Fail => {
                        return Err(SemaphoreError::Timeout {
                            key: key.to_string(),
                            waited,
                        });
                    }
                    TimeoutPolicy::Proceed => {
                        tracing::warn!(
                            "Semaphore '{}' still signalling after {:?}, proceeding anyway",
                            key,
                            waited
                        );
                        break;
                    }
                }
            }

            // Never sleep past the timeout
            let delay = self
                .config
                .backoff
                .delay(attempt)
                .min(timeout.saturating_sub(waited));
            attempt = attempt.saturating_add(1);
            tracing::debug!("Semaphore '{}' busy, retry {} in {:?}", key, attempt, delay);

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(SemaphoreError::Cancelled { key: key.to_string() });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.cache
            .set(&self.cache_key(key), json!(chrono::Utc::now().timestamp_millis()))
            .await?;
        Ok(())
    }

    /// Stop signalling for `key`
    pub async fn clear_signal(&self, key: &str) -> Result<(), SemaphoreError> {
        self.cache.delete(&self.cache_key(key)).await?;
        Ok(())
    }
}
