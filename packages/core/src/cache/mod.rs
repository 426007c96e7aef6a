//! Caching Layer
//!
//! - [`KeyValueCache`] - shared key-value store seam (memory or SQL backed)
//! - [`InstanceCache`] - process-local memo of resolved context nodes
//! - [`Semaphore`] - advisory "regeneration in progress" signal over the shared cache

mod error;
mod instance_cache;
mod kv;
mod semaphore;

pub use error::CacheError;
pub use instance_cache::{InstanceCache, GENERATION_CACHE_KEY};
pub use kv::{KeyValueCache, MemoryCache, SqlKeyValueCache};
pub use semaphore::{Backoff, Semaphore, SemaphoreConfig, SemaphoreError, TimeoutPolicy};
