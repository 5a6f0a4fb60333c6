//! tiered-cache - Two-tier synchronized caching library
//!
//! This library keeps a fast in-process cache consistent with a shared store:
//! - L1: In-memory Moka cache with a per-entry TTL (fastest, per process)
//! - L2: Redis (shared across instances, durable)
//!
//! The cache supports:
//! - Background propagation of local writes to Redis (never blocks the writer)
//! - Refresh from Redis whenever a local entry expires
//! - Serving a stale value for a short retry period when Redis is unreachable
//! - Local-only values for data that cannot be encoded
//! - Typed and untyped access over the same entries
//! - Refresh notifications (refreshed / removed / stale) via broadcast

mod config;
mod error;
mod float_check;
mod local_store;
mod remote_store;
mod sync_policy;
mod tiered_cache;
mod value;

#[cfg(test)]
mod test_support;

pub use config::CacheConfig;
pub use error::CacheError;
pub use remote_store::{RedisStore, RedisStoreConfig, RemoteStore};
pub use sync_policy::{RefreshNotification, RefreshOutcome};
pub use tiered_cache::{TieredCache, WriteOptions};
pub use value::{CacheValue, JsonCodec, Ttl, ValueCodec};

// Re-export async_trait for implementors of RemoteStore
pub use async_trait::async_trait;
