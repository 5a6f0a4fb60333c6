//! In-process expiring store (L1)
//!
//! A Moka cache with a per-entry expiration policy. Natural expirations are
//! forwarded as [`ExpiryEvent`]s over an unbounded channel; explicit removals,
//! replacements and capacity evictions are not.

use moka::{Expiry, future::Cache, notification::RemovalCause};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::mpsc;
use tracing::debug;

use crate::{CacheValue, Ttl};

/// One local countdown reaching zero
#[derive(Debug, Clone)]
pub struct ExpiryEvent {
    pub key: String,
    /// The value as last known locally
    pub value: CacheValue,
    /// The TTL the entry was stored with
    pub ttl: Ttl,
    /// The TTL of the last write or refresh; differs from `ttl` only while a
    /// stale value is being retried
    pub written_ttl: Ttl,
}

#[derive(Debug, Clone)]
pub(crate) struct LocalEntry {
    pub(crate) value: CacheValue,
    pub(crate) ttl: Ttl,
    pub(crate) written_ttl: Ttl,
}

/// Each entry lives for its own TTL, restarted on every write.
struct EntryExpiry;

impl Expiry<String, LocalEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &LocalEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        entry.ttl.duration()
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &LocalEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        entry.ttl.duration()
    }
}

#[derive(Clone)]
pub(crate) struct LocalStore {
    cache: Cache<String, LocalEntry>,
}

impl LocalStore {
    pub(crate) fn new(
        max_capacity: Option<u64>,
        expired_tx: mpsc::UnboundedSender<ExpiryEvent>,
    ) -> Self {
        let listener = move |key: Arc<String>, entry: LocalEntry, cause: RemovalCause| {
            if cause != RemovalCause::Expired {
                return;
            }
            let event = ExpiryEvent {
                key: key.as_ref().clone(),
                value: entry.value,
                ttl: entry.ttl,
                written_ttl: entry.written_ttl,
            };
            if expired_tx.send(event).is_err() {
                debug!("Local store: expiry for key {} dropped, refresh worker gone", key);
            }
        };

        let mut builder = Cache::<String, LocalEntry>::builder()
            .expire_after(EntryExpiry)
            .eviction_listener(listener);
        if let Some(capacity) = max_capacity {
            builder = builder.max_capacity(capacity);
        }

        Self {
            cache: builder.build(),
        }
    }

    pub(crate) async fn insert(&self, key: String, value: CacheValue, ttl: Ttl) {
        self.insert_retry(key, value, ttl, ttl).await;
    }

    /// Insert a stale value for `retry_ttl`, remembering the TTL it was written with
    pub(crate) async fn insert_retry(
        &self,
        key: String,
        value: CacheValue,
        retry_ttl: Ttl,
        written_ttl: Ttl,
    ) {
        let entry = LocalEntry {
            value,
            ttl: retry_ttl,
            written_ttl,
        };
        self.cache.insert(key, entry).await;
    }

    pub(crate) async fn get(&self, key: &str) -> Option<LocalEntry> {
        self.cache.get(key).await
    }

    pub(crate) async fn remove(&self, key: &str) -> Option<LocalEntry> {
        self.cache.remove(key).await
    }

    pub(crate) fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    /// Run housekeeping; this is what delivers pending expiry events.
    pub(crate) async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }

    pub(crate) fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

/// Drive housekeeping at a fixed interval until aborted
pub(crate) async fn run_sweeper(local: LocalStore, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        local.run_pending_tasks().await;
    }
}
