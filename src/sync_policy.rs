//! Synchronization between the local and remote tiers
//!
//! - Write path: eligible local writes are encoded and queued for the remote
//!   store. The queue is bounded and drained by a background worker, so a
//!   writer never waits on the network.
//! - Expiry path: when a local entry expires, the remote store is consulted and
//!   the entry is refreshed, removed, or kept stale for a short retry period.
//!   Every expiry yields exactly one [`RefreshOutcome`] and one notification.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::sync::{RwLock, broadcast, mpsc};
use tracing::{debug, warn};

use crate::{
    CacheConfig, CacheError, CacheValue, RemoteStore, Ttl, ValueCodec,
    local_store::{ExpiryEvent, LocalStore},
};

/// A zero-length retry would expire the stale value on the spot
const MIN_RETRY_TTL: Duration = Duration::from_millis(1);

/// Result of handling one local expiry
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// The remote store had a value; it replaced the local one under the same TTL
    Refreshed { value: CacheValue, ttl: Ttl },
    /// The remote store had no value; the key was dropped locally
    Removed,
    /// The remote store could not be consulted; the old value was kept for `retry_ttl`
    KeptStale { value: CacheValue, retry_ttl: Ttl },
}

/// Published to subscribers once per local expiry
#[derive(Debug, Clone)]
pub struct RefreshNotification {
    /// Name of the cache that handled the expiry
    pub source: Arc<str>,
    pub key: String,
    pub value: CacheValue,
    pub ttl: Ttl,
    /// The value is the pre-expiry one, kept because the remote store was unavailable
    pub stale: bool,
    /// The remote store confirmed the key is gone
    pub removed: bool,
}

impl RefreshNotification {
    /// The outcome this notification reports
    pub fn outcome(&self) -> RefreshOutcome {
        if self.removed {
            RefreshOutcome::Removed
        } else if self.stale {
            RefreshOutcome::KeptStale {
                value: self.value.clone(),
                retry_ttl: self.ttl,
            }
        } else {
            RefreshOutcome::Refreshed {
                value: self.value.clone(),
                ttl: self.ttl,
            }
        }
    }
}

/// A queued fire-and-forget remote operation
#[derive(Debug)]
pub(crate) enum RemoteOp {
    Set {
        key: String,
        payload: String,
        expiry: Ttl,
    },
    Delete {
        key: String,
    },
}

/// What happened to a write on its way to the remote tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Propagation {
    /// Synchronization was off for this write
    Skipped,
    /// The codec could not encode the value; it stays local-only
    LocalOnly,
    Queued,
    /// The queue was full or closed
    Dropped,
}

pub(crate) struct SyncPolicy<R, C> {
    remote: RwLock<Option<Arc<R>>>,
    codec: C,
    ops_tx: mpsc::Sender<RemoteOp>,
    notify_tx: broadcast::Sender<RefreshNotification>,
    source: Arc<str>,
    stale_retry_ttl: Duration,
    closed: AtomicBool,
}

impl<R, C> SyncPolicy<R, C>
where
    R: RemoteStore,
    C: ValueCodec,
{
    pub(crate) fn new(
        remote: R,
        codec: C,
        config: &CacheConfig,
    ) -> (Self, mpsc::Receiver<RemoteOp>) {
        let (ops_tx, ops_rx) = mpsc::channel(config.propagation_queue_capacity);
        let (notify_tx, _) = broadcast::channel(config.notification_capacity);

        let policy = Self {
            remote: RwLock::new(Some(Arc::new(remote))),
            codec,
            ops_tx,
            notify_tx,
            source: Arc::from(config.name.as_str()),
            stale_retry_ttl: config.stale_retry_ttl,
            closed: AtomicBool::new(false),
        };
        (policy, ops_rx)
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<RefreshNotification> {
        self.notify_tx.subscribe()
    }

    /// Queue a local write for the remote store, if it is meant and able to go there
    pub(crate) fn propagate(
        &self,
        key: &str,
        value: &CacheValue,
        expiry: Ttl,
        synchronize: bool,
    ) -> Propagation {
        if !synchronize {
            return Propagation::Skipped;
        }
        let Some(payload) = self.codec.encode(value) else {
            debug!("Value for key {} is not encodable; keeping it local-only", key);
            return Propagation::LocalOnly;
        };
        self.enqueue(RemoteOp::Set {
            key: key.to_owned(),
            payload,
            expiry,
        })
    }

    pub(crate) fn propagate_delete(&self, key: &str, synchronize: bool) -> Propagation {
        if !synchronize {
            return Propagation::Skipped;
        }
        self.enqueue(RemoteOp::Delete {
            key: key.to_owned(),
        })
    }

    fn enqueue(&self, op: RemoteOp) -> Propagation {
        if self.closed.load(Ordering::SeqCst) {
            return Propagation::Dropped;
        }
        match self.ops_tx.try_send(op) {
            Ok(()) => Propagation::Queued,
            Err(mpsc::error::TrySendError::Full(op)) => {
                warn!("Propagation queue full; dropping remote operation {:?}", op);
                Propagation::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Propagation::Dropped,
        }
    }

    async fn remote(&self) -> Result<Arc<R>, CacheError> {
        self.remote.read().await.clone().ok_or(CacheError::Closed)
    }

    /// Decide what an expiry turns into, consulting the remote store.
    ///
    /// Never fails: remote errors and undecodable payloads keep the stale value.
    pub(crate) async fn resolve(&self, event: &ExpiryEvent) -> RefreshOutcome {
        let fetched = match self.remote().await {
            Ok(remote) => remote.get(&event.key).await,
            Err(e) => Err(e),
        };

        let error = match fetched {
            Ok(None) => return RefreshOutcome::Removed,
            Ok(Some(payload)) => match self.codec.decode(&payload) {
                Ok(value) => {
                    return RefreshOutcome::Refreshed {
                        value,
                        ttl: event.written_ttl,
                    };
                }
                Err(e) => e,
            },
            Err(e) => e,
        };

        if error.is_unreachable() {
            warn!(
                "Remote store unreachable while refreshing key {} ({}). Keeping stale value.",
                event.key, error
            );
        } else {
            warn!(
                "Refresh of key {} failed ({}). Keeping stale value.",
                event.key, error
            );
        }
        RefreshOutcome::KeptStale {
            value: event.value.clone(),
            retry_ttl: self.stale_ttl(event.written_ttl),
        }
    }

    /// Retry lifetime for a stale value; shorter than the written TTL, but
    /// never below `MIN_RETRY_TTL`.
    fn stale_ttl(&self, written: Ttl) -> Ttl {
        match written {
            Ttl::After(d) if d <= self.stale_retry_ttl => {
                Ttl::After((d / 2).max(MIN_RETRY_TTL))
            }
            _ => Ttl::After(self.stale_retry_ttl),
        }
    }

    /// Handle one local expiry: resolve it, re-insert as needed, notify subscribers.
    ///
    /// The read and the re-insert are independent operations; a caller write
    /// that lands in between is overwritten (last write wins locally).
    pub(crate) async fn handle_expiry(
        &self,
        local: &LocalStore,
        event: ExpiryEvent,
    ) -> RefreshOutcome {
        let outcome = self.resolve(&event).await;
        let reinsert = !self.closed.load(Ordering::SeqCst);

        let notification = match &outcome {
            RefreshOutcome::Removed => {
                debug!("Key {} absent remotely; removed locally", event.key);
                RefreshNotification {
                    source: Arc::clone(&self.source),
                    key: event.key,
                    value: event.value,
                    ttl: event.ttl,
                    stale: false,
                    removed: true,
                }
            }
            RefreshOutcome::Refreshed { value, ttl } => {
                if reinsert {
                    local.insert(event.key.clone(), value.clone(), *ttl).await;
                }
                debug!("Key {} refreshed from remote store", event.key);
                RefreshNotification {
                    source: Arc::clone(&self.source),
                    key: event.key,
                    value: value.clone(),
                    ttl: *ttl,
                    stale: false,
                    removed: false,
                }
            }
            RefreshOutcome::KeptStale { value, retry_ttl } => {
                if reinsert {
                    local
                        .insert_retry(
                            event.key.clone(),
                            value.clone(),
                            *retry_ttl,
                            event.written_ttl,
                        )
                        .await;
                }
                RefreshNotification {
                    source: Arc::clone(&self.source),
                    key: event.key,
                    value: value.clone(),
                    ttl: *retry_ttl,
                    stale: true,
                    removed: false,
                }
            }
        };

        // No subscribers is fine
        let _ = self.notify_tx.send(notification);
        outcome
    }

    /// Drain the propagation queue in order until the policy is dropped or aborted
    pub(crate) async fn run_propagation(self: Arc<Self>, mut ops_rx: mpsc::Receiver<RemoteOp>) {
        while let Some(op) = ops_rx.recv().await {
            let remote = match self.remote().await {
                Ok(remote) => remote,
                Err(_) => break,
            };
            match op {
                RemoteOp::Set {
                    key,
                    payload,
                    expiry,
                } => {
                    if let Err(e) = remote.set(&key, payload, expiry).await {
                        warn!("Remote SET failed for key {} ({}). Continuing.", key, e);
                    }
                }
                RemoteOp::Delete { key } => {
                    if let Err(e) = remote.delete(&key).await {
                        warn!("Remote DEL failed for key {} ({}). Continuing.", key, e);
                    }
                }
            }
        }
        debug!("Propagation worker stopped");
    }

    /// Stop accepting remote operations and release the remote handle
    pub(crate) async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.remote.write().await.take();
    }

    pub(crate) async fn count_keys(&self) -> Result<u64, CacheError> {
        self.remote().await?.count_keys().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        JsonCodec,
        test_support::{MemoryRemote, RemoteMode},
    };

    type Fixture = (
        SyncPolicy<MemoryRemote, JsonCodec>,
        MemoryRemote,
        mpsc::Receiver<RemoteOp>,
    );

    fn policy(config: &CacheConfig) -> Fixture {
        let remote = MemoryRemote::new();
        let (policy, ops_rx) = SyncPolicy::new(remote.clone(), JsonCodec, config);
        (policy, remote, ops_rx)
    }

    fn expired(key: &str, value: CacheValue, ttl: Ttl) -> ExpiryEvent {
        ExpiryEvent {
            key: key.to_owned(),
            value,
            ttl,
            written_ttl: ttl,
        }
    }

    #[tokio::test]
    async fn test_resolve_covers_each_remote_state() {
        let (policy, remote, _ops_rx) = policy(&CacheConfig::default());
        let event = expired("caw", CacheValue::from("v1"), Ttl::from_secs(60));

        assert_eq!(policy.resolve(&event).await, RefreshOutcome::Removed);

        remote.put("caw", "\"v2\"");
        assert_eq!(
            policy.resolve(&event).await,
            RefreshOutcome::Refreshed {
                value: CacheValue::from("v2"),
                ttl: Ttl::from_secs(60),
            }
        );

        remote.set_mode(RemoteMode::Unreachable);
        assert_eq!(
            policy.resolve(&event).await,
            RefreshOutcome::KeptStale {
                value: CacheValue::from("v1"),
                retry_ttl: Ttl::from_secs(3),
            }
        );

        remote.set_mode(RemoteMode::Failing);
        assert!(matches!(
            policy.resolve(&event).await,
            RefreshOutcome::KeptStale { .. }
        ));
    }

    #[tokio::test]
    async fn test_undecodable_payload_keeps_stale_value() {
        let (policy, remote, _ops_rx) = policy(&CacheConfig::default());
        remote.put("caw", "{corrupt");

        let event = expired("caw", CacheValue::from("v1"), Ttl::from_secs(60));
        assert_eq!(
            policy.resolve(&event).await,
            RefreshOutcome::KeptStale {
                value: CacheValue::from("v1"),
                retry_ttl: Ttl::from_secs(3),
            }
        );
    }

    #[tokio::test]
    async fn test_stale_ttl_is_shorter_than_original() {
        let config = CacheConfig::default().with_stale_retry_ttl(Duration::from_secs(3));
        let (policy, _remote, _ops_rx) = policy(&config);

        assert_eq!(policy.stale_ttl(Ttl::from_secs(60)), Ttl::from_secs(3));
        assert_eq!(policy.stale_ttl(Ttl::from_secs(3)), Ttl::from_millis(1500));
        assert_eq!(policy.stale_ttl(Ttl::from_secs(1)), Ttl::from_millis(500));
    }

    #[tokio::test]
    async fn test_stale_ttl_never_reaches_zero() {
        let (policy, _remote, _ops_rx) = policy(&CacheConfig::default());

        let tiny = Ttl::After(Duration::from_nanos(1));
        assert_eq!(policy.stale_ttl(tiny), Ttl::from_millis(1));
        assert_eq!(policy.stale_ttl(Ttl::from_millis(1)), Ttl::from_millis(1));
        assert_eq!(policy.stale_ttl(Ttl::from_millis(4)), Ttl::from_millis(2));
    }

    #[tokio::test]
    async fn test_retried_entry_resolves_against_written_ttl() {
        let (policy, remote, _ops_rx) = policy(&CacheConfig::default());
        let event = ExpiryEvent {
            written_ttl: Ttl::from_secs(60),
            ..expired("caw", CacheValue::from("v1"), Ttl::from_secs(3))
        };

        remote.set_mode(RemoteMode::Unreachable);
        assert_eq!(
            policy.resolve(&event).await,
            RefreshOutcome::KeptStale {
                value: CacheValue::from("v1"),
                retry_ttl: Ttl::from_secs(3),
            }
        );

        remote.set_mode(RemoteMode::Healthy);
        remote.put("caw", "\"v2\"");
        assert_eq!(
            policy.resolve(&event).await,
            RefreshOutcome::Refreshed {
                value: CacheValue::from("v2"),
                ttl: Ttl::from_secs(60),
            }
        );
    }

    #[tokio::test]
    async fn test_propagate_respects_synchronize_and_codec() {
        let (policy, _remote, _ops_rx) = policy(&CacheConfig::default());

        assert_eq!(
            policy.propagate("a", &CacheValue::from(1), Ttl::Unbounded, false),
            Propagation::Skipped
        );
        assert_eq!(
            policy.propagate("a", &CacheValue::opaque(vec![1u8]), Ttl::Unbounded, true),
            Propagation::LocalOnly
        );
        assert_eq!(
            policy.propagate("a", &CacheValue::from(1), Ttl::Unbounded, true),
            Propagation::Queued
        );
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let config = CacheConfig {
            propagation_queue_capacity: 1,
            ..CacheConfig::default()
        };
        let (policy, _remote, _ops_rx) = policy(&config);

        assert_eq!(
            policy.propagate("a", &CacheValue::from(1), Ttl::Unbounded, true),
            Propagation::Queued
        );
        assert_eq!(
            policy.propagate("b", &CacheValue::from(2), Ttl::Unbounded, true),
            Propagation::Dropped
        );
    }

    #[tokio::test]
    async fn test_close_releases_remote() {
        let (policy, remote, _ops_rx) = policy(&CacheConfig::default());
        assert_eq!(remote.handles(), 2);

        policy.close().await;
        policy.close().await;

        assert_eq!(remote.handles(), 1);
        assert!(matches!(policy.count_keys().await, Err(CacheError::Closed)));
        assert_eq!(
            policy.propagate("a", &CacheValue::from(1), Ttl::Unbounded, true),
            Propagation::Dropped
        );
    }

    #[tokio::test]
    async fn test_propagation_worker_applies_operations_in_order() {
        let (policy, remote, ops_rx) = policy(&CacheConfig::default());
        let policy = Arc::new(policy);
        let worker = tokio::spawn(Arc::clone(&policy).run_propagation(ops_rx));

        policy.propagate("a", &CacheValue::from(1), Ttl::from_secs(30), true);
        policy.propagate_delete("a", true);
        policy.propagate("b", &CacheValue::from(2), Ttl::Unbounded, true);

        remote.wait_for(|r| r.contains("b")).await;
        assert!(!remote.contains("a"));
        assert_eq!(remote.get_payload("b").as_deref(), Some("2"));
        assert_eq!(remote.expiry_of("b"), Some(Ttl::Unbounded));
        worker.abort();
    }
}
