//! Two-tier cache façade
//!
//! This module ties the tiers together:
//! - L1: in-memory Moka store with a per-entry TTL
//! - L2: shared remote store (Redis), eventually consistent with L1
//!
//! Writes land in L1 and are propagated to L2 in the background. When an L1
//! entry expires it is refreshed from L2, removed if L2 no longer has it, or
//! kept stale for a short retry period if L2 cannot be reached.

use serde::{Serialize, de::DeserializeOwned};
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicI64, Ordering},
};
use tokio::{
    sync::{Mutex, broadcast, mpsc, watch},
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, error};

use crate::{
    CacheConfig, CacheError, CacheValue, JsonCodec, RedisStore, RedisStoreConfig,
    RefreshNotification, RemoteStore, Ttl, ValueCodec,
    local_store::{self, ExpiryEvent, LocalStore},
    sync_policy::SyncPolicy,
};

/// Per-write overrides of the configured defaults
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Local lifetime; `Ttl::Unbounded` pins the entry until shutdown
    pub ttl: Option<Ttl>,
    /// Expiry of the propagated remote copy
    pub remote_expiry: Option<Ttl>,
    /// Whether to propagate this write to the remote store
    pub synchronize: Option<bool>,
}

impl WriteOptions {
    pub fn ttl(mut self, ttl: Ttl) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn remote_expiry(mut self, expiry: Ttl) -> Self {
        self.remote_expiry = Some(expiry);
        self
    }

    pub fn synchronize(mut self, synchronize: bool) -> Self {
        self.synchronize = Some(synchronize);
        self
    }

    /// Keep the write in this process only
    pub fn local_only(self) -> Self {
        self.synchronize(false)
    }
}

/// Two-tier cache handle. Clones share the same underlying cache.
pub struct TieredCache<R, C = JsonCodec>
where
    R: RemoteStore,
    C: ValueCodec,
{
    inner: Arc<TieredCacheInner<R, C>>,
}

/// Cached remote key count.
///
/// Negative values mean unknown. Every invalidation stores a fresh negative
/// marker, so a count fetched before an invalidation fails to replace it.
struct RemoteLength {
    count: AtomicI64,
    next_marker: AtomicI64,
}

impl RemoteLength {
    fn new() -> Self {
        Self {
            count: AtomicI64::new(-1),
            next_marker: AtomicI64::new(-2),
        }
    }

    fn invalidate(&self) {
        let marker = self.next_marker.fetch_sub(1, Ordering::SeqCst);
        self.count.store(marker, Ordering::SeqCst);
    }

    fn snapshot(&self) -> i64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Cache `count` unless the length was invalidated since `seen` was taken
    fn fill(&self, seen: i64, count: u64) {
        let count = i64::try_from(count).unwrap_or(i64::MAX);
        let _ = self
            .count
            .compare_exchange(seen, count, Ordering::SeqCst, Ordering::SeqCst);
    }
}

struct TieredCacheInner<R, C>
where
    R: RemoteStore,
    C: ValueCodec,
{
    local: LocalStore,
    policy: Arc<SyncPolicy<R, C>>,
    config: CacheConfig,
    length: Arc<RemoteLength>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    refresh_worker: Mutex<Option<JoinHandle<()>>>,
    stop_refresh: watch::Sender<bool>,
    closed: AtomicBool,
}

impl<R, C> Drop for TieredCacheInner<R, C>
where
    R: RemoteStore,
    C: ValueCodec,
{
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        if let Some(worker) = self.refresh_worker.get_mut().take() {
            worker.abort();
        }
    }
}

impl<R, C> Clone for TieredCache<R, C>
where
    R: RemoteStore,
    C: ValueCodec,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl TieredCache<RedisStore> {
    /// Connect to Redis and create a cache using JSON encoding
    pub async fn connect(
        redis_client: redis::Client,
        store_config: RedisStoreConfig,
        config: CacheConfig,
    ) -> Result<Self, CacheError> {
        let store = RedisStore::connect(redis_client, store_config).await?;
        Self::new(store, config)
    }
}

impl<R> TieredCache<R>
where
    R: RemoteStore,
{
    /// Create a cache over `remote` using JSON encoding.
    ///
    /// Must be called from within a Tokio runtime; background tasks are spawned on it.
    pub fn new(remote: R, config: CacheConfig) -> Result<Self, CacheError> {
        Self::with_codec(remote, JsonCodec, config)
    }
}

impl<R, C> TieredCache<R, C>
where
    R: RemoteStore,
    C: ValueCodec,
{
    /// Create a cache with a custom transport encoding
    pub fn with_codec(remote: R, codec: C, config: CacheConfig) -> Result<Self, CacheError> {
        config.validate()?;

        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        let local = LocalStore::new(config.max_capacity, expired_tx);
        let (policy, ops_rx) = SyncPolicy::new(remote, codec, &config);
        let policy = Arc::new(policy);
        let length = Arc::new(RemoteLength::new());
        let (stop_refresh, stop_rx) = watch::channel(false);

        let tasks = vec![
            tokio::spawn(local_store::run_sweeper(local.clone(), config.sweep_interval)),
            tokio::spawn(Arc::clone(&policy).run_propagation(ops_rx)),
        ];
        let refresh_worker = tokio::spawn(run_refresh_worker(
            local.clone(),
            Arc::clone(&policy),
            Arc::clone(&length),
            expired_rx,
            stop_rx,
        ));

        Ok(Self {
            inner: Arc::new(TieredCacheInner {
                local,
                policy,
                config,
                length,
                tasks: Mutex::new(tasks),
                refresh_worker: Mutex::new(Some(refresh_worker)),
                stop_refresh,
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Get the value stored locally for `key`
    pub async fn get(&self, key: &str) -> Option<CacheValue> {
        self.inner.local.get(key).await.map(|entry| entry.value)
    }

    /// Store a value with the configured defaults
    pub async fn set(&self, key: &str, value: impl Into<CacheValue>) -> Result<(), CacheError> {
        self.write(key, value, WriteOptions::default()).await
    }

    /// Store a value locally and, if eligible, propagate it to the remote store.
    ///
    /// Returns once the local write is done; remote propagation happens in the
    /// background and its failures are only logged.
    pub async fn write(
        &self,
        key: &str,
        value: impl Into<CacheValue>,
        options: WriteOptions,
    ) -> Result<(), CacheError> {
        validate_key(key)?;
        self.ensure_open()?;

        let value = value.into();
        let config = &self.inner.config;
        let ttl = options.ttl.unwrap_or(config.local_ttl);
        let remote_expiry = options.remote_expiry.unwrap_or(config.remote_expiry);
        let synchronize = options.synchronize.unwrap_or(config.synchronize);

        self.inner
            .local
            .insert(key.to_owned(), value.clone(), ttl)
            .await;
        let propagation = self
            .inner
            .policy
            .propagate(key, &value, remote_expiry, synchronize);
        debug!("Wrote key {} locally (propagation: {:?})", key, propagation);
        Ok(())
    }

    /// Store a typed value and hand it back.
    ///
    /// Values serde cannot encode as JSON stay local-only.
    pub async fn write_typed<T>(
        &self,
        key: &str,
        value: T,
        options: WriteOptions,
    ) -> Result<T, CacheError>
    where
        T: Serialize + Clone + Send + Sync + 'static,
    {
        self.write(key, CacheValue::from_serialize(&value), options)
            .await?;
        Ok(value)
    }

    /// Read the value for `key` as `T`.
    ///
    /// `Ok(None)` if the key is absent locally, [`CacheError::TypeMismatch`]
    /// if the stored value is not a `T`.
    pub async fn read<T>(&self, key: &str) -> Result<Option<T>, CacheError>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        validate_key(key)?;
        match self.get(key).await {
            Some(value) => value.to_typed(key).map(Some),
            None => Ok(None),
        }
    }

    /// Remove `key` locally and, if `synchronize`, from the remote store in the background
    pub async fn delete(&self, key: &str, synchronize: bool) -> Result<(), CacheError> {
        self.delete_entry(key, synchronize).await.map(|_| ())
    }

    /// Like [`delete`](Self::delete), returning the removed local value as `T`
    pub async fn delete_typed<T>(
        &self,
        key: &str,
        synchronize: bool,
    ) -> Result<Option<T>, CacheError>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        match self.delete_entry(key, synchronize).await? {
            Some(value) => value.to_typed(key).map(Some),
            None => Ok(None),
        }
    }

    async fn delete_entry(
        &self,
        key: &str,
        synchronize: bool,
    ) -> Result<Option<CacheValue>, CacheError> {
        validate_key(key)?;
        self.ensure_open()?;

        let removed = self.inner.local.remove(key).await;
        self.inner.policy.propagate_delete(key, synchronize);
        debug!("Deleted key {} (synchronize: {})", key, synchronize);
        Ok(removed.map(|entry| entry.value))
    }

    /// TTL the local entry for `key` currently carries
    pub async fn ttl(&self, key: &str) -> Option<Ttl> {
        self.inner.local.get(key).await.map(|entry| entry.ttl)
    }

    /// Number of keys in the remote store.
    ///
    /// Potentially a full keyspace scan. The result is cached until the next
    /// local expiry, so treat it as a diagnostic rather than an exact count.
    pub async fn length(&self) -> Result<u64, CacheError> {
        let seen = self.inner.length.snapshot();
        if seen >= 0 {
            return Ok(seen as u64);
        }
        let count = self.inner.policy.count_keys().await?;
        self.inner.length.fill(seen, count);
        Ok(count)
    }

    /// Approximate number of entries held locally
    pub fn local_len(&self) -> u64 {
        self.inner.local.entry_count()
    }

    /// Receive one notification per local expiry
    pub fn subscribe(&self) -> broadcast::Receiver<RefreshNotification> {
        self.inner.policy.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stop background work and release both tiers.
    ///
    /// Safe to call more than once and while refreshes are in flight; those
    /// are cancelled. Queued remote writes that have not been sent are dropped.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let tasks: Vec<_> = self.inner.tasks.lock().await.drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            // Cancellation is the expected result here
            let _ = task.await;
        }

        // The worker cancels its in-flight refreshes and waits for them, so
        // none can re-insert after the local tier is cleared below
        let _ = self.inner.stop_refresh.send(true);
        let worker = self.inner.refresh_worker.lock().await.take();
        if let Some(worker) = worker
            && let Err(e) = worker.await
        {
            error!("Refresh worker failed: {}", e);
        }

        self.inner.policy.close().await;
        self.inner.local.invalidate_all();
        self.inner.local.run_pending_tasks().await;
        debug!("Cache {} shut down", self.inner.config.name);
    }

    fn ensure_open(&self) -> Result<(), CacheError> {
        if self.is_closed() {
            return Err(CacheError::Closed);
        }
        Ok(())
    }
}

fn validate_key(key: &str) -> Result<(), CacheError> {
    if key.is_empty() {
        return Err(CacheError::InvalidKey(key.to_owned()));
    }
    Ok(())
}

/// Handle each expiry in its own task so unrelated keys refresh concurrently.
///
/// On stop, in-flight refreshes are aborted and awaited before returning.
async fn run_refresh_worker<R, C>(
    local: LocalStore,
    policy: Arc<SyncPolicy<R, C>>,
    length: Arc<RemoteLength>,
    mut expired_rx: mpsc::UnboundedReceiver<ExpiryEvent>,
    mut stop_rx: watch::Receiver<bool>,
) where
    R: RemoteStore,
    C: ValueCodec,
{
    let mut in_flight = JoinSet::new();
    loop {
        tokio::select! {
            event = expired_rx.recv() => {
                let Some(event) = event else { break };
                // Expiry is the only invalidation signal available for the remote count
                length.invalidate();
                debug!("Local entry expired for key: {}", event.key);

                let local = local.clone();
                let policy = Arc::clone(&policy);
                in_flight.spawn(async move {
                    policy.handle_expiry(&local, event).await;
                });
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    error!("Refresh task failed: {}", e);
                }
            }
            _ = stop_rx.changed() => break,
        }
    }
    in_flight.abort_all();
    while in_flight.join_next().await.is_some() {}
    debug!("Refresh worker stopped");
}
