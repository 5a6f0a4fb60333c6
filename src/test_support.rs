//! In-memory remote store for tests

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::sync::Notify;

use crate::{CacheError, RemoteStore, Ttl};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RemoteMode {
    Healthy,
    /// Every call fails as if the request timed out
    Unreachable,
    /// Every call fails with a non-connectivity error
    Failing,
    /// Reads hang until the caller gives up on them
    Stalled,
}

#[derive(Debug)]
struct RemoteState {
    entries: Mutex<HashMap<String, (String, Ttl)>>,
    mode: Mutex<RemoteMode>,
    /// Every key the cache has read or written
    touched: Mutex<Vec<String>>,
    count_calls: AtomicUsize,
    hold_counts: AtomicBool,
    count_release: Notify,
}

#[derive(Debug, Clone)]
pub(crate) struct MemoryRemote {
    state: Arc<RemoteState>,
}

#[derive(Debug)]
struct Unreachable;

impl std::fmt::Display for Unreachable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("timed out")
    }
}

impl std::error::Error for Unreachable {}

impl MemoryRemote {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(RemoteState {
                entries: Mutex::new(HashMap::new()),
                mode: Mutex::new(RemoteMode::Healthy),
                touched: Mutex::new(Vec::new()),
                count_calls: AtomicUsize::new(0),
                hold_counts: AtomicBool::new(false),
                count_release: Notify::new(),
            }),
        }
    }

    pub(crate) fn set_mode(&self, mode: RemoteMode) {
        *self.state.mode.lock().unwrap() = mode;
    }

    /// Write directly, as another process would
    pub(crate) fn put(&self, key: &str, payload: &str) {
        self.state
            .entries
            .lock()
            .unwrap()
            .insert(key.to_owned(), (payload.to_owned(), Ttl::Unbounded));
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.state.entries.lock().unwrap().contains_key(key)
    }

    pub(crate) fn get_payload(&self, key: &str) -> Option<String> {
        self.state
            .entries
            .lock()
            .unwrap()
            .get(key)
            .map(|(payload, _)| payload.clone())
    }

    pub(crate) fn expiry_of(&self, key: &str) -> Option<Ttl> {
        self.state
            .entries
            .lock()
            .unwrap()
            .get(key)
            .map(|(_, expiry)| *expiry)
    }

    pub(crate) fn touched(&self, key: &str) -> bool {
        self.state.touched.lock().unwrap().iter().any(|k| k == key)
    }

    pub(crate) fn count_calls(&self) -> usize {
        self.state.count_calls.load(Ordering::SeqCst)
    }

    /// Make `count_keys` wait for `release_counts`
    pub(crate) fn hold_counts(&self) {
        self.state.hold_counts.store(true, Ordering::SeqCst);
    }

    pub(crate) fn release_counts(&self) {
        self.state.hold_counts.store(false, Ordering::SeqCst);
        self.state.count_release.notify_one();
    }

    fn mode(&self) -> RemoteMode {
        *self.state.mode.lock().unwrap()
    }

    /// Live handles to this store, including the caller's
    pub(crate) fn handles(&self) -> usize {
        Arc::strong_count(&self.state)
    }

    pub(crate) async fn wait_for(&self, cond: impl Fn(&Self) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond(self) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("remote store condition not reached");
    }

    fn check(&self, key: &str) -> Result<(), CacheError> {
        self.state.touched.lock().unwrap().push(key.to_owned());
        match self.mode() {
            RemoteMode::Healthy | RemoteMode::Stalled => Ok(()),
            RemoteMode::Unreachable => Err(CacheError::Remote(Box::new(Unreachable))),
            RemoteMode::Failing => Err(CacheError::InvalidKey(key.to_owned())),
        }
    }
}

#[async_trait::async_trait]
impl RemoteStore for MemoryRemote {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.check(key)?;
        if self.mode() == RemoteMode::Stalled {
            std::future::pending::<()>().await;
        }
        Ok(self.get_payload(key))
    }

    async fn set(&self, key: &str, payload: String, expiry: Ttl) -> Result<(), CacheError> {
        self.check(key)?;
        self.state
            .entries
            .lock()
            .unwrap()
            .insert(key.to_owned(), (payload, expiry));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.check(key)?;
        self.state.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn count_keys(&self) -> Result<u64, CacheError> {
        self.state.count_calls.fetch_add(1, Ordering::SeqCst);
        if self.state.hold_counts.load(Ordering::SeqCst) {
            self.state.count_release.notified().await;
        }
        Ok(self.state.entries.lock().unwrap().len() as u64)
    }
}
