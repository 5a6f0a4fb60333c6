//! Cache configuration

use std::time::Duration;

use crate::{CacheError, Ttl};

/// Configuration for the two-tier cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Label reported as the source of refresh notifications
    pub name: String,
    /// Default time-to-live for local entries (`Ttl::Unbounded` pins them)
    pub local_ttl: Ttl,
    /// Default expiry applied to values propagated to the remote store
    pub remote_expiry: Ttl,
    /// Whether writes propagate to the remote store by default
    pub synchronize: bool,
    /// Local lifetime of a value kept stale because the remote store was unreachable
    pub stale_retry_ttl: Duration,
    /// How often local housekeeping runs and delivers expiry events
    pub sweep_interval: Duration,
    /// Optional upper bound on the number of local entries
    pub max_capacity: Option<u64>,
    /// Maximum number of queued remote writes/deletes before new ones are dropped
    pub propagation_queue_capacity: usize,
    /// Buffer size of the refresh notification channel
    pub notification_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "tiered-cache".to_owned(),
            local_ttl: Ttl::from_secs(300), // 5 minutes
            remote_expiry: Ttl::Unbounded,
            synchronize: true,
            stale_retry_ttl: Duration::from_secs(3),
            sweep_interval: Duration::from_secs(1),
            max_capacity: None,
            propagation_queue_capacity: 1024,
            notification_capacity: 256,
        }
    }
}

impl CacheConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_local_ttl(mut self, ttl: Ttl) -> Self {
        self.local_ttl = ttl;
        self
    }

    pub fn with_remote_expiry(mut self, expiry: Ttl) -> Self {
        self.remote_expiry = expiry;
        self
    }

    pub fn with_synchronize(mut self, synchronize: bool) -> Self {
        self.synchronize = synchronize;
        self
    }

    pub fn with_stale_retry_ttl(mut self, ttl: Duration) -> Self {
        self.stale_retry_ttl = ttl;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Check the values that would otherwise stall the background tasks
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.stale_retry_ttl.is_zero() {
            return Err(CacheError::InvalidConfig(
                "stale_retry_ttl must be greater than zero".to_owned(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(CacheError::InvalidConfig(
                "sweep_interval must be greater than zero".to_owned(),
            ));
        }
        if self.propagation_queue_capacity == 0 {
            return Err(CacheError::InvalidConfig(
                "propagation_queue_capacity must be greater than zero".to_owned(),
            ));
        }
        if self.notification_capacity == 0 {
            return Err(CacheError::InvalidConfig(
                "notification_capacity must be greater than zero".to_owned(),
            ));
        }
        Ok(())
    }
}
