//! Cache error types

use redis::RedisError;

/// Cache-related errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Remote store error: {0}")]
    Remote(Box<dyn std::error::Error + Send + Sync>),

    #[error("Type mismatch for key {key}: stored value is not a {expected}")]
    TypeMismatch { key: String, expected: &'static str },

    #[error("Invalid key: {0:?}")]
    InvalidKey(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Cache is closed")]
    Closed,
}

impl CacheError {
    /// Whether the error means the remote store could not be reached in time
    pub fn is_unreachable(&self) -> bool {
        match self {
            CacheError::Redis(e) => {
                e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal()
            }
            CacheError::Remote(_) | CacheError::Closed => true,
            _ => false,
        }
    }
}
