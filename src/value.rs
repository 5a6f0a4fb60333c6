//! Cached values and their transport encoding
//!
//! Values are type-erased at the cache boundary:
//! - `CacheValue::Json` holds structured data that can be encoded for Redis
//! - `CacheValue::Opaque` holds any other value; it never leaves the process
//!
//! Whether a value may reach the remote tier is decided by a [`ValueCodec`].

use serde::{Serialize, de::DeserializeOwned};
use std::{any::Any, fmt, sync::Arc, time::Duration};

use crate::{CacheError, float_check::has_finite_floats};

/// Lifetime of an entry in either tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ttl {
    /// Expire after the given duration
    After(Duration),
    /// Never expire. Locally this pins the entry until the cache is shut down.
    Unbounded,
}

impl Ttl {
    pub fn from_secs(secs: u64) -> Self {
        Self::from(Duration::from_secs(secs))
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::from(Duration::from_millis(millis))
    }

    pub fn duration(&self) -> Option<Duration> {
        match self {
            Ttl::After(d) => Some(*d),
            Ttl::Unbounded => None,
        }
    }

    pub fn is_unbounded(&self) -> bool {
        matches!(self, Ttl::Unbounded)
    }
}

/// A zero duration means "no expiry".
impl From<Duration> for Ttl {
    fn from(d: Duration) -> Self {
        if d.is_zero() {
            Ttl::Unbounded
        } else {
            Ttl::After(d)
        }
    }
}

impl From<Option<Duration>> for Ttl {
    fn from(d: Option<Duration>) -> Self {
        d.map_or(Ttl::Unbounded, Ttl::from)
    }
}

/// A type-erased cached value
#[derive(Clone)]
pub enum CacheValue {
    Json(Arc<serde_json::Value>),
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl CacheValue {
    /// Store a value that is never propagated to the remote tier
    pub fn opaque<T: Any + Send + Sync>(value: T) -> Self {
        CacheValue::Opaque(Arc::new(value))
    }

    /// Convert a serializable value to its structured form.
    ///
    /// Values JSON cannot represent (maps with non-string keys, NaN or
    /// infinite floats) are kept as-is and become local-only.
    pub fn from_serialize<T>(value: &T) -> Self
    where
        T: Serialize + Clone + Send + Sync + 'static,
    {
        if !has_finite_floats(value) {
            return CacheValue::opaque(value.clone());
        }
        match serde_json::to_value(value) {
            Ok(json) => CacheValue::Json(Arc::new(json)),
            Err(_) => CacheValue::opaque(value.clone()),
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            CacheValue::Json(v) => Some(v.as_ref()),
            CacheValue::Opaque(_) => None,
        }
    }

    /// Read the value back as `T`.
    ///
    /// Fails with [`CacheError::TypeMismatch`] when the stored value does not
    /// have the requested shape.
    pub fn to_typed<T>(&self, key: &str) -> Result<T, CacheError>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let mismatch = || CacheError::TypeMismatch {
            key: key.to_owned(),
            expected: std::any::type_name::<T>(),
        };
        match self {
            CacheValue::Json(v) => {
                <T as serde::Deserialize>::deserialize(v.as_ref()).map_err(|_| mismatch())
            }
            CacheValue::Opaque(v) => v.downcast_ref::<T>().cloned().ok_or_else(mismatch),
        }
    }
}

impl fmt::Debug for CacheValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheValue::Json(v) => f.debug_tuple("Json").field(v).finish(),
            CacheValue::Opaque(_) => f.write_str("Opaque(..)"),
        }
    }
}

/// Opaque values compare by identity.
impl PartialEq for CacheValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (CacheValue::Json(a), CacheValue::Json(b)) => a == b,
            (CacheValue::Opaque(a), CacheValue::Opaque(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<serde_json::Value> for CacheValue {
    fn from(v: serde_json::Value) -> Self {
        CacheValue::Json(Arc::new(v))
    }
}

macro_rules! json_from {
    ($($t:ty),*) => {
        $(
            impl From<$t> for CacheValue {
                fn from(v: $t) -> Self {
                    CacheValue::from(serde_json::Value::from(v))
                }
            }
        )*
    };
}

json_from!(String, &str, bool, i32, i64, u32, u64);

impl From<f64> for CacheValue {
    fn from(v: f64) -> Self {
        if v.is_finite() {
            CacheValue::from(serde_json::Value::from(v))
        } else {
            CacheValue::opaque(v)
        }
    }
}

/// Encodes values for the remote tier and decodes them on refresh.
///
/// `encode` is the serializability predicate: `None` means the value has no
/// transport encoding and stays local-only.
pub trait ValueCodec: Send + Sync + 'static {
    fn encode(&self, value: &CacheValue) -> Option<String>;

    fn decode(&self, payload: &str) -> Result<CacheValue, CacheError>;
}

/// JSON text encoding, the format stored in Redis
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl ValueCodec for JsonCodec {
    fn encode(&self, value: &CacheValue) -> Option<String> {
        value
            .as_json()
            .and_then(|json| serde_json::to_string(json).ok())
    }

    fn decode(&self, payload: &str) -> Result<CacheValue, CacheError> {
        let json: serde_json::Value = serde_json::from_str(payload)?;
        Ok(CacheValue::from(json))
    }
}
