//! Cache backend port and the in-memory backend.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use warden_core::CacheError;

/// Async keyed byte store with per-entry TTL.
///
/// Implementations must be safe for concurrent use. Last writer wins per key;
/// there is no cross-key atomicity.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Store a value. `None` means no expiry.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// What a cache slot holds. `Absent` records a confirmed miss so repeated
/// lookups of a missing key stay off the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum CacheEntry<T> {
    Found(T),
    Absent,
}

impl<T: Serialize> CacheEntry<T> {
    pub fn encode(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        serde_json::to_vec(self).map_err(|e| CacheError::Serialization {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }
}

impl<T: DeserializeOwned> CacheEntry<T> {
    pub fn decode(key: &str, bytes: &[u8]) -> Result<Self, CacheError> {
        serde_json::from_slice(bytes).map_err(|e| CacheError::Serialization {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
struct StoredValue {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

/// In-process [`CacheBackend`]. Expired entries are dropped lazily on read.
#[derive(Debug, Default)]
pub struct MemoryCacheBackend {
    entries: RwLock<HashMap<String, StoredValue>>,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> CacheError {
        CacheError::Backend {
            reason: "cache lock poisoned".to_string(),
        }
    }

    /// Remaining lifetime of a live entry. `Some(None)` means no expiry.
    pub fn ttl_remaining(&self, key: &str) -> Result<Option<Option<Duration>>, CacheError> {
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        let now = Instant::now();
        Ok(entries
            .get(key)
            .filter(|v| v.is_live(now))
            .map(|v| v.expires_at.map(|at| at.saturating_duration_since(now))))
    }

    /// Number of live entries.
    pub fn len(&self) -> Result<usize, CacheError> {
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        let now = Instant::now();
        Ok(entries.values().filter(|v| v.is_live(now)).count())
    }

    pub fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }

    pub fn clear(&self) -> Result<(), CacheError> {
        self.entries.write().map_err(|_| Self::poisoned())?.clear();
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let now = Instant::now();
        {
            let entries = self.entries.read().map_err(|_| Self::poisoned())?;
            match entries.get(key) {
                Some(value) if value.is_live(now) => return Ok(Some(value.bytes.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // Expired: evict.
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        if entries.get(key).map(|v| !v.is_live(now)).unwrap_or(false) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), CacheError> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        entries.insert(
            key.to_string(),
            StoredValue {
                bytes: value,
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        entries.remove(key);
        Ok(())
    }
}
