//! Two-Tier Cache with Stale Fallback
//!
//! Every `set` writes the payload twice: under the primary key with the
//! caller's TTL, and under `stale:<key>` with a fixed 24h TTL. Readers that
//! can tolerate old data use [`StaleCache::get_with_stale`] and still get the
//! last known value, labelled stale, after the primary copy expires.
//!
//! The two writes are not transactional. A failure between them leaves the
//! tiers out of step; the stale copy is advisory, so this is accepted.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::error::CacheError;
use crate::metrics;

pub const STALE_PREFIX: &str = "stale:";
pub const STALE_TTL: Duration = Duration::from_secs(86_400);
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

pub fn stale_key(key: &str) -> String {
    format!("{STALE_PREFIX}{key}")
}

/// Byte-oriented key/value backend with per-key expiry.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, keys: &[String]) -> Result<(), CacheError>;
}

/// In-process backend. Expiry is checked lazily on read against the tokio
/// clock, so paused-time tests can advance past a TTL.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (Vec<u8>, Instant)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop one key immediately, as if its TTL had elapsed.
    pub fn expire(&self, key: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .map(|entries| {
                entries
                    .get(key)
                    .is_some_and(|(_, deadline)| *deadline > Instant::now())
            })
            .unwrap_or(false)
    }

    fn lock_err<T>(_: T) -> CacheError {
        CacheError::Backend("memory store lock poisoned".to_string())
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut entries = self.entries.lock().map_err(Self::lock_err)?;
        let now = Instant::now();
        let live = entries
            .get(key)
            .filter(|(_, deadline)| *deadline > now)
            .map(|(value, _)| value.clone());
        if live.is_none() {
            entries.remove(key);
        }
        Ok(live)
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().map_err(Self::lock_err)?;
        entries.insert(key.to_string(), (value.to_vec(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().map_err(Self::lock_err)?;
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }
}

/// Redis backend over a reconnecting multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.conn.clone();
        let raw: Option<Vec<u8>> = conn.get(key).await?;
        Ok(raw)
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        // Redis rejects a zero expiry
        let seconds = ttl.as_secs().max(1);
        let _: () = conn.set_ex(key, value, seconds).await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(keys).await?;
        Ok(())
    }
}

/// JSON cache with a primary tier and a longer-lived stale tier.
#[derive(Clone)]
pub struct StaleCache {
    store: Arc<dyn KvStore>,
}

impl StaleCache {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Primary tier only; `None` on miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.store.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Write the primary copy with `ttl` and the stale copy with [`STALE_TTL`].
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let encoded = serde_json::to_vec(value)?;
        self.store.set_ex(key, &encoded, ttl).await?;
        self.store.set_ex(&stale_key(key), &encoded, STALE_TTL).await?;
        debug!(key, ttl_secs = ttl.as_secs(), bytes = encoded.len(), "cache set");
        Ok(())
    }

    pub async fn set_default<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), CacheError> {
        self.set(key, value, DEFAULT_TTL).await
    }

    /// Primary first, then stale. The flag says which tier answered; a miss on
    /// both returns `(None, false)`.
    pub async fn get_with_stale<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<(Option<T>, bool), CacheError> {
        if let Some(raw) = self.store.get(key).await? {
            return Ok((Some(serde_json::from_slice(&raw)?), false));
        }

        if let Some(raw) = self.store.get(&stale_key(key)).await? {
            metrics::STALE_HITS.inc();
            debug!(key, "serving stale cache entry");
            return Ok((Some(serde_json::from_slice(&raw)?), true));
        }

        Ok((None, false))
    }

    /// Remove both tiers.
    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.store
            .delete(&[key.to_string(), stale_key(key)])
            .await
    }
}
