//! Key/value store contract and in-memory reference implementation
//!
//! The core only requires a small KV surface: get/put with optional TTL,
//! prefix listing, and an atomic hash append (used for per-session
//! checkpoint history). Any backend satisfying [`StateStore`] is
//! acceptable; [`InMemoryStateStore`] is the reference implementation used
//! in development and tests.

use crate::error::{Result, StateError};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Abstract key/value storage used by the checkpointer
///
/// Implementations must be safe for concurrent use; writes from a single
/// caller must be observable in program order by that caller.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Get a value by key; expired keys read as absent
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Store a value, optionally expiring after `ttl`
    async fn put(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()>;

    /// Delete a key; returns whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// List keys beginning with `prefix`
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Atomically set `field` in the hash stored at `key`
    async fn hash_append(&self, key: &str, field: &str, value: Value) -> Result<()>;

    /// All fields of the hash stored at `key`, in field order
    async fn hash_entries(&self, key: &str) -> Result<BTreeMap<String, Value>>;

    /// Remove `field` from the hash stored at `key`; returns whether it existed
    async fn hash_remove(&self, key: &str, field: &str) -> Result<bool>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// Thread-safe in-memory [`StateStore`]
///
/// Expiry is lazy: expired entries read as absent and are dropped on the
/// next sweep or overwrite. Suitable for development, testing and
/// single-process deployments.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStateStore {
    data: Arc<RwLock<HashMap<String, Entry>>>,
    hashes: Arc<RwLock<HashMap<String, BTreeMap<String, Value>>>>,
}

impl InMemoryStateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-expired) keys
    pub async fn len(&self) -> usize {
        let now = Utc::now();
        self.data.read().await.values().filter(|e| !e.expired(now)).count()
    }

    /// Whether the store holds no live keys
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop expired entries; returns how many were removed
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut data = self.data.write().await;
        let before = data.len();
        data.retain(|_, e| !e.expired(now));
        before - data.len()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let now = Utc::now();
        let data = self.data.read().await;
        Ok(data
            .get(key)
            .filter(|e| !e.expired(now))
            .map(|e| e.value.clone()))
    }

    async fn put(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        let expires_at = match ttl {
            Some(d) => Some(
                Utc::now()
                    + ChronoDuration::from_std(d)
                        .map_err(|e| StateError::Invalid(format!("ttl out of range: {e}")))?,
            ),
            None => None,
        };
        let mut data = self.data.write().await;
        data.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut data = self.data.write().await;
        Ok(data.remove(key).is_some())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Utc::now();
        let data = self.data.read().await;
        let mut keys: Vec<String> = data
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && !e.expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn hash_append(&self, key: &str, field: &str, value: Value) -> Result<()> {
        let mut hashes = self.hashes.write().await;
        hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
        Ok(())
    }

    async fn hash_entries(&self, key: &str) -> Result<BTreeMap<String, Value>> {
        let hashes = self.hashes.read().await;
        Ok(hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hash_remove(&self, key: &str, field: &str) -> Result<bool> {
        let mut hashes = self.hashes.write().await;
        Ok(hashes
            .get_mut(key)
            .map(|h| h.remove(field).is_some())
            .unwrap_or(false))
    }
}
