//! Decision cache: fingerprint-keyed memoization of agent outputs
//!
//! Identical replans after a transient failure should not repay the LLM
//! cost. The cache key is a SHA-256 fingerprint over the full invocation
//! context; entries expire after a TTL and are silently recomputed on the
//! next lookup.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// A stable digest of one agent-invocation context
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hex digest string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Store key for persisted decisions (`decision:{fingerprint}`)
    pub fn store_key(&self) -> String {
        format!("decision:{}", self.0)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute the fingerprint for an agent invocation
///
/// The prompt is normalized (lowercased, whitespace collapsed) so that
/// trivially reworded resubmissions of the same request hit the cache.
pub fn fingerprint(
    session_id: &str,
    state_summary: &str,
    prompt: &str,
    agent_role: &str,
    iteration_context: &str,
) -> Fingerprint {
    let normalized: String = prompt
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    let mut hasher = Sha256::new();
    for part in [
        session_id,
        &digest_of(state_summary),
        &digest_of(&normalized),
        agent_role,
        iteration_context,
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    let out = hasher.finalize();
    Fingerprint(out.iter().map(|b| format!("{b:02x}")).collect())
}

fn digest_of(s: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    let out = hasher.finalize();
    out.iter().map(|b| format!("{b:02x}")).collect()
}

/// Hit/miss counters for the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct DecisionCacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl DecisionCacheMetrics {
    /// Fraction of lookups served from cache
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheEntry {
    value: Value,
    expires_at: Instant,
}

/// TTL cache of serialized agent outputs
///
/// Multi-reader, multi-writer; concurrent stores to the same fingerprint
/// resolve last-writer-wins. When backed by a [`StateStore`], entries are
/// written through under `decision:{fingerprint}` and misses fall back to
/// the store, so decisions survive a cache rebuild.
pub struct DecisionCache {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
    store: Option<Arc<dyn crate::store::StateStore>>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl DecisionCache {
    /// Create a cache with the given default TTL
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            store: None,
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Back the cache with a store for write-through persistence
    pub fn with_store(mut self, store: Arc<dyn crate::store::StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Look up a cached output; expired entries count as misses
    pub async fn lookup(&self, fp: &Fingerprint) -> Option<Value> {
        if let Some(value) = self.lookup_local(fp).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }
        if let Some(store) = &self.store {
            if let Ok(Some(value)) = store.get(&fp.store_key()).await {
                self.insert_local(fp, value.clone(), self.default_ttl).await;
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(value);
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    async fn lookup_local(&self, fp: &Fingerprint) -> Option<Value> {
        {
            let entries = self.entries.read().await;
            match entries.get(fp.as_str()) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Some(entry.value.clone())
                }
                Some(_) => {}
                None => return None,
            }
        }
        // Entry existed but expired: evict under the write lock
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(fp.as_str()) {
            if entry.expires_at <= Instant::now() {
                entries.remove(fp.as_str());
                self.evictions.fetch_add(1, Ordering::Relaxed);
            } else {
                // Re-stored concurrently between the two locks
                return Some(entry.value.clone());
            }
        }
        None
    }

    async fn insert_local(&self, fp: &Fingerprint, value: Value, ttl: Duration) {
        let mut entries = self.entries.write().await;
        entries.insert(
            fp.as_str().to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Store an output under a fingerprint
    pub async fn store(&self, fp: &Fingerprint, value: Value, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        self.insert_local(fp, value.clone(), ttl).await;
        if let Some(store) = &self.store {
            if let Err(e) = store.put(&fp.store_key(), value, Some(ttl)).await {
                tracing::warn!(fingerprint = %fp, error = %e, "Decision write-through failed");
            }
        }
    }

    /// Number of entries, including any not-yet-evicted expired ones
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the cache is empty
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Counter snapshot
    pub fn metrics(&self) -> DecisionCacheMetrics {
        DecisionCacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
