//! Durable session checkpoints with ring-buffer retention
//!
//! Key layout in the backing store:
//!
//! ```text
//! state:{session}:{name}:{ts}   -> serialized snapshot
//! latest:{session}              -> key of the newest snapshot
//! history:{session}             -> hash of ts -> {key, name, digest}
//! ```
//!
//! Two write paths exist. [`Checkpointer::put`] is durable before it
//! returns and is used at pipeline transition boundaries.`put_async`
//! queues the write on a background task with a bounded pending queue;
//! on overflow the OLDEST pending write is dropped (the newest snapshot
//! is always the one worth keeping). [`Checkpointer::flush`] waits for
//! the queue to drain, which the pipeline does before publishing a
//! terminal event so same-session readers observe program order.

use crate::error::{Result, StateError};
use crate::snapshot::SessionSnapshot;
use crate::store::StateStore;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Checkpointer tuning knobs
#[derive(Debug, Clone)]
pub struct CheckpointerConfig {
    /// TTL applied to snapshot keys; `None` keeps them until purged
    pub default_ttl: Option<Duration>,
    /// Checkpoints retained per session (ring buffer)
    pub history_limit: usize,
    /// Bound on queued async writes before the oldest is dropped
    pub pending_limit: usize,
}

impl Default for CheckpointerConfig {
    fn default() -> Self {
        Self {
            // command timeout (300s) x default max iterations (5)
            default_ttl: Some(Duration::from_secs(1500)),
            history_limit: 20,
            pending_limit: 64,
        }
    }
}

/// Identity of one stored checkpoint
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CheckpointRecord {
    /// Owning session
    pub session_id: String,
    /// Checkpoint name (e.g. "layer_complete", "terminal")
    pub name: String,
    /// Monotonic timestamp in milliseconds
    pub ts_ms: i64,
    /// Full store key of the snapshot blob
    pub key: String,
    /// SHA-256 hex digest of the serialized snapshot
    pub digest: String,
}

/// Counters exposed through orchestrator metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CheckpointerMetrics {
    /// Snapshots written to the store
    pub writes: u64,
    /// Async writes dropped on queue overflow
    pub dropped: u64,
    /// Writes currently queued or in flight
    pub outstanding: usize,
}

struct WriteJob {
    session_id: String,
    name: String,
    snapshot: SessionSnapshot,
}

struct Shared {
    pending: Mutex<VecDeque<WriteJob>>,
    wake: Notify,
    drained: Notify,
    outstanding: AtomicUsize,
    writes: AtomicU64,
    dropped: AtomicU64,
    shutdown: AtomicBool,
}

/// Session checkpoint writer and reader
pub struct Checkpointer {
    store: Arc<dyn StateStore>,
    config: CheckpointerConfig,
    shared: Arc<Shared>,
    last_ts: Arc<AtomicI64>,
}

impl Checkpointer {
    /// Create a checkpointer and spawn its background writer
    pub fn new(store: Arc<dyn StateStore>, config: CheckpointerConfig) -> Self {
        let shared = Arc::new(Shared {
            pending: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            drained: Notify::new(),
            outstanding: AtomicUsize::new(0),
            writes: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        });
        let last_ts = Arc::new(AtomicI64::new(0));

        let cp = Self {
            store: Arc::clone(&store),
            config: config.clone(),
            shared: Arc::clone(&shared),
            last_ts: Arc::clone(&last_ts),
        };

        tokio::spawn(writer_loop(store, config, shared, last_ts));
        cp
    }

    /// Durably write a checkpoint; returns once the store acknowledged it
    pub async fn put(
        &self,
        session_id: &str,
        name: &str,
        snapshot: &SessionSnapshot,
    ) -> Result<CheckpointRecord> {
        let ts = next_ts(&self.last_ts);
        let record =
            write_record(&*self.store, &self.config, session_id, name, snapshot, ts).await?;
        self.shared.writes.fetch_add(1, Ordering::Relaxed);
        Ok(record)
    }

    /// Queue a checkpoint write without blocking the caller
    ///
    /// On queue overflow the oldest pending write is dropped and counted
    /// in [`CheckpointerMetrics::dropped`].
    pub fn put_async(&self, session_id: &str, name: &str, snapshot: SessionSnapshot) {
        let job = WriteJob {
            session_id: session_id.to_string(),
            name: name.to_string(),
            snapshot,
        };
        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        {
            let mut pending = self
                .shared
                .pending
                .lock()
                .expect("checkpoint queue lock poisoned");
            if pending.len() >= self.config.pending_limit {
                pending.pop_front();
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                self.shared.outstanding.fetch_sub(1, Ordering::AcqRel);
                tracing::warn!(session = session_id, "Checkpoint queue full; dropped oldest");
            }
            pending.push_back(job);
        }
        self.shared.wake.notify_one();
    }

    /// Wait until every queued write has reached the store
    pub async fn flush(&self) {
        loop {
            let drained = self.shared.drained.notified();
            if self.shared.outstanding.load(Ordering::Acquire) == 0 {
                return;
            }
            drained.await;
        }
    }

    /// The newest snapshot for a session
    pub async fn latest(
        &self,
        session_id: &str,
    ) -> Result<Option<(CheckpointRecord, SessionSnapshot)>> {
        let pointer_key = format!("latest:{session_id}");
        let Some(key_value) = self.store.get(&pointer_key).await? else {
            return Ok(None);
        };
        let key = key_value
            .as_str()
            .ok_or_else(|| StateError::Invalid(format!("corrupt latest pointer: {key_value}")))?
            .to_string();

        let Some(blob) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let snapshot: SessionSnapshot = serde_json::from_value(blob.clone())?;
        let record = self
            .history(session_id, usize::MAX)
            .await?
            .into_iter()
            .find(|r| r.key == key)
            .ok_or_else(|| StateError::NotFound(key.clone()))?;
        Ok(Some((record, snapshot)))
    }

    /// Checkpoint records for a session, newest first
    pub async fn history(&self, session_id: &str, limit: usize) -> Result<Vec<CheckpointRecord>> {
        let entries = self
            .store
            .hash_entries(&format!("history:{session_id}"))
            .await?;
        let mut records: Vec<CheckpointRecord> = entries
            .into_values()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect();
        records.sort_by_key(|r| std::cmp::Reverse(r.ts_ms));
        records.truncate(limit);
        Ok(records)
    }

    /// Load the snapshot behind a specific record
    pub async fn load(&self, record: &CheckpointRecord) -> Result<Option<SessionSnapshot>> {
        match self.store.get(&record.key).await? {
            Some(blob) => Ok(Some(serde_json::from_value(blob)?)),
            None => Ok(None),
        }
    }

    /// Remove checkpoints older than the cutoff; returns how many
    pub async fn purge_older_than(
        &self,
        session_id: &str,
        cutoff: chrono::DateTime<chrono::Utc>,
    ) -> Result<usize> {
        let cutoff_ms = cutoff.timestamp_millis();
        let history_key = format!("history:{session_id}");
        let mut removed = 0usize;
        for record in self.history(session_id, usize::MAX).await? {
            if record.ts_ms < cutoff_ms {
                self.store.delete(&record.key).await?;
                self.store
                    .hash_remove(&history_key, &record.ts_ms.to_string())
                    .await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Current writer counters
    pub fn metrics(&self) -> CheckpointerMetrics {
        CheckpointerMetrics {
            writes: self.shared.writes.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            outstanding: self.shared.outstanding.load(Ordering::Acquire),
        }
    }

    /// Stop the background writer after the queue drains
    pub async fn shutdown(&self) {
        self.flush().await;
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake.notify_one();
    }
}

/// Monotonic millisecond timestamps, strictly increasing per process
fn next_ts(last: &AtomicI64) -> i64 {
    let now = chrono::Utc::now().timestamp_millis();
    let mut prev = last.load(Ordering::Acquire);
    loop {
        let candidate = now.max(prev + 1);
        match last.compare_exchange_weak(prev, candidate, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return candidate,
            Err(actual) => prev = actual,
        }
    }
}

async fn write_record(
    store: &dyn StateStore,
    config: &CheckpointerConfig,
    session_id: &str,
    name: &str,
    snapshot: &SessionSnapshot,
    ts: i64,
) -> Result<CheckpointRecord> {
    let blob = serde_json::to_value(snapshot)?;
    let digest = hex_digest(&blob);
    let key = format!("state:{session_id}:{name}:{ts}");

    store.put(&key, blob, config.default_ttl).await?;
    store
        .put(&format!("latest:{session_id}"), json!(key.clone()), None)
        .await?;

    let record = CheckpointRecord {
        session_id: session_id.to_string(),
        name: name.to_string(),
        ts_ms: ts,
        key: key.clone(),
        digest,
    };
    let history_key = format!("history:{session_id}");
    store
        .hash_append(&history_key, &ts.to_string(), serde_json::to_value(&record)?)
        .await?;

    // Ring buffer: evict beyond the retention limit, oldest first
    let entries = store.hash_entries(&history_key).await?;
    if entries.len() > config.history_limit {
        let mut stamps: Vec<i64> = entries.keys().filter_map(|k| k.parse().ok()).collect();
        stamps.sort_unstable();
        let excess = stamps.len().saturating_sub(config.history_limit);
        for stamp in stamps.into_iter().take(excess) {
            if let Some(v) = entries.get(&stamp.to_string()) {
                if let Ok(old) = serde_json::from_value::<CheckpointRecord>(v.clone()) {
                    store.delete(&old.key).await?;
                }
            }
            store.hash_remove(&history_key, &stamp.to_string()).await?;
        }
    }

    tracing::debug!(session = session_id, name, ts, "Checkpoint written");
    Ok(record)
}

fn hex_digest(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    let out = hasher.finalize();
    out.iter().map(|b| format!("{b:02x}")).collect()
}

async fn writer_loop(
    store: Arc<dyn StateStore>,
    config: CheckpointerConfig,
    shared: Arc<Shared>,
    last_ts: Arc<AtomicI64>,
) {
    loop {
        let job = {
            let mut pending = shared.pending.lock().expect("checkpoint queue lock poisoned");
            pending.pop_front()
        };
        match job {
            Some(job) => {
                let ts = next_ts(&last_ts);
                match write_record(&*store, &config, &job.session_id, &job.name, &job.snapshot, ts)
                    .await
                {
                    Ok(_) => {
                        shared.writes.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        tracing::error!(
                            session = %job.session_id,
                            name = %job.name,
                            error = %e,
                            "Checkpoint write failed"
                        );
                    }
                }
                if shared.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
                    shared.drained.notify_waiters();
                }
            }
            None => {
                if shared.shutdown.load(Ordering::Acquire) {
                    break;
                }
                shared.wake.notified().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStateStore;

    fn snapshot(session: &str, names: &[&str]) -> SessionSnapshot {
        SessionSnapshot {
            objects: names
                .iter()
                .map(|n| crate::snapshot::DocumentObject {
                    name: n.to_string(),
                    kind: "solid".to_string(),
                    bounding_box: None,
                    volume: None,
                })
                .collect(),
            ..SessionSnapshot::empty(session)
        }
    }

    fn checkpointer(config: CheckpointerConfig) -> (Checkpointer, Arc<InMemoryStateStore>) {
        let store = Arc::new(InMemoryStateStore::new());
        (Checkpointer::new(store.clone(), config), store)
    }

    #[tokio::test]
    async fn put_then_latest_round_trips() {
        let (cp, _) = checkpointer(CheckpointerConfig::default());
        cp.put("s1", "initial", &snapshot("s1", &["box"])).await.unwrap();

        let (record, snap) = cp.latest("s1").await.unwrap().unwrap();
        assert_eq!(record.name, "initial");
        assert_eq!(snap.object_count(), 1);
        assert_eq!(record.digest.len(), 64);
    }

    #[tokio::test]
    async fn latest_pointer_is_monotonic() {
        let (cp, _) = checkpointer(CheckpointerConfig::default());
        let first = cp.put("s1", "a", &snapshot("s1", &[])).await.unwrap();
        let second = cp.put("s1", "b", &snapshot("s1", &["box"])).await.unwrap();

        assert!(second.ts_ms > first.ts_ms);
        let (latest, _) = cp.latest("s1").await.unwrap().unwrap();
        assert_eq!(latest.key, second.key);
    }

    #[tokio::test]
    async fn history_is_newest_first_and_capped() {
        let config = CheckpointerConfig {
            history_limit: 3,
            ..CheckpointerConfig::default()
        };
        let (cp, store) = checkpointer(config);
        for i in 0..5 {
            cp.put("s1", &format!("cp{i}"), &snapshot("s1", &[])).await.unwrap();
        }

        let history = cp.history("s1", usize::MAX).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].name, "cp4");
        assert_eq!(history[2].name, "cp2");

        // Evicted blobs are gone from the store
        let keys = store.list_keys("state:s1:").await.unwrap();
        assert_eq!(keys.len(), 3);
    }

    #[tokio::test]
    async fn async_writes_flush_in_order() {
        let (cp, _) = checkpointer(CheckpointerConfig::default());
        for i in 0..4 {
            cp.put_async("s1", "tick", snapshot("s1", &[&format!("obj{i}")]));
        }
        cp.flush().await;

        assert_eq!(cp.metrics().writes, 4);
        assert_eq!(cp.metrics().outstanding, 0);
        let (_, snap) = cp.latest("s1").await.unwrap().unwrap();
        assert_eq!(snap.objects[0].name, "obj3");
    }

    #[tokio::test]
    async fn overflow_drops_oldest_pending() {
        let config = CheckpointerConfig {
            pending_limit: 2,
            ..CheckpointerConfig::default()
        };
        let (cp, _) = checkpointer(config);

        // All pushes land before the writer task is scheduled on the
        // current-thread test runtime
        for i in 0..10 {
            cp.put_async("s1", "burst", snapshot("s1", &[&format!("o{i}")]));
        }
        cp.flush().await;

        let m = cp.metrics();
        assert!(m.dropped > 0, "expected overflow drops, got {m:?}");
        assert_eq!(m.outstanding, 0);
    }

    #[tokio::test]
    async fn purge_removes_old_checkpoints() {
        let (cp, _) = checkpointer(CheckpointerConfig::default());
        cp.put("s1", "old", &snapshot("s1", &[])).await.unwrap();
        cp.put("s1", "new", &snapshot("s1", &[])).await.unwrap();

        let removed = cp
            .purge_older_than("s1", chrono::Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert!(cp.history("s1", usize::MAX).await.unwrap().is_empty());
    }
}
