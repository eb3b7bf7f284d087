//! Session state persistence for cadweave
//!
//! Three services live here, all with explicit lifetimes owned by the
//! orchestrator (no process-wide mutable state):
//!
//! - [`StateStore`]: the abstract key/value contract the core expects from
//!   a storage backend, plus an in-memory reference implementation.
//! - [`Checkpointer`]: durable session snapshots with a ring-buffer
//!   retention policy and a non-blocking background writer.
//! - [`DecisionCache`]: fingerprint-keyed memoization of expensive agent
//!   outputs with TTL expiry and hit/miss metrics.

pub mod checkpoint;
pub mod decision;
pub mod error;
pub mod snapshot;
pub mod store;

pub use checkpoint::{CheckpointRecord, Checkpointer, CheckpointerConfig, CheckpointerMetrics};
pub use decision::{fingerprint, DecisionCache, DecisionCacheMetrics, Fingerprint};
pub use error::{Result, StateError};
pub use snapshot::{diff, DocumentObject, SessionSnapshot, StateDiff};
pub use store::{InMemoryStateStore, StateStore};
