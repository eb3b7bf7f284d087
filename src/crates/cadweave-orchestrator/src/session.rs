//! Session registry
//!
//! Sessions are owned exclusively by the orchestrator. Each session holds
//! activity counters and the status of its in-flight pipeline, if any; at
//! most one pipeline iteration is in flight per session. Idle sessions
//! are destroyed after a configurable timeout.

use crate::pipeline::PipelineStatus;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// One user session
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub commands_processed: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Status of the session's active pipeline, if one is running
    pub pipeline_status: Option<PipelineStatus>,
}

impl Session {
    fn new(session_id: &str) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            created_at: now,
            last_activity: now,
            commands_processed: 0,
            success_count: 0,
            failure_count: 0,
            pipeline_status: None,
        }
    }
}

/// Thread-safe session registry with idle expiry
pub struct SessionManager {
    sessions: DashMap<String, Session>,
    idle_timeout: Duration,
}

impl SessionManager {
    /// Create a registry with the given idle timeout
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            idle_timeout,
        }
    }

    /// Fetch a session, creating it on first touch
    pub fn touch(&self, session_id: &str) -> Session {
        let mut entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id));
        entry.last_activity = Utc::now();
        entry.clone()
    }

    /// Look up a session without refreshing its activity
    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    /// Claim the session's single pipeline slot
    ///
    /// Returns false when a pipeline is already in flight; at most one
    /// pipeline runs per session at a time.
    pub fn try_begin_pipeline(&self, session_id: &str) -> bool {
        let mut entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id));
        if entry.pipeline_status.is_some() {
            return false;
        }
        entry.pipeline_status = Some(PipelineStatus::Pending);
        entry.last_activity = Utc::now();
        true
    }

    /// Update the session's active pipeline status
    pub fn set_pipeline_status(&self, session_id: &str, status: Option<PipelineStatus>) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.pipeline_status = status;
            session.last_activity = Utc::now();
        }
    }

    /// Record the outcome of a finished request
    pub fn record_outcome(&self, session_id: &str, succeeded: bool) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.commands_processed += 1;
            if succeeded {
                session.success_count += 1;
            } else {
                session.failure_count += 1;
            }
            session.pipeline_status = None;
            session.last_activity = Utc::now();
        }
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions exist
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Destroy sessions idle longer than the timeout; returns their ids
    ///
    /// Sessions with an active pipeline are never purged.
    pub fn purge_idle(&self) -> Vec<String> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.idle_timeout)
                .unwrap_or_else(|_| chrono::Duration::hours(1));
        let mut purged = Vec::new();
        self.sessions.retain(|id, session| {
            let keep = session.pipeline_status.is_some() || session.last_activity > cutoff;
            if !keep {
                purged.push(id.clone());
            }
            keep
        });
        if !purged.is_empty() {
            debug!(count = purged.len(), "Purged idle sessions");
        }
        purged
    }
}
