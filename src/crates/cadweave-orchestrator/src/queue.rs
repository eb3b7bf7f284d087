//! Priority command queue and worker pool
//!
//! Commands carry an opaque payload, a priority, dependencies on other
//! commands, a timeout and a retry budget. A fixed pool of workers drains
//! the queue; among eligible commands the next dispatched is always the
//! one with the smallest `(priority, created_at)`.
//!
//! Dependency handling: a dequeued command whose dependencies are not yet
//! satisfied is re-enqueued with its original ordering key after a short
//! backoff, so a blocked head never busy-spins a worker. A command whose
//! dependency terminated without completing (failed, cancelled, timed
//! out) is parked: it stays `Pending` forever without occupying a worker.
//! Cancelling a command does NOT cascade to its dependents; the caller
//! must cancel them too.

use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Command identifier
pub type CommandId = String;

/// Scheduling priority; lower ranks dispatch first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandPriority {
    Critical,
    High,
    Normal,
    Low,
}

impl CommandPriority {
    /// Numeric rank used in the ordering key (critical=0 .. low=3)
    pub fn rank(&self) -> u8 {
        match self {
            CommandPriority::Critical => 0,
            CommandPriority::High => 1,
            CommandPriority::Normal => 2,
            CommandPriority::Low => 3,
        }
    }
}

/// Command execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl CommandState {
    /// Whether the state is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandState::Completed
                | CommandState::Failed
                | CommandState::Cancelled
                | CommandState::Timeout
        )
    }
}

/// Opaque command payload plus routing metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandPayload {
    /// Payload kind, interpreted by the handler
    pub kind: String,
    /// Opaque data blob
    pub data: Value,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl CommandPayload {
    /// A payload with no metadata
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            metadata: BTreeMap::new(),
        }
    }
}

/// Terminal outcome delivered to callbacks and `await_result`
#[derive(Debug, Clone, Serialize)]
pub struct CommandOutcome {
    pub command_id: CommandId,
    pub session_id: String,
    pub state: CommandState,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Completion callback invoked once per terminal command
pub type CommandCallback = Arc<dyn Fn(&CommandOutcome) + Send + Sync>;

/// A command submission
pub struct QueuedCommand {
    pub priority: CommandPriority,
    pub session_id: String,
    pub payload: CommandPayload,
    pub dependencies: Vec<CommandId>,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub callback: Option<CommandCallback>,
}

impl QueuedCommand {
    /// A normal-priority command with defaults (300s timeout, 3 attempts)
    pub fn new(session_id: impl Into<String>, payload: CommandPayload) -> Self {
        Self {
            priority: CommandPriority::Normal,
            session_id: session_id.into(),
            payload,
            dependencies: Vec::new(),
            timeout: Duration::from_secs(300),
            max_attempts: 3,
            callback: None,
        }
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: CommandPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set command dependencies
    pub fn with_dependencies(mut self, deps: Vec<CommandId>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Set the execution timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the attempt budget
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Attach a completion callback
    pub fn with_callback(mut self, callback: CommandCallback) -> Self {
        self.callback = Some(callback);
        self
    }
}

/// Cooperative execution context handed to the handler
pub struct CommandContext {
    pub command_id: CommandId,
    pub session_id: String,
    cancelled: Arc<AtomicBool>,
}

impl CommandContext {
    /// Whether cancellation was requested; handlers should check this at
    /// convenient points and return early
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Executes command payloads on behalf of the worker pool
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Run one payload to completion
    ///
    /// The error string feeds retry accounting and the final outcome.
    async fn handle(
        &self,
        payload: &CommandPayload,
        ctx: &CommandContext,
    ) -> std::result::Result<Value, String>;
}

/// Snapshot of one in-flight command for `info()`
#[derive(Debug, Clone, Serialize)]
pub struct CommandSummary {
    pub id: String,
    pub state: CommandState,
    pub started_at: Option<DateTime<Utc>>,
}

/// Queue-level counters and summaries
#[derive(Debug, Clone, Serialize)]
pub struct QueueInfo {
    pub pending_count: usize,
    pub active_count: usize,
    pub worker_count: usize,
    pub completed_count: u64,
    pub active_commands: Vec<CommandSummary>,
}

struct CommandMut {
    state: CommandState,
    attempts: u32,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    result: Option<Value>,
    error: Option<String>,
}

struct CommandEntry {
    id: CommandId,
    session_id: String,
    priority: CommandPriority,
    payload: CommandPayload,
    dependencies: Vec<CommandId>,
    timeout: Duration,
    max_attempts: u32,
    created_at: DateTime<Utc>,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    callback: Option<CommandCallback>,
    state_tx: watch::Sender<CommandState>,
    mu: Mutex<CommandMut>,
}

type HeapKey = Reverse<(u8, i64, u64)>;

struct QueueShared {
    heap: Mutex<BinaryHeap<(HeapKey, CommandId)>>,
    records: DashMap<CommandId, Arc<CommandEntry>>,
    wake: Notify,
    shutdown: AtomicBool,
    active: AtomicUsize,
    completed: AtomicU64,
    seq: AtomicU64,
    handler: Arc<dyn CommandHandler>,
    requeue_delay: Duration,
}

impl QueueShared {
    fn push(&self, entry: &CommandEntry) {
        let key = Reverse((
            entry.priority.rank(),
            entry.created_at.timestamp_millis(),
            entry.seq,
        ));
        self.heap.lock().push((key, entry.id.clone()));
        self.wake.notify_one();
    }
}

/// Priority command queue with a fixed worker pool
pub struct CommandQueue {
    shared: Arc<QueueShared>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    worker_count: usize,
}

impl CommandQueue {
    /// Create a queue and spawn `worker_concurrency` workers
    pub fn new(
        handler: Arc<dyn CommandHandler>,
        worker_concurrency: usize,
        requeue_delay: Duration,
    ) -> Self {
        let shared = Arc::new(QueueShared {
            heap: Mutex::new(BinaryHeap::new()),
            records: DashMap::new(),
            wake: Notify::new(),
            shutdown: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            seq: AtomicU64::new(0),
            handler,
            requeue_delay,
        });

        let worker_count = worker_concurrency.max(1);
        let workers = (0..worker_count)
            .map(|n| {
                let shared = Arc::clone(&shared);
                tokio::spawn(worker_loop(n, shared))
            })
            .collect();

        Self {
            shared,
            workers: Mutex::new(workers),
            worker_count,
        }
    }

    /// Enqueue a command; returns its id
    pub fn submit(&self, cmd: QueuedCommand) -> CommandId {
        let id = Uuid::new_v4().to_string();
        let (state_tx, _) = watch::channel(CommandState::Pending);
        let entry = Arc::new(CommandEntry {
            id: id.clone(),
            session_id: cmd.session_id,
            priority: cmd.priority,
            payload: cmd.payload,
            dependencies: cmd.dependencies,
            timeout: cmd.timeout,
            max_attempts: cmd.max_attempts,
            created_at: Utc::now(),
            seq: self.shared.seq.fetch_add(1, Ordering::Relaxed),
            cancelled: Arc::new(AtomicBool::new(false)),
            callback: cmd.callback,
            state_tx,
            mu: Mutex::new(CommandMut {
                state: CommandState::Pending,
                attempts: 0,
                started_at: None,
                completed_at: None,
                result: None,
                error: None,
            }),
        });
        debug!(command = %short(&id), priority = ?entry.priority, "Command queued");
        self.shared.records.insert(id.clone(), Arc::clone(&entry));
        self.shared.push(&entry);
        id
    }

    /// Cancel a command
    ///
    /// Pending commands become `Cancelled` immediately. Running commands
    /// get their cancel flag set, honored at the handler's next
    /// cooperative point. Dependents of a cancelled command are NOT
    /// cancelled automatically; they stay pending until the caller
    /// cancels them as well. Returns false for unknown or already
    /// terminal commands.
    pub fn cancel(&self, command_id: &str) -> bool {
        let Some(entry) = self.shared.records.get(command_id).map(|e| Arc::clone(&e)) else {
            return false;
        };
        let state = entry.mu.lock().state;
        match state {
            CommandState::Pending => {
                finalize(&self.shared, &entry, CommandState::Cancelled, None, None);
                true
            }
            CommandState::Running => {
                entry.cancelled.store(true, Ordering::Release);
                true
            }
            _ => false,
        }
    }

    /// Current state of a command
    pub fn status(&self, command_id: &str) -> Option<CommandState> {
        self.shared
            .records
            .get(command_id)
            .map(|e| e.mu.lock().state)
    }

    /// Block up to `timeout` for a terminal state
    pub async fn await_result(
        &self,
        command_id: &str,
        timeout: Duration,
    ) -> Result<CommandOutcome> {
        let entry = self
            .shared
            .records
            .get(command_id)
            .map(|e| Arc::clone(&e))
            .ok_or_else(|| OrchestratorError::CommandNotFound(command_id.to_string()))?;

        let mut rx = entry.state_tx.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            loop {
                if entry.mu.lock().state.is_terminal() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;

        if waited.is_err() {
            return Err(OrchestratorError::AwaitTimeout {
                id: command_id.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        Ok(outcome_of(&entry))
    }

    /// Queue counters and active command summaries
    pub fn info(&self) -> QueueInfo {
        let mut pending = 0usize;
        let mut active_commands = Vec::new();
        for entry in self.shared.records.iter() {
            let mu = entry.mu.lock();
            match mu.state {
                CommandState::Pending => pending += 1,
                CommandState::Running => active_commands.push(CommandSummary {
                    id: short(&entry.id).to_string(),
                    state: mu.state,
                    started_at: mu.started_at,
                }),
                _ => {}
            }
        }
        QueueInfo {
            pending_count: pending,
            active_count: self.shared.active.load(Ordering::Acquire),
            worker_count: self.worker_count,
            completed_count: self.shared.completed.load(Ordering::Relaxed),
            active_commands,
        }
    }

    /// Stop workers after their in-flight commands finish
    pub async fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake.notify_waiters();
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("Command queue shut down");
    }
}

fn short(id: &str) -> &str {
    &id[..id.len().min(8)]
}

fn outcome_of(entry: &CommandEntry) -> CommandOutcome {
    let mu = entry.mu.lock();
    CommandOutcome {
        command_id: entry.id.clone(),
        session_id: entry.session_id.clone(),
        state: mu.state,
        result: mu.result.clone(),
        error: mu.error.clone(),
        attempts: mu.attempts,
        started_at: mu.started_at,
        completed_at: mu.completed_at,
    }
}

/// Move a command to a terminal state and fire its callback
fn finalize(
    shared: &QueueShared,
    entry: &CommandEntry,
    state: CommandState,
    result: Option<Value>,
    error: Option<String>,
) {
    {
        let mut mu = entry.mu.lock();
        if mu.state.is_terminal() {
            return;
        }
        mu.state = state;
        mu.completed_at = Some(Utc::now());
        mu.result = result;
        mu.error = error;
    }
    shared.completed.fetch_add(1, Ordering::Relaxed);
    let _ = entry.state_tx.send(state);
    if let Some(callback) = &entry.callback {
        callback(&outcome_of(entry));
    }
    // A completion may unblock dependents sitting in the heap
    shared.wake.notify_one();
}

enum DependencyGate {
    Satisfied,
    /// Some dependency is still pending or running
    NotYet,
    /// Some dependency terminated without completing; never eligible
    Dead,
}

fn check_dependencies(shared: &QueueShared, entry: &CommandEntry) -> DependencyGate {
    for dep in &entry.dependencies {
        match shared.records.get(dep).map(|e| e.mu.lock().state) {
            Some(CommandState::Completed) => {}
            Some(CommandState::Pending) | Some(CommandState::Running) => {
                return DependencyGate::NotYet
            }
            // failed / cancelled / timeout / unknown id
            _ => return DependencyGate::Dead,
        }
    }
    DependencyGate::Satisfied
}

async fn worker_loop(worker: usize, shared: Arc<QueueShared>) {
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        let popped = { shared.heap.lock().pop() };
        let Some((_, id)) = popped else {
            // Create the future before re-checking state: a wakeup sent
            // after this point is never lost
            let notified = shared.wake.notified();
            if shared.shutdown.load(Ordering::Acquire) {
                break;
            }
            if shared.heap.lock().is_empty() {
                notified.await;
            }
            continue;
        };

        let Some(entry) = shared.records.get(&id).map(|e| Arc::clone(&e)) else {
            continue;
        };
        // Stale heap item: the command was cancelled while queued or is a
        // duplicate push from a retry
        if entry.mu.lock().state != CommandState::Pending {
            continue;
        }

        match check_dependencies(&shared, &entry) {
            DependencyGate::Satisfied => {}
            DependencyGate::NotYet => {
                // Re-enqueue with the original ordering key after a short
                // backoff so the worker is free meanwhile
                let shared2 = Arc::clone(&shared);
                let entry2 = Arc::clone(&entry);
                let delay = shared.requeue_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if entry2.mu.lock().state == CommandState::Pending {
                        shared2.push(&entry2);
                    }
                });
                continue;
            }
            DependencyGate::Dead => {
                debug!(
                    command = %short(&entry.id),
                    "Dependency terminated without completing; command parked"
                );
                continue;
            }
        }

        run_command(worker, &shared, &entry).await;
    }
}

async fn run_command(worker: usize, shared: &Arc<QueueShared>, entry: &Arc<CommandEntry>) {
    let attempt = {
        let mut mu = entry.mu.lock();
        mu.state = CommandState::Running;
        mu.attempts += 1;
        mu.started_at = Some(Utc::now());
        mu.attempts
    };
    shared.active.fetch_add(1, Ordering::AcqRel);
    let _ = entry.state_tx.send(CommandState::Running);
    debug!(worker, command = %short(&entry.id), attempt, "Command started");

    let ctx = CommandContext {
        command_id: entry.id.clone(),
        session_id: entry.session_id.clone(),
        cancelled: Arc::clone(&entry.cancelled),
    };
    let outcome = tokio::time::timeout(
        entry.timeout,
        shared.handler.handle(&entry.payload, &ctx),
    )
    .await;

    shared.active.fetch_sub(1, Ordering::AcqRel);

    match outcome {
        Err(_) => {
            warn!(command = %short(&entry.id), "Command timed out");
            finalize(
                shared,
                entry,
                CommandState::Timeout,
                None,
                Some(format!("timed out after {:?}", entry.timeout)),
            );
        }
        Ok(_) if entry.cancelled.load(Ordering::Acquire) => {
            // Result of a cancelled command is discarded
            finalize(shared, entry, CommandState::Cancelled, None, None);
        }
        Ok(Ok(result)) => {
            finalize(shared, entry, CommandState::Completed, Some(result), None);
        }
        Ok(Err(error)) => {
            if attempt < entry.max_attempts {
                warn!(
                    command = %short(&entry.id),
                    attempt,
                    max_attempts = entry.max_attempts,
                    error = %error,
                    "Command failed; re-enqueueing"
                );
                {
                    let mut mu = entry.mu.lock();
                    mu.state = CommandState::Pending;
                    mu.error = Some(error);
                }
                let _ = entry.state_tx.send(CommandState::Pending);
                shared.push(entry);
            } else {
                finalize(shared, entry, CommandState::Failed, None, Some(error));
            }
        }
    }
}
