//! Top-level orchestrator
//!
//! Owns the sessions, the command queue, the state services and the event
//! bus, and routes requests into pipeline runs. Constructed once at
//! startup and passed around explicitly; none of the owned services hold
//! a reference back to it. The global concurrency cap is a fair
//! semaphore, so submissions beyond the cap queue FIFO.

use crate::config::CoreConfig;
use crate::error::{OrchestratorError, Result};
use crate::events::{EventBus, EventStream};
use crate::pipeline::{
    DesignRequest, ExecuteScriptHandler, PipelineRuntime, PipelineState, PipelineStatus,
};
use crate::queue::{CommandContext, CommandHandler, CommandPayload, CommandQueue, QueueInfo};
use crate::session::{Session, SessionManager};
use async_trait::async_trait;
use cadweave_agents::{
    GeneratorAgent, LanguageModel, PlannerAgent, RetryConfig, ScriptExecutor, ValidatorAgent,
};
use cadweave_state::{
    Checkpointer, CheckpointerConfig, CheckpointerMetrics, DecisionCache, DecisionCacheMetrics,
    StateStore,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock, Semaphore};
use tracing::{info, warn};
use uuid::Uuid;

/// Per-request overrides accepted at submission
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestOptions {
    pub max_iterations: Option<u32>,
    pub enable_execution: Option<bool>,
}

/// Aggregated runtime counters
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorMetrics {
    pub requests_submitted: u64,
    pub requests_completed: u64,
    pub requests_failed: u64,
    pub requests_cancelled: u64,
    pub active_requests: usize,
    pub session_count: usize,
    pub avg_pipeline_duration_ms: u64,
    pub decision_cache: DecisionCacheMetrics,
    pub checkpoints: CheckpointerMetrics,
    pub queue: QueueInfo,
    pub events_published: u64,
}

/// Request counters shared with spawned pipeline tasks
#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    active: AtomicUsize,
    total_duration_ms: AtomicU64,
}

struct RequestHandle {
    state: Arc<RwLock<PipelineState>>,
    cancel_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

/// Fallback handler for deployments without a script executor
struct NoExecutorHandler;

#[async_trait]
impl CommandHandler for NoExecutorHandler {
    async fn handle(
        &self,
        payload: &CommandPayload,
        _ctx: &CommandContext,
    ) -> std::result::Result<serde_json::Value, String> {
        Err(format!(
            "no script executor configured; cannot run '{}'",
            payload.kind
        ))
    }
}

/// The orchestration core's public entry point
pub struct Orchestrator {
    config: CoreConfig,
    bus: Arc<EventBus>,
    queue: Arc<CommandQueue>,
    checkpointer: Arc<Checkpointer>,
    decisions: Arc<DecisionCache>,
    runtime: Arc<PipelineRuntime>,
    sessions: Arc<SessionManager>,
    requests: DashMap<String, RequestHandle>,
    permits: Arc<Semaphore>,
    counters: Arc<Counters>,
    janitor: tokio::task::JoinHandle<()>,
}

impl Orchestrator {
    /// Wire up the core
    ///
    /// Must be called within a tokio runtime; the queue workers, the
    /// checkpoint writer and the session janitor are spawned here.
    pub fn new(
        config: CoreConfig,
        provider: Arc<dyn LanguageModel>,
        executor: Option<Arc<dyn ScriptExecutor>>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self> {
        config.validate()?;

        let bus = Arc::new(EventBus::new(config.event_subscriber_backlog));
        let checkpointer = Arc::new(Checkpointer::new(
            Arc::clone(&store),
            CheckpointerConfig {
                default_ttl: Some(Duration::from_secs(
                    config.command_timeout_secs * config.max_iterations as u64,
                )),
                history_limit: config.checkpoint_history_limit,
                pending_limit: config.checkpoint_pending_limit,
            },
        ));
        let decisions = Arc::new(DecisionCache::new(config.decision_cache_ttl()).with_store(store));

        let handler: Arc<dyn CommandHandler> = match &executor {
            Some(executor) => Arc::new(ExecuteScriptHandler::new(
                Arc::clone(executor),
                Arc::clone(&bus),
            )),
            None => Arc::new(NoExecutorHandler),
        };
        let queue = Arc::new(CommandQueue::new(
            handler,
            config.worker_concurrency,
            config.dependency_requeue_delay(),
        ));

        let retry = RetryConfig::new(config.agent_max_retries);
        let runtime = Arc::new(PipelineRuntime::new(
            PlannerAgent::new(Arc::clone(&provider)).with_retry(retry.clone()),
            GeneratorAgent::new(Arc::clone(&provider)).with_retry(retry.clone()),
            ValidatorAgent::new(provider)
                .with_retry(retry)
                .with_thresholds(config.pass_threshold, config.refine_threshold),
            executor,
            Arc::clone(&queue),
            Arc::clone(&checkpointer),
            Arc::clone(&decisions),
            Arc::clone(&bus),
            config.clone(),
        ));

        let sessions = Arc::new(SessionManager::new(config.session_idle_timeout()));
        let janitor = {
            let sessions = Arc::clone(&sessions);
            let period = config
                .session_idle_timeout()
                .min(Duration::from_secs(60))
                .max(Duration::from_secs(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    sessions.purge_idle();
                }
            })
        };

        Ok(Self {
            permits: Arc::new(Semaphore::new(config.max_concurrent_requests)),
            config,
            bus,
            queue,
            checkpointer,
            decisions,
            runtime,
            sessions,
            requests: DashMap::new(),
            counters: Arc::new(Counters::default()),
            janitor,
        })
    }

    /// Subscribe to an event topic (see [`crate::events`])
    pub fn subscribe(&self, topic: &str) -> EventStream {
        self.bus.subscribe(topic)
    }

    /// Accept a design request; returns its request id
    ///
    /// The pipeline starts as soon as a global slot frees up; submissions
    /// beyond `max_concurrent_requests` wait their turn in FIFO order. A
    /// session can have at most one pipeline in flight.
    pub fn submit_request(
        &self,
        session_id: &str,
        prompt: &str,
        options: RequestOptions,
    ) -> Result<String> {
        if !self.sessions.try_begin_pipeline(session_id) {
            return Err(OrchestratorError::SessionBusy(session_id.to_string()));
        }

        let request = DesignRequest {
            request_id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            prompt: prompt.to_string(),
            max_iterations: options
                .max_iterations
                .unwrap_or(self.config.max_iterations)
                .max(1),
            enable_execution: options
                .enable_execution
                .unwrap_or(self.config.enable_execution),
        };
        let request_id = request.request_id.clone();

        let state = Arc::new(RwLock::new(PipelineState::new(&request)));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        self.requests.insert(
            request_id.clone(),
            RequestHandle {
                state: Arc::clone(&state),
                cancel_tx,
                done_rx,
            },
        );

        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        self.counters.active.fetch_add(1, Ordering::AcqRel);
        info!(request_id = %request_id, session_id, "Request submitted");

        let runtime = Arc::clone(&self.runtime);
        let permits = Arc::clone(&self.permits);
        let sessions = Arc::clone(&self.sessions);
        let counters = Arc::clone(&self.counters);

        tokio::spawn(async move {
            // Fair semaphore: FIFO admission beyond the global cap
            let _permit = permits
                .acquire_owned()
                .await
                .expect("request semaphore never closed");
            let started = std::time::Instant::now();

            runtime
                .run(request.clone(), Arc::clone(&state), cancel_rx)
                .await;

            let status = state.read().await.status;
            sessions.record_outcome(&request.session_id, status == PipelineStatus::Completed);
            match status {
                PipelineStatus::Completed => counters.completed.fetch_add(1, Ordering::Relaxed),
                PipelineStatus::Cancelled => counters.cancelled.fetch_add(1, Ordering::Relaxed),
                _ => counters.failed.fetch_add(1, Ordering::Relaxed),
            };
            counters
                .total_duration_ms
                .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
            counters.active.fetch_sub(1, Ordering::AcqRel);
            let _ = done_tx.send(true);
        });

        Ok(request_id)
    }

    /// Block up to `timeout` for the request's terminal state
    pub async fn await_result(&self, request_id: &str, timeout: Duration) -> Result<PipelineState> {
        let (state, mut done) = {
            let handle = self
                .requests
                .get(request_id)
                .ok_or_else(|| OrchestratorError::RequestNotFound(request_id.to_string()))?;
            (Arc::clone(&handle.state), handle.done_rx.clone())
        };

        let waited = tokio::time::timeout(timeout, async {
            loop {
                if *done.borrow() {
                    return;
                }
                if done.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;
        if waited.is_err() {
            return Err(OrchestratorError::AwaitTimeout {
                id: request_id.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        let result = state.read().await.clone();
        Ok(result)
    }

    /// Request cancellation of a pipeline
    ///
    /// Takes effect at the next transition boundary; in-flight agent
    /// calls are aborted best-effort. Returns false for unknown or
    /// already-terminal requests.
    pub fn cancel(&self, request_id: &str) -> bool {
        let Some(handle) = self.requests.get(request_id) else {
            return false;
        };
        if *handle.done_rx.borrow() {
            return false;
        }
        warn!(request_id, "Cancellation requested");
        handle.cancel_tx.send(true).is_ok()
    }

    /// Snapshot of a request's current pipeline state
    pub async fn request_state(&self, request_id: &str) -> Result<PipelineState> {
        let state = self
            .requests
            .get(request_id)
            .map(|h| Arc::clone(&h.state))
            .ok_or_else(|| OrchestratorError::RequestNotFound(request_id.to_string()))?;
        let result = state.read().await.clone();
        Ok(result)
    }

    /// Session bookkeeping for one session
    pub fn session_info(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id)
    }

    /// Counter snapshot across all components
    pub fn metrics(&self) -> OrchestratorMetrics {
        let counters = &self.counters;
        let terminal = counters.completed.load(Ordering::Relaxed)
            + counters.failed.load(Ordering::Relaxed)
            + counters.cancelled.load(Ordering::Relaxed);
        let avg = if terminal == 0 {
            0
        } else {
            counters.total_duration_ms.load(Ordering::Relaxed) / terminal
        };
        OrchestratorMetrics {
            requests_submitted: counters.submitted.load(Ordering::Relaxed),
            requests_completed: counters.completed.load(Ordering::Relaxed),
            requests_failed: counters.failed.load(Ordering::Relaxed),
            requests_cancelled: counters.cancelled.load(Ordering::Relaxed),
            active_requests: counters.active.load(Ordering::Acquire),
            session_count: self.sessions.len(),
            avg_pipeline_duration_ms: avg,
            decision_cache: self.decisions.metrics(),
            checkpoints: self.checkpointer.metrics(),
            queue: self.queue.info(),
            events_published: self.bus.published_count(),
        }
    }

    /// The checkpointer, for direct state reads (latest/history/diff)
    pub fn checkpointer(&self) -> &Arc<Checkpointer> {
        &self.checkpointer
    }

    /// Cancel all in-flight requests and stop background services
    pub async fn shutdown(&self) {
        for handle in self.requests.iter() {
            if !*handle.done_rx.borrow() {
                let _ = handle.cancel_tx.send(true);
            }
        }
        self.queue.shutdown().await;
        self.checkpointer.shutdown().await;
        self.janitor.abort();
        info!("Orchestrator shut down");
    }
}
