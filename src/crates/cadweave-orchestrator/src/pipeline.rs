//! Pipeline runtime: the per-request state machine
//!
//! Drives one design request through
//! `Plan -> Generate -> Execute -> Validate` with bounded refinement.
//! Transitions are serialized per request (the runtime owns the request's
//! task), every transition appends one node-history entry, and terminal
//! states are absorbing. Cancellation is honored at transition boundaries;
//! in-flight agent calls observe the cancel signal between retry attempts.
//!
//! The iteration counter increments at the start of every
//! generate-validate pass: once on each `Planning` entry (initial plan and
//! replan) and once when a refinement loops back into `Generating`.

use crate::config::CoreConfig;
use crate::error::{OrchestratorError, Result};
use crate::events::{request_topic, EventBus, PipelineEvent, GLOBAL_TOPIC};
use crate::queue::{
    CommandContext, CommandHandler, CommandPayload, CommandQueue, CommandState, QueuedCommand,
};
use crate::routing::{failure_reason, route, FailureKind, NextState, Thresholds};
use async_trait::async_trait;
use cadweave_agents::{
    AgentError, ExecutionReport, GeneratorAgent, PlannerAgent, ScriptExecutor, ValidationResult,
    ValidatorAgent,
};
use cadweave_graph::{TaskGraph, TaskId, TaskStatus};
use cadweave_state::{fingerprint, Checkpointer, DecisionCache, DocumentObject, SessionSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};

/// An immutable design request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesignRequest {
    pub request_id: String,
    pub session_id: String,
    pub prompt: String,
    pub max_iterations: u32,
    pub enable_execution: bool,
}

/// Pipeline status per request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Pending,
    Planning,
    Generating,
    Executing,
    Validating,
    Refining,
    Completed,
    Failed,
    Cancelled,
}

impl PipelineStatus {
    /// Stable snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Pending => "pending",
            PipelineStatus::Planning => "planning",
            PipelineStatus::Generating => "generating",
            PipelineStatus::Executing => "executing",
            PipelineStatus::Validating => "validating",
            PipelineStatus::Refining => "refining",
            PipelineStatus::Completed => "completed",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Cancelled => "cancelled",
        }
    }

    /// Whether the status is terminal (absorbing)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineStatus::Completed | PipelineStatus::Failed | PipelineStatus::Cancelled
        )
    }
}

/// One entry in the node execution history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
    pub node: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub output_summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Mutable per-request pipeline state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub request_id: String,
    pub session_id: String,
    pub status: PipelineStatus,
    /// 1-based; increments at the start of every generate-validate pass
    pub current_iteration: u32,
    pub max_iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_graph: Option<TaskGraph>,
    #[serde(default)]
    pub scripts: BTreeMap<TaskId, String>,
    /// Artifact id to artifact name
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_validation: Option<ValidationResult>,
    #[serde(default)]
    pub error_history: Vec<String>,
    #[serde(default)]
    pub node_history: Vec<NodeExecution>,
    /// Machine-readable terminal reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineState {
    /// Fresh state for a request
    pub fn new(request: &DesignRequest) -> Self {
        let now = Utc::now();
        Self {
            request_id: request.request_id.clone(),
            session_id: request.session_id.clone(),
            status: PipelineStatus::Pending,
            current_iteration: 0,
            max_iterations: request.max_iterations,
            task_graph: None,
            scripts: BTreeMap::new(),
            artifacts: BTreeMap::new(),
            last_validation: None,
            error_history: Vec::new(),
            node_history: Vec::new(),
            reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the status; terminal states are absorbing
    pub fn set_status(&mut self, status: PipelineStatus) {
        if self.status.is_terminal() {
            warn!(
                request_id = %self.request_id,
                from = self.status.as_str(),
                to = status.as_str(),
                "Ignored transition out of terminal state"
            );
            return;
        }
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Open a node-history entry
    pub fn enter_node(&mut self, node: &str) {
        self.node_history.push(NodeExecution {
            node: node.to_string(),
            started_at: Utc::now(),
            completed_at: None,
            output_summary: String::new(),
            error: None,
        });
        self.updated_at = Utc::now();
    }

    /// Close the most recent node-history entry, if still open
    pub fn exit_node(&mut self, summary: impl Into<String>, error: Option<String>) {
        if let Some(entry) = self.node_history.last_mut() {
            if entry.completed_at.is_none() {
                entry.completed_at = Some(Utc::now());
                entry.output_summary = summary.into();
                entry.error = error;
            }
        }
        self.updated_at = Utc::now();
    }

    /// Append to the bounded error history
    pub fn record_error(&mut self, message: impl Into<String>, limit: usize) {
        self.error_history.push(message.into());
        let len = self.error_history.len();
        if len > limit {
            self.error_history.drain(..len - limit);
        }
        self.updated_at = Utc::now();
    }

    /// Remaining iteration budget
    pub fn iterations_remaining(&self) -> u32 {
        self.max_iterations.saturating_sub(self.current_iteration)
    }

    /// Node names in history order
    pub fn node_names(&self) -> Vec<&str> {
        self.node_history.iter().map(|n| n.node.as_str()).collect()
    }
}

/// Build the session snapshot reflecting a pipeline state
pub fn snapshot_of(state: &PipelineState) -> SessionSnapshot {
    SessionSnapshot {
        session_id: state.session_id.clone(),
        objects: state
            .artifacts
            .iter()
            .map(|(_, name)| DocumentObject {
                name: name.clone(),
                kind: "solid".to_string(),
                bounding_box: None,
                volume: None,
            })
            .collect(),
        has_errors: !state.error_history.is_empty(),
        pipeline_status: Some(state.status.as_str().to_string()),
        iteration: state.current_iteration,
        captured_at: Utc::now(),
    }
}

/// Publish an event to the request topic and the global topic
pub(crate) fn publish_event(bus: &EventBus, request_id: &str, event: PipelineEvent) {
    bus.publish(&request_topic(request_id), event.clone());
    bus.publish(GLOBAL_TOPIC, event);
}

/// Queue handler that forwards `execute_script` commands to the sandbox
pub struct ExecuteScriptHandler {
    executor: Arc<dyn ScriptExecutor>,
    bus: Arc<EventBus>,
}

impl ExecuteScriptHandler {
    pub fn new(executor: Arc<dyn ScriptExecutor>, bus: Arc<EventBus>) -> Self {
        Self { executor, bus }
    }
}

#[async_trait]
impl CommandHandler for ExecuteScriptHandler {
    async fn handle(
        &self,
        payload: &CommandPayload,
        ctx: &CommandContext,
    ) -> std::result::Result<serde_json::Value, String> {
        if payload.kind != "execute_script" {
            return Err(format!("unknown command kind '{}'", payload.kind));
        }
        let request_id = payload.data["request_id"].as_str().unwrap_or_default().to_string();
        let task_id = payload.data["task_id"].as_str().unwrap_or_default().to_string();
        let script = payload.data["script"].as_str().unwrap_or_default().to_string();
        let timeout = Duration::from_secs(payload.data["timeout_secs"].as_u64().unwrap_or(300));

        if ctx.is_cancelled() {
            return Err("cancelled before execution".into());
        }
        publish_event(
            &self.bus,
            &request_id,
            PipelineEvent::TaskStarted {
                request_id: request_id.clone(),
                task_id: task_id.clone(),
            },
        );

        let scripts = BTreeMap::from([(task_id.clone(), script)]);
        let report = self
            .executor
            .execute(&scripts, &request_id, timeout)
            .await
            .map_err(|e| e.to_string())?;

        if !report.success {
            return Err(report.errors.join("; "));
        }
        serde_json::to_value(&report).map_err(|e| e.to_string())
    }
}

/// The per-request pipeline driver
pub struct PipelineRuntime {
    planner: PlannerAgent,
    generator: GeneratorAgent,
    validator: ValidatorAgent,
    executor: Option<Arc<dyn ScriptExecutor>>,
    queue: Arc<CommandQueue>,
    checkpointer: Arc<Checkpointer>,
    decisions: Arc<DecisionCache>,
    bus: Arc<EventBus>,
    config: CoreConfig,
}

impl PipelineRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        planner: PlannerAgent,
        generator: GeneratorAgent,
        validator: ValidatorAgent,
        executor: Option<Arc<dyn ScriptExecutor>>,
        queue: Arc<CommandQueue>,
        checkpointer: Arc<Checkpointer>,
        decisions: Arc<DecisionCache>,
        bus: Arc<EventBus>,
        config: CoreConfig,
    ) -> Self {
        Self {
            planner,
            generator,
            validator,
            executor,
            queue,
            checkpointer,
            decisions,
            bus,
            config,
        }
    }

    fn thresholds(&self) -> Thresholds {
        Thresholds {
            pass: self.config.pass_threshold,
            refine: self.config.refine_threshold,
            replan: self.config.replan_threshold,
        }
    }

    /// Run a request to its terminal state
    ///
    /// The shared state is the single source of truth the orchestrator
    /// reads; this task is its only writer.
    pub async fn run(
        &self,
        request: DesignRequest,
        state: Arc<RwLock<PipelineState>>,
        cancel: watch::Receiver<bool>,
    ) {
        let ticker = self.spawn_interval_checkpoints(&request, Arc::clone(&state));

        let outcome = self.drive(&request, &state, &cancel).await;
        if let Err(e) = outcome {
            let (status, reason) = match &e {
                OrchestratorError::Agent(agent_err) => {
                    let kind = FailureKind::classify(agent_err);
                    if kind == FailureKind::Cancelled {
                        (PipelineStatus::Cancelled, kind.as_str().to_string())
                    } else {
                        (PipelineStatus::Failed, format!("{}: {agent_err}", kind.as_str()))
                    }
                }
                other => {
                    error!(request_id = %request.request_id, error = %other, "Pipeline unrecoverable");
                    publish_event(
                        &self.bus,
                        &request.request_id,
                        PipelineEvent::Error {
                            request_id: Some(request.request_id.clone()),
                            message: other.to_string(),
                        },
                    );
                    (
                        PipelineStatus::Failed,
                        format!("{}: {other}", FailureKind::Unrecoverable.as_str()),
                    )
                }
            };
            {
                let mut s = state.write().await;
                s.exit_node("aborted", Some(reason.clone()));
                s.record_error(reason.clone(), self.config.error_history_limit);
            }
            self.finish(&request, &state, status, Some(reason)).await;
        }

        ticker.abort();
    }

    /// The state machine proper; `Ok(())` means a terminal state was set
    async fn drive(
        &self,
        request: &DesignRequest,
        state: &Arc<RwLock<PipelineState>>,
        cancel: &watch::Receiver<bool>,
    ) -> Result<()> {
        let mut replan_feedback: Option<String> = None;

        // Each pass of this loop is one planning cycle
        loop {
            self.check_cancel(cancel)?;

            // PLANNING
            let iteration = {
                let mut s = state.write().await;
                s.set_status(PipelineStatus::Planning);
                s.current_iteration += 1;
                s.enter_node("planning");
                s.current_iteration
            };
            publish_event(
                &self.bus,
                &request.request_id,
                PipelineEvent::NodeEntered {
                    request_id: request.request_id.clone(),
                    node: "planning".into(),
                    iteration,
                },
            );

            let graph = self
                .plan_with_cache(request, iteration, replan_feedback.take(), cancel)
                .await?;
            {
                let mut s = state.write().await;
                s.exit_node(format!("{} tasks planned", graph.len()), None);
                s.task_graph = Some(graph);
            }
            publish_event(
                &self.bus,
                &request.request_id,
                PipelineEvent::NodeExited {
                    request_id: request.request_id.clone(),
                    node: "planning".into(),
                    iteration,
                },
            );

            // Generate/execute/validate passes under the current plan
            let mut refine_feedback: Option<String> = None;
            let mut first_pass = true;

            loop {
                self.check_cancel(cancel)?;
                let iteration = {
                    let mut s = state.write().await;
                    if !first_pass {
                        s.current_iteration += 1;
                    }
                    s.current_iteration
                };
                first_pass = false;

                // GENERATING
                self.run_generating(request, state, iteration, refine_feedback.take(), cancel)
                    .await?;

                // EXECUTING
                self.check_cancel(cancel)?;
                let report = if request.enable_execution && self.executor.is_some() {
                    Some(self.run_executing(request, state, iteration, cancel).await?)
                } else {
                    None
                };

                // VALIDATING
                self.check_cancel(cancel)?;
                let validation = self
                    .run_validating(request, state, iteration, report.as_ref(), cancel)
                    .await?;

                let remaining = state.read().await.iterations_remaining();
                let next = route(
                    &validation,
                    remaining,
                    self.config.enable_refinement,
                    self.thresholds(),
                );
                info!(
                    request_id = %request.request_id,
                    score = validation.overall_score,
                    remaining,
                    next = ?next,
                    "Validation routed"
                );

                match next {
                    NextState::Completed => {
                        self.finish(request, state, PipelineStatus::Completed, None).await;
                        return Ok(());
                    }
                    NextState::Refining => {
                        {
                            let mut s = state.write().await;
                            s.set_status(PipelineStatus::Refining);
                            s.enter_node("refining");
                            s.exit_node(
                                format!("refining at score {:.2}", validation.overall_score),
                                None,
                            );
                        }
                        publish_event(
                            &self.bus,
                            &request.request_id,
                            PipelineEvent::RefinementRequested {
                                request_id: request.request_id.clone(),
                                iteration,
                            },
                        );
                        refine_feedback = Some(validation.feedback_text());
                    }
                    NextState::Replanning => {
                        replan_feedback = Some(validation.feedback_text());
                        break;
                    }
                    NextState::Failed => {
                        let reason = failure_reason(&validation, self.thresholds());
                        self.finish(
                            request,
                            state,
                            PipelineStatus::Failed,
                            Some(reason.to_string()),
                        )
                        .await;
                        return Ok(());
                    }
                }
            }
        }
    }

    fn check_cancel(&self, cancel: &watch::Receiver<bool>) -> Result<()> {
        if *cancel.borrow() {
            return Err(OrchestratorError::Agent(AgentError::Cancelled));
        }
        Ok(())
    }

    async fn run_generating(
        &self,
        request: &DesignRequest,
        state: &Arc<RwLock<PipelineState>>,
        iteration: u32,
        feedback: Option<String>,
        cancel: &watch::Receiver<bool>,
    ) -> Result<()> {
        {
            let mut s = state.write().await;
            s.set_status(PipelineStatus::Generating);
            s.enter_node("generating");
        }
        publish_event(
            &self.bus,
            &request.request_id,
            PipelineEvent::NodeEntered {
                request_id: request.request_id.clone(),
                node: "generating".into(),
                iteration,
            },
        );

        let (graph, current_scripts) = {
            let s = state.read().await;
            let graph = s
                .task_graph
                .clone()
                .ok_or_else(|| OrchestratorError::Unrecoverable("no task graph".into()))?;
            let current = if s.scripts.is_empty() {
                None
            } else {
                Some(s.scripts.clone())
            };
            (graph, current)
        };

        let scripts = self
            .generate_with_cache(request, iteration, &graph, current_scripts, feedback, cancel)
            .await?;
        {
            let mut s = state.write().await;
            s.exit_node(format!("{} scripts generated", scripts.len()), None);
            s.scripts = scripts;
        }
        publish_event(
            &self.bus,
            &request.request_id,
            PipelineEvent::NodeExited {
                request_id: request.request_id.clone(),
                node: "generating".into(),
                iteration,
            },
        );
        Ok(())
    }

    async fn run_executing(
        &self,
        request: &DesignRequest,
        state: &Arc<RwLock<PipelineState>>,
        iteration: u32,
        cancel: &watch::Receiver<bool>,
    ) -> Result<ExecutionReport> {
        {
            let mut s = state.write().await;
            s.set_status(PipelineStatus::Executing);
            s.enter_node("executing");
        }
        publish_event(
            &self.bus,
            &request.request_id,
            PipelineEvent::NodeEntered {
                request_id: request.request_id.clone(),
                node: "executing".into(),
                iteration,
            },
        );

        let result = self.dispatch_layers(request, state, cancel).await;
        let summary = match &result {
            Ok(report) => format!(
                "executed: success={} artifacts={}",
                report.success,
                report.artifacts.len()
            ),
            Err(e) => format!("execution aborted: {e}"),
        };
        {
            let mut s = state.write().await;
            s.exit_node(summary, result.as_ref().err().map(|e| e.to_string()));
        }
        publish_event(
            &self.bus,
            &request.request_id,
            PipelineEvent::NodeExited {
                request_id: request.request_id.clone(),
                node: "executing".into(),
                iteration,
            },
        );
        result
    }

    /// Dispatch the task graph layer by layer through the command queue
    ///
    /// All tasks of a layer run concurrently (bounded by the worker
    /// pool); the next layer starts only after every task in the current
    /// layer has terminated.
    async fn dispatch_layers(
        &self,
        request: &DesignRequest,
        state: &Arc<RwLock<PipelineState>>,
        cancel: &watch::Receiver<bool>,
    ) -> Result<ExecutionReport> {
        let (levels, scripts) = {
            let mut s = state.write().await;
            let levels = {
                let graph = s
                    .task_graph
                    .as_mut()
                    .ok_or_else(|| OrchestratorError::Unrecoverable("no task graph".into()))?;
                // A refinement round re-runs every task with fresh scripts
                graph.reset();
                graph.topological_levels()?
            };
            (levels, s.scripts.clone())
        };

        let mut command_of: HashMap<TaskId, String> = HashMap::new();
        let mut reports: Vec<ExecutionReport> = Vec::new();
        let await_budget =
            self.config.command_timeout() * self.config.command_max_attempts + Duration::from_secs(5);

        for (layer_idx, layer) in levels.iter().enumerate() {
            self.check_cancel(cancel)?;

            // Submit the whole layer, then wait for all of it
            for task_id in layer {
                let script = scripts.get(task_id).cloned().unwrap_or_default();
                let (deps, deps_ok) = {
                    let s = state.read().await;
                    let graph = s.task_graph.as_ref().expect("graph checked above");
                    let node = graph.task(task_id);
                    let deps: Vec<String> = node
                        .map(|t| {
                            t.dependencies
                                .iter()
                                .filter_map(|d| command_of.get(d).cloned())
                                .collect()
                        })
                        .unwrap_or_default();
                    let deps_ok = node
                        .map(|t| {
                            t.dependencies.iter().all(|d| {
                                graph
                                    .task(d)
                                    .map(|n| n.status == TaskStatus::Completed)
                                    .unwrap_or(false)
                            })
                        })
                        .unwrap_or(true);
                    (deps, deps_ok)
                };
                if !deps_ok {
                    // An upstream task did not complete; this one can
                    // never become eligible
                    let message = format!("task {task_id}: dependency did not complete");
                    {
                        let mut s = state.write().await;
                        if let Some(graph) = s.task_graph.as_mut() {
                            graph.mark(task_id, TaskStatus::Cancelled, None)?;
                        }
                        s.record_error(message.clone(), self.config.error_history_limit);
                    }
                    publish_event(
                        &self.bus,
                        &request.request_id,
                        PipelineEvent::TaskFailed {
                            request_id: request.request_id.clone(),
                            task_id: task_id.clone(),
                            error: message.clone(),
                        },
                    );
                    reports.push(ExecutionReport::failure(vec![message], Duration::ZERO));
                    continue;
                }
                {
                    let mut s = state.write().await;
                    if let Some(graph) = s.task_graph.as_mut() {
                        graph.mark(task_id, TaskStatus::Ready, None)?;
                    }
                }
                let payload = CommandPayload::new(
                    "execute_script",
                    json!({
                        "request_id": request.request_id,
                        "task_id": task_id,
                        "script": script,
                        "timeout_secs": self.config.command_timeout_secs,
                    }),
                );
                let command_id = self.queue.submit(
                    QueuedCommand::new(request.session_id.clone(), payload)
                        .with_dependencies(deps)
                        .with_timeout(self.config.command_timeout())
                        .with_max_attempts(self.config.command_max_attempts),
                );
                command_of.insert(task_id.clone(), command_id);
            }

            for task_id in layer {
                // Tasks whose dependencies never completed were not submitted
                let Some(command_id) = command_of.get(task_id).cloned() else {
                    continue;
                };
                {
                    let mut s = state.write().await;
                    if let Some(graph) = s.task_graph.as_mut() {
                        graph.mark(task_id, TaskStatus::Running, None)?;
                    }
                }
                let outcome = self.queue.await_result(&command_id, await_budget).await?;
                match outcome.state {
                    CommandState::Completed => {
                        let report: ExecutionReport = outcome
                            .result
                            .as_ref()
                            .map(|v| serde_json::from_value(v.clone()))
                            .transpose()?
                            .unwrap_or_else(|| {
                                ExecutionReport::success(Vec::new(), Duration::ZERO)
                            });
                        let artifact_name = report
                            .artifacts
                            .first()
                            .map(|a| a.name.clone());
                        {
                            let mut s = state.write().await;
                            for artifact in &report.artifacts {
                                s.artifacts.insert(artifact.id.clone(), artifact.name.clone());
                            }
                            if let Some(graph) = s.task_graph.as_mut() {
                                graph.mark(task_id, TaskStatus::Completed, artifact_name.clone())?;
                            }
                        }
                        publish_event(
                            &self.bus,
                            &request.request_id,
                            PipelineEvent::TaskCompleted {
                                request_id: request.request_id.clone(),
                                task_id: task_id.clone(),
                                artifact: artifact_name,
                            },
                        );
                        reports.push(report);
                    }
                    state_now => {
                        let message = outcome
                            .error
                            .clone()
                            .unwrap_or_else(|| format!("command ended as {state_now:?}"));
                        {
                            let mut s = state.write().await;
                            if let Some(graph) = s.task_graph.as_mut() {
                                let target = if state_now == CommandState::Cancelled {
                                    TaskStatus::Cancelled
                                } else {
                                    TaskStatus::Failed
                                };
                                graph.mark(task_id, target, None)?;
                            }
                            s.record_error(
                                format!("task {task_id}: {message}"),
                                self.config.error_history_limit,
                            );
                        }
                        publish_event(
                            &self.bus,
                            &request.request_id,
                            PipelineEvent::TaskFailed {
                                request_id: request.request_id.clone(),
                                task_id: task_id.clone(),
                                error: message.clone(),
                            },
                        );
                        reports.push(ExecutionReport::failure(vec![message], Duration::ZERO));
                    }
                }
            }

            // Layer complete: fire-and-forget checkpoint
            let snapshot = snapshot_of(&*state.read().await);
            let name = format!("layer_{layer_idx}");
            self.checkpointer.put_async(&request.session_id, &name, snapshot);
            publish_event(
                &self.bus,
                &request.request_id,
                PipelineEvent::StateCheckpoint {
                    session_id: request.session_id.clone(),
                    name,
                },
            );
        }

        Ok(aggregate_reports(reports))
    }

    async fn run_validating(
        &self,
        request: &DesignRequest,
        state: &Arc<RwLock<PipelineState>>,
        iteration: u32,
        report: Option<&ExecutionReport>,
        cancel: &watch::Receiver<bool>,
    ) -> Result<ValidationResult> {
        {
            let mut s = state.write().await;
            s.set_status(PipelineStatus::Validating);
            s.enter_node("validating");
        }
        publish_event(
            &self.bus,
            &request.request_id,
            PipelineEvent::NodeEntered {
                request_id: request.request_id.clone(),
                node: "validating".into(),
                iteration,
            },
        );

        let (graph, scripts) = {
            let s = state.read().await;
            (
                s.task_graph
                    .clone()
                    .ok_or_else(|| OrchestratorError::Unrecoverable("no task graph".into()))?,
                s.scripts.clone(),
            )
        };

        let validation = self
            .validate_with_cache(request, iteration, &graph, &scripts, report, cancel)
            .await?;
        {
            let mut s = state.write().await;
            s.exit_node(format!("score {:.2}", validation.overall_score), None);
            s.last_validation = Some(validation.clone());
        }
        publish_event(
            &self.bus,
            &request.request_id,
            PipelineEvent::ValidationScored {
                request_id: request.request_id.clone(),
                score: validation.overall_score,
                is_valid: validation.is_valid,
                iteration,
            },
        );
        publish_event(
            &self.bus,
            &request.request_id,
            PipelineEvent::NodeExited {
                request_id: request.request_id.clone(),
                node: "validating".into(),
                iteration,
            },
        );
        Ok(validation)
    }

    /// Durable checkpoint, terminal event, absorbing status
    async fn finish(
        &self,
        request: &DesignRequest,
        state: &Arc<RwLock<PipelineState>>,
        status: PipelineStatus,
        reason: Option<String>,
    ) {
        {
            let mut s = state.write().await;
            s.set_status(status);
            s.reason = reason.clone();
        }
        let snapshot = snapshot_of(&*state.read().await);
        match self.checkpointer.put(&request.session_id, "terminal", &snapshot).await {
            Ok(_) => publish_event(
                &self.bus,
                &request.request_id,
                PipelineEvent::StateCheckpoint {
                    session_id: request.session_id.clone(),
                    name: "terminal".into(),
                },
            ),
            Err(e) => {
                error!(request_id = %request.request_id, error = %e, "Terminal checkpoint failed")
            }
        }
        // Same-session readers must observe all prior writes first
        self.checkpointer.flush().await;

        info!(
            request_id = %request.request_id,
            status = status.as_str(),
            reason = reason.as_deref().unwrap_or(""),
            "Pipeline terminal"
        );
        publish_event(
            &self.bus,
            &request.request_id,
            PipelineEvent::PipelineTerminal {
                request_id: request.request_id.clone(),
                status: status.as_str().to_string(),
                reason,
            },
        );
    }

    fn spawn_interval_checkpoints(
        &self,
        request: &DesignRequest,
        state: Arc<RwLock<PipelineState>>,
    ) -> tokio::task::JoinHandle<()> {
        let checkpointer = Arc::clone(&self.checkpointer);
        let session_id = request.session_id.clone();
        let interval = self.config.checkpoint_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                let snapshot = {
                    let s = state.read().await;
                    if s.status.is_terminal() {
                        break;
                    }
                    snapshot_of(&s)
                };
                checkpointer.put_async(&session_id, "interval", snapshot);
            }
        })
    }

    async fn plan_with_cache(
        &self,
        request: &DesignRequest,
        iteration: u32,
        feedback: Option<String>,
        cancel: &watch::Receiver<bool>,
    ) -> Result<TaskGraph> {
        let state_summary = self.session_summary(&request.session_id).await;
        let context = format!("iter:{iteration};fb:{}", feedback.as_deref().unwrap_or(""));
        let fp = fingerprint(
            &request.session_id,
            &state_summary,
            &request.prompt,
            "planner",
            &context,
        );
        if let Some(cached) = self.decisions.lookup(&fp).await {
            if let Ok(graph) = serde_json::from_value::<TaskGraph>(cached) {
                info!(request_id = %request.request_id, "Planner decision served from cache");
                return Ok(graph);
            }
        }

        let graph = self
            .planner
            .plan(
                &request.request_id,
                &request.prompt,
                &state_summary,
                feedback.as_deref(),
                cancel,
            )
            .await?;
        self.decisions
            .store(&fp, serde_json::to_value(&graph)?, None)
            .await;
        Ok(graph)
    }

    async fn generate_with_cache(
        &self,
        request: &DesignRequest,
        iteration: u32,
        graph: &TaskGraph,
        current_scripts: Option<BTreeMap<TaskId, String>>,
        feedback: Option<String>,
        cancel: &watch::Receiver<bool>,
    ) -> Result<BTreeMap<TaskId, String>> {
        let state_summary = self.session_summary(&request.session_id).await;
        let plan_digest = serde_json::to_string(graph).unwrap_or_default();
        let context = format!(
            "iter:{iteration};plan:{plan_digest};fb:{}",
            feedback.as_deref().unwrap_or("")
        );
        let fp = fingerprint(
            &request.session_id,
            &state_summary,
            &request.prompt,
            "generator",
            &context,
        );
        if let Some(cached) = self.decisions.lookup(&fp).await {
            if let Ok(scripts) = serde_json::from_value::<BTreeMap<TaskId, String>>(cached) {
                info!(request_id = %request.request_id, "Generator decision served from cache");
                return Ok(scripts);
            }
        }

        let scripts = self
            .generator
            .generate(
                &request.request_id,
                &request.prompt,
                graph,
                current_scripts.as_ref(),
                feedback.as_deref(),
                cancel,
            )
            .await?;
        self.decisions
            .store(&fp, serde_json::to_value(&scripts)?, None)
            .await;
        Ok(scripts)
    }

    async fn validate_with_cache(
        &self,
        request: &DesignRequest,
        iteration: u32,
        graph: &TaskGraph,
        scripts: &BTreeMap<TaskId, String>,
        report: Option<&ExecutionReport>,
        cancel: &watch::Receiver<bool>,
    ) -> Result<ValidationResult> {
        let state_summary = self.session_summary(&request.session_id).await;
        let scripts_digest = serde_json::to_string(scripts).unwrap_or_default();
        let report_digest = report
            .map(|r| serde_json::to_string(r).unwrap_or_default())
            .unwrap_or_default();
        let context = format!("iter:{iteration};scripts:{scripts_digest};report:{report_digest}");
        let fp = fingerprint(
            &request.session_id,
            &state_summary,
            &request.prompt,
            "validator",
            &context,
        );
        if let Some(cached) = self.decisions.lookup(&fp).await {
            if let Ok(validation) = serde_json::from_value::<ValidationResult>(cached) {
                info!(request_id = %request.request_id, "Validator decision served from cache");
                return Ok(validation);
            }
        }

        let validation = self
            .validator
            .validate(&request.request_id, &request.prompt, graph, scripts, report, cancel)
            .await?;
        self.decisions
            .store(&fp, serde_json::to_value(&validation)?, None)
            .await;
        Ok(validation)
    }

    /// Summary of the session's latest checkpointed state, for prompts
    /// and decision fingerprints
    async fn session_summary(&self, session_id: &str) -> String {
        match self.checkpointer.latest(session_id).await {
            Ok(Some((_, snapshot))) => snapshot.summary(),
            _ => "objects=;errors=false".to_string(),
        }
    }
}

/// Merge per-task reports into one request-level report
fn aggregate_reports(reports: Vec<ExecutionReport>) -> ExecutionReport {
    if reports.is_empty() {
        return ExecutionReport::success(Vec::new(), Duration::ZERO);
    }
    let mut merged = ExecutionReport::success(Vec::new(), Duration::ZERO);
    for report in reports {
        merged.success &= report.success;
        merged.is_manifold &= report.is_manifold;
        merged.has_invalid_faces |= report.has_invalid_faces;
        merged.has_self_intersections |= report.has_self_intersections;
        merged.artifacts.extend(report.artifacts);
        merged.errors.extend(report.errors);
        merged.warnings.extend(report.warnings);
        merged.duration += report.duration;
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> DesignRequest {
        DesignRequest {
            request_id: "req-1".into(),
            session_id: "s1".into(),
            prompt: "Create a cube".into(),
            max_iterations: 3,
            enable_execution: true,
        }
    }

    #[test]
    fn terminal_states_are_absorbing() {
        let mut state = PipelineState::new(&request());
        state.set_status(PipelineStatus::Planning);
        state.set_status(PipelineStatus::Completed);
        state.set_status(PipelineStatus::Planning);
        assert_eq!(state.status, PipelineStatus::Completed);
    }

    #[test]
    fn node_history_tracks_entries_in_order() {
        let mut state = PipelineState::new(&request());
        state.enter_node("planning");
        state.exit_node("3 tasks planned", None);
        state.enter_node("generating");
        state.exit_node("3 scripts", None);

        assert_eq!(state.node_names(), vec!["planning", "generating"]);
        assert!(state.node_history[0].completed_at.is_some());
        assert!(state.node_history[0].started_at <= state.node_history[1].started_at);
    }

    #[test]
    fn error_history_is_bounded() {
        let mut state = PipelineState::new(&request());
        for n in 0..30 {
            state.record_error(format!("error {n}"), 20);
        }
        assert_eq!(state.error_history.len(), 20);
        assert_eq!(state.error_history[0], "error 10");
        assert_eq!(state.error_history[19], "error 29");
    }

    #[test]
    fn snapshot_reflects_state() {
        let mut state = PipelineState::new(&request());
        state.set_status(PipelineStatus::Executing);
        state.current_iteration = 2;
        state.artifacts.insert("a1".into(), "base_box".into());

        let snapshot = snapshot_of(&state);
        assert_eq!(snapshot.session_id, "s1");
        assert_eq!(snapshot.object_count(), 1);
        assert_eq!(snapshot.objects[0].name, "base_box");
        assert_eq!(snapshot.pipeline_status.as_deref(), Some("executing"));
        assert_eq!(snapshot.iteration, 2);
    }

    #[test]
    fn aggregate_merges_flags_and_artifacts() {
        let ok = ExecutionReport::success(
            vec![cadweave_agents::Artifact {
                id: "a1".into(),
                name: "box".into(),
                kind: "solid".into(),
                bounding_box: None,
                volume: None,
            }],
            Duration::from_millis(10),
        );
        let mut bad = ExecutionReport::failure(vec!["boom".into()], Duration::from_millis(5));
        bad.has_self_intersections = true;

        let merged = aggregate_reports(vec![ok, bad]);
        assert!(!merged.success);
        assert!(merged.has_self_intersections);
        assert_eq!(merged.artifacts.len(), 1);
        assert_eq!(merged.errors, vec!["boom"]);
        assert_eq!(merged.duration, Duration::from_millis(15));
    }

    #[test]
    fn iterations_remaining_saturates() {
        let mut state = PipelineState::new(&request());
        state.current_iteration = 3;
        assert_eq!(state.iterations_remaining(), 0);
        state.current_iteration = 5;
        assert_eq!(state.iterations_remaining(), 0);
        state.current_iteration = 1;
        assert_eq!(state.iterations_remaining(), 2);
    }
}
