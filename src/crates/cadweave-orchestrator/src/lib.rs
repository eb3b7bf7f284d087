//! Orchestration core for cadweave
//!
//! Turns natural-language CAD requests into validated models by driving a
//! multi-agent pipeline: Plan -> Generate -> Execute -> Validate, with a
//! bounded refinement loop routed by validation scores.
//!
//! The [`Orchestrator`] is the single entry point: it owns the sessions,
//! the priority [`queue::CommandQueue`] and its worker pool, the
//! [`events::EventBus`], the state checkpointer and the decision cache,
//! and it runs one [`pipeline::PipelineRuntime`] task per request. LLM
//! providers and the CAD script sandbox stay behind the
//! [`cadweave_agents::LanguageModel`] and
//! [`cadweave_agents::ScriptExecutor`] traits.
//!
//! ```rust,ignore
//! use cadweave_orchestrator::{CoreConfig, Orchestrator, RequestOptions};
//! use cadweave_state::InMemoryStateStore;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run(provider: Arc<dyn cadweave_agents::LanguageModel>,
//! #              executor: Arc<dyn cadweave_agents::ScriptExecutor>) {
//! let orchestrator = Orchestrator::new(
//!     CoreConfig::default(),
//!     provider,
//!     Some(executor),
//!     Arc::new(InMemoryStateStore::new()),
//! ).unwrap();
//!
//! let id = orchestrator
//!     .submit_request("session-1", "Create a cube 10x10x10", RequestOptions::default())
//!     .unwrap();
//! let result = orchestrator.await_result(&id, Duration::from_secs(120)).await.unwrap();
//! println!("{:?}: {:?}", result.status, result.reason);
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod pipeline;
pub mod queue;
pub mod routing;
pub mod session;

pub use config::CoreConfig;
pub use error::{OrchestratorError, Result};
pub use events::{request_topic, EventBus, EventStream, PipelineEvent, GLOBAL_TOPIC};
pub use orchestrator::{Orchestrator, OrchestratorMetrics, RequestOptions};
pub use pipeline::{
    DesignRequest, ExecuteScriptHandler, NodeExecution, PipelineRuntime, PipelineState,
    PipelineStatus,
};
pub use queue::{
    CommandCallback, CommandContext, CommandHandler, CommandId, CommandOutcome, CommandPayload,
    CommandPriority, CommandQueue, CommandState, CommandSummary, QueueInfo, QueuedCommand,
};
pub use routing::{failure_reason, route, FailureKind, NextState, Thresholds};
pub use session::{Session, SessionManager};
