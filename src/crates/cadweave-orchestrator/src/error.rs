//! Error types for the orchestration runtime

use thiserror::Error;

/// Result type for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors raised by the orchestrator, pipeline runtime and command queue
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Session not found
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Request not found
    #[error("Request not found: {0}")]
    RequestNotFound(String),

    /// The session already has a pipeline in flight
    #[error("Session '{0}' already has a pipeline in flight")]
    SessionBusy(String),

    /// Command not found
    #[error("Command not found: {0}")]
    CommandNotFound(String),

    /// Configuration failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// `await_result` exceeded its timeout
    #[error("Timed out after {timeout_ms}ms waiting for {id}")]
    AwaitTimeout { id: String, timeout_ms: u64 },

    /// The queue or orchestrator is shutting down
    #[error("Shutting down")]
    Shutdown,

    /// An agent adapter surfaced an exhausted failure
    #[error(transparent)]
    Agent(#[from] cadweave_agents::AgentError),

    /// Task graph operation failed
    #[error(transparent)]
    Graph(#[from] cadweave_graph::GraphError),

    /// State store or checkpointer failed
    #[error(transparent)]
    State(#[from] cadweave_state::StateError),

    /// JSON (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invariant violation; terminal for the pipeline
    #[error("Unrecoverable: {0}")]
    Unrecoverable(String),
}
