//! Error types for agent adapters

use thiserror::Error;

/// Result type for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors raised by the agent adapters and their collaborators
#[derive(Debug, Error)]
pub enum AgentError {
    /// The LLM provider or script executor reported a failure
    #[error("Provider error: {0}")]
    Provider(String),

    /// Agent output failed structural validation (bad JSON, missing
    /// fields, unknown operation, cycle)
    #[error("Invalid agent output: {0}")]
    InvalidOutput(String),

    /// A generated script violated the static safety rules
    #[error("Script for task '{task_id}' rejected: {}", violations.join("; "))]
    ScriptViolation {
        task_id: String,
        violations: Vec<String>,
    },

    /// Planner retries exhausted
    #[error("Planning failed after {attempts} attempts: {last_error}")]
    PlanningFailed { attempts: u32, last_error: String },

    /// Generator retries exhausted
    #[error("Generation failed after {attempts} attempts: {last_error}")]
    GenerationFailed { attempts: u32, last_error: String },

    /// Validator retries exhausted
    #[error("Validation failed after {attempts} attempts: {last_error}")]
    ValidationFailed { attempts: u32, last_error: String },

    /// The invocation was cancelled cooperatively
    #[error("Agent invocation cancelled")]
    Cancelled,

    /// Task graph construction from planner output failed
    #[error(transparent)]
    Graph(#[from] cadweave_graph::GraphError),

    /// JSON (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AgentError {
    /// Whether the error marks exhausted retries (surfaces to the pipeline)
    pub fn is_exhausted(&self) -> bool {
        matches!(
            self,
            AgentError::PlanningFailed { .. }
                | AgentError::GenerationFailed { .. }
                | AgentError::ValidationFailed { .. }
        )
    }
}
