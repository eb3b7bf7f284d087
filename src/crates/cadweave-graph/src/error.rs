//! Error types for task graph operations

use thiserror::Error;

/// Result type for graph operations
pub type Result<T> = std::result::Result<T, GraphError>;

/// Errors raised by task graph construction and scheduling
#[derive(Debug, Error)]
pub enum GraphError {
    /// A task with the same id already exists in the graph
    #[error("Task id already exists: {0}")]
    DuplicateTask(String),

    /// A referenced task id does not exist
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Adding the edge would make the graph cyclic
    #[error("Dependency {from} -> {to} would create a cycle")]
    CycleDetected { from: String, to: String },

    /// The graph as a whole contains a cycle (no topological order exists)
    #[error("Task graph contains a cycle; no topological order exists")]
    NoTopologicalOrder,

    /// A status update violated the task lifecycle
    #[error("Invalid transition for task '{task}': {from} -> {to}")]
    InvalidTransition {
        task: String,
        from: String,
        to: String,
    },

    /// Structural validation failed
    #[error("Graph validation failed: {0}")]
    Validation(String),
}
