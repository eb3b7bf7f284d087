//! Error types for state storage and checkpointing

use thiserror::Error;

/// Result type for state operations
pub type Result<T> = std::result::Result<T, StateError>;

/// Errors raised by the state store, checkpointer and decision cache
#[derive(Debug, Error)]
pub enum StateError {
    /// Key not found in the store
    #[error("Key not found: {0}")]
    NotFound(String),

    /// Snapshot could not be serialized or deserialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The storage backend reported a failure
    #[error("Store error: {0}")]
    Store(String),

    /// Invalid argument or state
    #[error("Invalid: {0}")]
    Invalid(String),
}
