//! Agent adapters for cadweave
//!
//! Three thin adapters (planner, generator, validator) wrap an external
//! LLM provider behind fixed, typed contracts. Each adapter builds a
//! structured prompt, invokes the provider, parses the response into a
//! typed output, validates structural invariants, and retries with
//! exponential backoff on parse or validation failure. Only the final
//! exhausted failure surfaces to the pipeline.
//!
//! The provider itself ([`LanguageModel`]) and the CAD sandbox
//! ([`ScriptExecutor`]) are external collaborators: this crate defines
//! their contracts and nothing else about them.

pub mod error;
pub mod executor;
pub mod generator;
mod parse;
pub mod planner;
pub mod provider;
pub mod retry;
pub mod script_rules;
pub mod validator;

pub use error::{AgentError, Result};
pub use executor::{Artifact, ExecutionReport, ScriptExecutor};
pub use generator::GeneratorAgent;
pub use planner::PlannerAgent;
pub use provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LanguageModel, MessageRole,
    TokenUsage,
};
pub use retry::{classify_provider_error, ErrorClass, RetryConfig};
pub use validator::{ValidationResult, ValidatorAgent};
