//! Validation routing and failure classification
//!
//! Routing is a pure function from `(validation, iterations_remaining)` to
//! the next pipeline state, so the decision table can be tested without
//! driving the whole pipeline. Thresholds are half-open bands:
//!
//! ```text
//! score >= pass                 -> Completed
//! refine <= score < pass        -> Refining   (refinement enabled, budget left)
//! replan <= score < refine      -> Replanning (budget left)
//! otherwise                     -> Failed
//! ```

use cadweave_agents::{AgentError, ValidationResult};
use serde::{Deserialize, Serialize};

/// Score thresholds; invariant `replan <= refine <= pass`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Thresholds {
    pub pass: f64,
    pub refine: f64,
    pub replan: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            pass: 0.80,
            refine: 0.40,
            replan: 0.20,
        }
    }
}

/// Where the pipeline goes after a validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextState {
    Completed,
    Refining,
    Replanning,
    Failed,
}

/// Route a validation outcome
///
/// Pure: the decision depends only on the overall score, the remaining
/// iteration budget and the refinement switch. A non-passing score with
/// an exhausted budget always fails, regardless of band.
pub fn route(
    validation: &ValidationResult,
    iterations_remaining: u32,
    refinement_enabled: bool,
    thresholds: Thresholds,
) -> NextState {
    let score = validation.overall_score;
    if score >= thresholds.pass {
        return NextState::Completed;
    }
    if iterations_remaining == 0 {
        return NextState::Failed;
    }
    if score >= thresholds.refine && refinement_enabled {
        return NextState::Refining;
    }
    if score >= thresholds.replan && score < thresholds.refine {
        return NextState::Replanning;
    }
    NextState::Failed
}

/// Machine-readable reason for a terminal failure
pub fn failure_reason(validation: &ValidationResult, thresholds: Thresholds) -> &'static str {
    if validation.overall_score < thresholds.replan {
        "score_below_floor"
    } else {
        "budget_exceeded"
    }
}

/// Error taxonomy of the runtime, as kinds rather than types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Retriable provider/executor failure; retried inside the adapter
    TransientProvider,
    /// Agent output failed structural validation; retried with feedback
    StructuralInvalid,
    /// Validation score too low or task retries exhausted
    SemanticFailure,
    /// Iteration or time budget exhausted
    BudgetExceeded,
    /// User-requested cancellation
    Cancelled,
    /// Invariant violation; terminal and logged loudly
    Unrecoverable,
}

impl FailureKind {
    /// Stable snake_case name for reason fields
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::TransientProvider => "transient_provider",
            FailureKind::StructuralInvalid => "structural_invalid",
            FailureKind::SemanticFailure => "semantic_failure",
            FailureKind::BudgetExceeded => "budget_exceeded",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Unrecoverable => "unrecoverable",
        }
    }

    /// Classify a surfaced agent error
    pub fn classify(error: &AgentError) -> FailureKind {
        match error {
            AgentError::Cancelled => FailureKind::Cancelled,
            AgentError::Provider(_) => FailureKind::TransientProvider,
            AgentError::InvalidOutput(_) | AgentError::ScriptViolation { .. } => {
                FailureKind::StructuralInvalid
            }
            // Exhausted adapter failures are the surfaced form of
            // repeated structural/transient rejection
            AgentError::PlanningFailed { .. }
            | AgentError::GenerationFailed { .. }
            | AgentError::ValidationFailed { .. } => FailureKind::StructuralInvalid,
            AgentError::Graph(_) | AgentError::Serialization(_) => FailureKind::Unrecoverable,
        }
    }
}
