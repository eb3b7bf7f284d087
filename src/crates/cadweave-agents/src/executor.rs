//! Script executor contract and execution report types
//!
//! Script execution happens in an external sandbox; the core never trusts
//! or runs scripts itself. The executor returns a structured report that
//! feeds the validator's geometric score component.

use crate::error::Result;
use async_trait::async_trait;
use cadweave_graph::TaskId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// An artifact produced by script execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Opaque handle assigned by the executor
    pub id: String,
    /// Artifact name from the script's RESULT sentinel
    pub name: String,
    /// Artifact kind (e.g. "solid", "sketch")
    pub kind: String,
    /// Axis-aligned bounding box as (min_x, min_y, min_z, max_x, max_y, max_z)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounding_box: Option<[f64; 6]>,
    /// Enclosed volume for solids
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
}

/// Outcome of executing a batch of scripts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// Whether every script ran without error
    pub success: bool,
    /// Artifacts created, in creation order
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    /// All produced bodies are manifold
    pub is_manifold: bool,
    /// Any body has invalid faces
    pub has_invalid_faces: bool,
    /// Any body self-intersects
    pub has_self_intersections: bool,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Wall-clock execution time
    pub duration: Duration,
}

impl ExecutionReport {
    /// A clean report with the given artifacts
    pub fn success(artifacts: Vec<Artifact>, duration: Duration) -> Self {
        Self {
            success: true,
            artifacts,
            is_manifold: true,
            has_invalid_faces: false,
            has_self_intersections: false,
            errors: Vec::new(),
            warnings: Vec::new(),
            duration,
        }
    }

    /// A failed report carrying the given errors
    pub fn failure(errors: Vec<String>, duration: Duration) -> Self {
        Self {
            success: false,
            artifacts: Vec::new(),
            is_manifold: false,
            has_invalid_faces: false,
            has_self_intersections: false,
            errors,
            warnings: Vec::new(),
            duration,
        }
    }
}

/// Contract for the sandboxed CAD script executor
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    /// Execute the given scripts and report on the produced geometry
    ///
    /// A failed execution returns `Ok` with `success = false` and the
    /// errors listed; `Err` is reserved for executor-level failures
    /// (sandbox unreachable, timeout).
    async fn execute(
        &self,
        scripts: &BTreeMap<TaskId, String>,
        request_id: &str,
        timeout: Duration,
    ) -> Result<ExecutionReport>;
}
