//! Task node types: operations, parameters, status lifecycle

use crate::error::{GraphError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Task identifier, unique within a graph
pub type TaskId = String;

/// The fixed vocabulary of CAD operations a task can perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Create a primitive solid (box, cylinder, sphere, cone, torus)
    CreatePrimitive,
    /// Boolean cut/fuse/common between two bodies
    BooleanOp,
    /// Translate, rotate, or scale a body
    Transform,
    /// Linear or polar pattern of a body
    Pattern,
    /// Fillet or chamfer on edges
    FilletChamfer,
    /// Extrude or revolve a sketch into a solid
    ExtrudeRevolve,
    /// Create a 2D sketch
    SketchCreate,
    /// Constrain an existing sketch
    SketchConstrain,
}

impl OperationKind {
    /// Stable snake_case name, matching the planner's JSON vocabulary
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::CreatePrimitive => "create_primitive",
            OperationKind::BooleanOp => "boolean_op",
            OperationKind::Transform => "transform",
            OperationKind::Pattern => "pattern",
            OperationKind::FilletChamfer => "fillet_chamfer",
            OperationKind::ExtrudeRevolve => "extrude_revolve",
            OperationKind::SketchCreate => "sketch_create",
            OperationKind::SketchConstrain => "sketch_constrain",
        }
    }
}

impl std::str::FromStr for OperationKind {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create_primitive" => Ok(OperationKind::CreatePrimitive),
            "boolean_op" => Ok(OperationKind::BooleanOp),
            "transform" => Ok(OperationKind::Transform),
            "pattern" => Ok(OperationKind::Pattern),
            "fillet_chamfer" => Ok(OperationKind::FilletChamfer),
            "extrude_revolve" => Ok(OperationKind::ExtrudeRevolve),
            "sketch_create" => Ok(OperationKind::SketchCreate),
            "sketch_constrain" => Ok(OperationKind::SketchConstrain),
            other => Err(GraphError::Validation(format!(
                "Unknown operation kind: {other}"
            ))),
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task parameter: either a scalar or a reference to another task's output
///
/// References appear in the planner's JSON as `{"task_ref": "task_1"}`;
/// scalars are plain JSON values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Reference to the artifact produced by another task
    TaskRef {
        task_ref: TaskId,
    },
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    /// The referenced task id, if this parameter is a task reference
    pub fn task_ref(&self) -> Option<&str> {
        match self {
            ParamValue::TaskRef { task_ref } => Some(task_ref),
            _ => None,
        }
    }
}

/// Task execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting on dependencies
    Pending,
    /// All dependencies completed; eligible for dispatch
    Ready,
    /// Currently executing
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an error; may be retried
    Failed,
    /// Cancelled before completion
    Cancelled,
}

impl TaskStatus {
    /// Whether the status is terminal for scheduling purposes
    ///
    /// `Failed` is not terminal here: the queue may reset a failed task to
    /// `Pending` for a retry until its attempt budget runs out.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    /// Whether `self -> next` is a legal lifecycle transition
    pub fn can_transition(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Cancelled)
                | (Ready, Running)
                | (Ready, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, Pending)
                | (Failed, Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A single node in the task graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNode {
    /// Unique task identifier within the graph
    pub id: TaskId,
    /// Operation this task performs
    pub operation: OperationKind,
    /// Human-readable description from the planner
    pub description: String,
    /// Operation parameters (scalars or task references)
    #[serde(default)]
    pub parameters: BTreeMap<String, ParamValue>,
    /// Current lifecycle status
    #[serde(default = "default_status")]
    pub status: TaskStatus,
    /// Artifact id produced on completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Ids of tasks this task depends on
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
}

fn default_status() -> TaskStatus {
    TaskStatus::Pending
}

impl TaskNode {
    /// Create a pending task with no parameters or dependencies
    pub fn new(id: impl Into<TaskId>, operation: OperationKind) -> Self {
        Self {
            id: id.into(),
            operation,
            description: String::new(),
            parameters: BTreeMap::new(),
            status: TaskStatus::Pending,
            result: None,
            dependencies: Vec::new(),
        }
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Add a parameter
    pub fn with_param(mut self, key: impl Into<String>, value: ParamValue) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Task ids referenced from parameters (e.g. boolean base/tool bodies)
    pub fn param_refs(&self) -> impl Iterator<Item = &str> {
        self.parameters.values().filter_map(|v| v.task_ref())
    }
}
