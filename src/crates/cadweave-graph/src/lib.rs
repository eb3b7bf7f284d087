//! Task DAG model for cadweave
//!
//! This crate defines the plan representation emitted by the planner agent:
//! a directed acyclic graph of CAD tasks with dependency edges, plus the
//! scheduling queries the pipeline runtime needs (ready frontier, layered
//! topological order, lifecycle-checked status updates).

pub mod error;
pub mod graph;
pub mod task;

pub use error::{GraphError, Result};
pub use graph::{TaskGraph, TopologicalLevels};
pub use task::{OperationKind, ParamValue, TaskId, TaskNode, TaskStatus};
