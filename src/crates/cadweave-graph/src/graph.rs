//! Task graph container and scheduling queries
//!
//! A [`TaskGraph`] is the directed acyclic plan emitted by the planner. An
//! edge `u -> v` means *v depends on u*: u must complete before v becomes
//! eligible. The runtime schedules work layer by layer: every task in a
//! layer may run in parallel, and the next layer starts only once the whole
//! layer has terminated.
//!
//! ```rust
//! use cadweave_graph::{OperationKind, TaskGraph, TaskNode};
//!
//! let mut graph = TaskGraph::new("req-1");
//! graph.add_task(TaskNode::new("t1", OperationKind::CreatePrimitive)).unwrap();
//! graph.add_task(TaskNode::new("t2", OperationKind::CreatePrimitive)).unwrap();
//! graph.add_task(TaskNode::new("t3", OperationKind::BooleanOp)).unwrap();
//! graph.add_dependency("t1", "t3").unwrap();
//! graph.add_dependency("t2", "t3").unwrap();
//!
//! let levels = graph.topological_levels().unwrap();
//! assert_eq!(levels, vec![vec!["t1".to_string(), "t2".to_string()], vec!["t3".to_string()]]);
//! ```

use crate::error::{GraphError, Result};
use crate::task::{TaskId, TaskNode, TaskStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Tasks partitioned into parallel-safe layers, outermost first
pub type TopologicalLevels = Vec<Vec<TaskId>>;

/// A directed acyclic graph of CAD tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGraph {
    /// Graph id; equals the request id that produced it
    pub id: String,
    /// BTreeMap keeps serialization deterministic for digests
    tasks: BTreeMap<TaskId, TaskNode>,
    /// Dependency edges as (from, to): `to` depends on `from`
    edges: Vec<(TaskId, TaskId)>,
    /// Task ids in insertion order; used for stable tie-breaks
    insertion_order: Vec<TaskId>,
}

impl TaskGraph {
    /// Create an empty graph for a request
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tasks: BTreeMap::new(),
            edges: Vec::new(),
            insertion_order: Vec::new(),
        }
    }

    /// Number of tasks
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the graph has no tasks
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Dependency edges as (from, to) pairs
    pub fn edges(&self) -> &[(TaskId, TaskId)] {
        &self.edges
    }

    /// Look up a task by id
    pub fn task(&self, id: &str) -> Option<&TaskNode> {
        self.tasks.get(id)
    }

    /// Task ids in insertion order
    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId> {
        self.insertion_order.iter()
    }

    /// Tasks in insertion order
    pub fn tasks(&self) -> impl Iterator<Item = &TaskNode> {
        self.insertion_order.iter().filter_map(|id| self.tasks.get(id))
    }

    /// Add a task; fails if the id already exists
    pub fn add_task(&mut self, task: TaskNode) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(GraphError::DuplicateTask(task.id.clone()));
        }
        self.insertion_order.push(task.id.clone());
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    /// Add a dependency edge `from -> to` (`to` depends on `from`)
    ///
    /// Fails if either task is missing or if the edge would create a cycle.
    pub fn add_dependency(&mut self, from: &str, to: &str) -> Result<()> {
        if !self.tasks.contains_key(from) {
            return Err(GraphError::TaskNotFound(from.to_string()));
        }
        if !self.tasks.contains_key(to) {
            return Err(GraphError::TaskNotFound(to.to_string()));
        }
        if from == to || self.reaches(to, from) {
            return Err(GraphError::CycleDetected {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        self.edges.push((from.to_string(), to.to_string()));
        if let Some(node) = self.tasks.get_mut(to) {
            if !node.dependencies.iter().any(|d| d == from) {
                node.dependencies.push(from.to_string());
            }
        }
        Ok(())
    }

    /// Whether `target` is reachable from `start` along dependency edges
    fn reaches(&self, start: &str, target: &str) -> bool {
        let mut stack = vec![start.to_string()];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if !seen.insert(id.clone()) {
                continue;
            }
            for (from, to) in &self.edges {
                if from == &id {
                    stack.push(to.clone());
                }
            }
        }
        false
    }

    /// The frontier: pending tasks whose dependencies have all completed
    pub fn ready_tasks(&self) -> Vec<&TaskNode> {
        self.tasks()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| {
                t.dependencies.iter().all(|dep| {
                    self.tasks
                        .get(dep)
                        .map(|d| d.status == TaskStatus::Completed)
                        .unwrap_or(false)
                })
            })
            .collect()
    }

    /// Partition tasks into layers via Kahn's algorithm
    ///
    /// Layer i depends only on layers 0..i. Within a layer, tasks keep
    /// insertion order. Returns an error when the graph contains a cycle
    /// (the produced order covers fewer tasks than exist).
    pub fn topological_levels(&self) -> Result<TopologicalLevels> {
        let mut in_degree: HashMap<&str, usize> = self
            .insertion_order
            .iter()
            .map(|id| (id.as_str(), 0))
            .collect();
        for (_, to) in &self.edges {
            if let Some(d) = in_degree.get_mut(to.as_str()) {
                *d += 1;
            }
        }

        let mut frontier: VecDeque<&str> = self
            .insertion_order
            .iter()
            .filter(|id| in_degree.get(id.as_str()) == Some(&0))
            .map(|id| id.as_str())
            .collect();

        let mut levels: TopologicalLevels = Vec::new();
        let mut visited = 0usize;

        while !frontier.is_empty() {
            let layer: Vec<TaskId> = frontier.iter().map(|id| id.to_string()).collect();
            visited += layer.len();

            let mut next: Vec<&str> = Vec::new();
            for id in frontier.drain(..) {
                for (from, to) in &self.edges {
                    if from == id {
                        let d = in_degree
                            .get_mut(to.as_str())
                            .expect("edge endpoints are validated on insert");
                        *d -= 1;
                        if *d == 0 {
                            next.push(to.as_str());
                        }
                    }
                }
            }
            // Restore insertion order for the next layer
            next.sort_by_key(|id| {
                self.insertion_order
                    .iter()
                    .position(|x| x == id)
                    .unwrap_or(usize::MAX)
            });
            frontier.extend(next);
            levels.push(layer);
        }

        if visited < self.tasks.len() {
            return Err(GraphError::NoTopologicalOrder);
        }
        Ok(levels)
    }

    /// A full topological order (layers flattened)
    pub fn topological_order(&self) -> Result<Vec<TaskId>> {
        Ok(self.topological_levels()?.into_iter().flatten().collect())
    }

    /// Atomically update a task's status, enforcing the lifecycle
    pub fn mark(
        &mut self,
        task_id: &str,
        status: TaskStatus,
        result: Option<String>,
    ) -> Result<()> {
        let node = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| GraphError::TaskNotFound(task_id.to_string()))?;
        if !node.status.can_transition(status) {
            return Err(GraphError::InvalidTransition {
                task: task_id.to_string(),
                from: node.status.to_string(),
                to: status.to_string(),
            });
        }
        tracing::debug!(task = task_id, from = %node.status, to = %status, "Task status change");
        node.status = status;
        if result.is_some() {
            node.result = result;
        }
        Ok(())
    }

    /// Reset every task to pending and clear results
    ///
    /// Used when a refinement round re-executes the graph with
    /// regenerated scripts; bypasses the per-task lifecycle because the
    /// whole round starts over.
    pub fn reset(&mut self) {
        for node in self.tasks.values_mut() {
            node.status = TaskStatus::Pending;
            node.result = None;
        }
    }

    /// Structural validation: edge endpoints and parameter references
    /// exist, and the graph is acyclic
    pub fn validate(&self) -> Result<()> {
        for (from, to) in &self.edges {
            if !self.tasks.contains_key(from) {
                return Err(GraphError::Validation(format!(
                    "Edge references missing task '{from}'"
                )));
            }
            if !self.tasks.contains_key(to) {
                return Err(GraphError::Validation(format!(
                    "Edge references missing task '{to}'"
                )));
            }
        }
        for task in self.tasks.values() {
            for r in task.param_refs() {
                if !self.tasks.contains_key(r) {
                    return Err(GraphError::Validation(format!(
                        "Task '{}' references missing task '{}' in parameters",
                        task.id, r
                    )));
                }
            }
        }
        self.topological_levels()?;
        Ok(())
    }

    /// Plan complexity in [0, 1], from task count, edge count and depth
    pub fn complexity_score(&self) -> f64 {
        let depth = self.topological_levels().map(|l| l.len()).unwrap_or(0);
        let raw = 0.1 * self.tasks.len() as f64
            + 0.05 * self.edges.len() as f64
            + 0.15 * depth as f64;
        raw.min(1.0)
    }

    /// Whether every task reached a terminal or failed state
    pub fn all_terminated(&self) -> bool {
        self.tasks
            .values()
            .all(|t| t.status.is_terminal() || t.status == TaskStatus::Failed)
    }

    /// Whether every task completed successfully
    pub fn all_completed(&self) -> bool {
        self.tasks.values().all(|t| t.status == TaskStatus::Completed)
    }
}
