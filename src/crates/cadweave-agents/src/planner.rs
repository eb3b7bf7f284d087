//! Planner adapter: natural-language prompt to task graph
//!
//! The planner decomposes a design prompt into the fixed CAD operation
//! vocabulary and returns a validated acyclic [`TaskGraph`]. Structural
//! failures (bad JSON, unknown operation, cycle) are echoed back to the
//! model as feedback and retried; only the exhausted failure surfaces as
//! [`AgentError::PlanningFailed`].

use crate::error::{AgentError, Result};
use crate::parse::extract_json_object;
use crate::provider::{ChatMessage, CompletionRequest, LanguageModel};
use crate::retry::{retry_with_backoff, RetryConfig};
use cadweave_graph::{ParamValue, TaskGraph, TaskNode};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

const SYSTEM_PROMPT: &str = "\
You are an expert CAD design planner. Decompose the design request into a \
task graph of primitive CAD operations.

AVAILABLE OPERATIONS:
- create_primitive: box/cylinder/sphere/cone/torus (params: kind plus dimensions)
- boolean_op: cut/fuse/common (params: op, base, tool as task references)
- transform: translate/rotate/scale (params: target task reference plus offsets)
- pattern: linear or polar array (params: target, count, spacing or angle)
- fillet_chamfer: round or bevel edges (params: target, radius or distance)
- extrude_revolve: turn a sketch into a solid (params: sketch task reference, distance or angle)
- sketch_create: create a 2D sketch (params: plane, shape parameters)
- sketch_constrain: constrain a sketch (params: sketch task reference, constraints)

Reference another task's output as {\"task_ref\": \"<task id>\"}.

RESPONSE FORMAT: return ONLY a JSON object:
{
  \"tasks\": [
    {\"id\": \"t1\", \"operation\": \"create_primitive\",
     \"description\": \"...\", \"parameters\": {\"kind\": \"box\", \"x\": 10.0, \"y\": 10.0, \"z\": 10.0}}
  ],
  \"dependencies\": [
    {\"from_task_id\": \"t1\", \"to_task_id\": \"t2\"}
  ]
}

RULES:
1. Dependencies must form a DAG; never create cycles.
2. Every task id must be unique; every reference must name an existing task.
3. Parameters are numbers, booleans, strings, or task references.";

#[derive(Debug, Deserialize)]
struct PlanPayload {
    tasks: Vec<PlannedTask>,
    #[serde(default)]
    dependencies: Vec<PlannedEdge>,
}

#[derive(Debug, Deserialize)]
struct PlannedTask {
    id: String,
    operation: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    parameters: BTreeMap<String, ParamValue>,
}

#[derive(Debug, Deserialize)]
struct PlannedEdge {
    from_task_id: String,
    to_task_id: String,
}

/// Agent that turns design prompts into task graphs
pub struct PlannerAgent {
    provider: Arc<dyn LanguageModel>,
    retry: RetryConfig,
    temperature: f32,
}

impl PlannerAgent {
    /// Create a planner over the given provider
    pub fn new(provider: Arc<dyn LanguageModel>) -> Self {
        Self {
            provider,
            retry: RetryConfig::default(),
            temperature: 0.3,
        }
    }

    /// Override the retry strategy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Decompose a prompt into a validated task graph
    ///
    /// `feedback` carries replan context (validation issues and
    /// suggestions from the previous iteration).
    pub async fn plan(
        &self,
        request_id: &str,
        prompt: &str,
        state_summary: &str,
        feedback: Option<&str>,
        cancel: &watch::Receiver<bool>,
    ) -> Result<TaskGraph> {
        let mut structural_feedback: Option<String> = None;
        let mut last_error = String::new();
        let attempts = self.retry.max_retries + 1;

        for attempt in 0..attempts {
            if *cancel.borrow() {
                return Err(AgentError::Cancelled);
            }

            let request = self.build_request(prompt, state_summary, feedback, structural_feedback.as_deref());
            let response = retry_with_backoff(&self.retry, "planner_completion", cancel, || {
                self.provider.complete(request.clone())
            })
            .await?;

            match self.parse_graph(request_id, &response.text) {
                Ok(graph) => {
                    info!(
                        request_id,
                        tasks = graph.len(),
                        edges = graph.edges().len(),
                        complexity = graph.complexity_score(),
                        attempt,
                        "Planner produced task graph"
                    );
                    return Ok(graph);
                }
                Err(e) => {
                    warn!(request_id, attempt, error = %e, "Planner output rejected");
                    last_error = e.to_string();
                    structural_feedback = Some(format!(
                        "Your previous response was rejected: {last_error}. \
                         Return only the JSON object described in the system prompt."
                    ));
                }
            }
        }

        Err(AgentError::PlanningFailed {
            attempts,
            last_error,
        })
    }

    fn build_request(
        &self,
        prompt: &str,
        state_summary: &str,
        feedback: Option<&str>,
        structural_feedback: Option<&str>,
    ) -> CompletionRequest {
        let mut user = format!("DESIGN REQUEST:\n{prompt}\n\nCURRENT STATE:\n{state_summary}");
        if let Some(fb) = feedback {
            user.push_str(&format!("\n\nVALIDATION FEEDBACK FROM LAST ITERATION:\n{fb}"));
        }
        if let Some(fb) = structural_feedback {
            user.push_str(&format!("\n\n{fb}"));
        }
        CompletionRequest::new(vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user)])
            .with_temperature(self.temperature)
    }

    fn parse_graph(&self, request_id: &str, text: &str) -> Result<TaskGraph> {
        let json = extract_json_object(text)
            .ok_or_else(|| AgentError::InvalidOutput("no JSON object in response".into()))?;
        let payload: PlanPayload = serde_json::from_str(&json)
            .map_err(|e| AgentError::InvalidOutput(format!("malformed plan JSON: {e}")))?;

        if payload.tasks.is_empty() {
            return Err(AgentError::InvalidOutput("plan contains no tasks".into()));
        }

        let mut graph = TaskGraph::new(request_id);
        for task in payload.tasks {
            let operation = task
                .operation
                .parse()
                .map_err(|e: cadweave_graph::GraphError| AgentError::InvalidOutput(e.to_string()))?;
            let mut node = TaskNode::new(task.id, operation).with_description(task.description);
            node.parameters = task.parameters;
            graph.add_task(node)?;
        }
        for edge in payload.dependencies {
            graph.add_dependency(&edge.from_task_id, &edge.to_task_id)?;
        }
        graph.validate()?;
        Ok(graph)
    }
}
