//! Generator adapter: task graph to per-task CAD scripts
//!
//! Produces one script per task. Every script must pass the static rules
//! in [`crate::script_rules`] before the batch is accepted; violations
//! are echoed back to the model and the attempt retried. During
//! refinement the current scripts and the validator's feedback ride
//! along in the prompt.

use crate::error::{AgentError, Result};
use crate::parse::extract_json_object;
use crate::provider::{ChatMessage, CompletionRequest, LanguageModel};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::script_rules;
use cadweave_graph::{TaskGraph, TaskId};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

const SYSTEM_PROMPT: &str = "\
You are an expert CAD script generator. For every task in the plan, write \
a short script in the CAD scripting language.

RULES:
1. Import only from `math` and the `cad` namespace (cad.primitives, \
cad.ops, cad.sketch). Never use exec, eval, dynamic imports, or any \
process/file/network primitives.
2. End every script with a sentinel comment naming the produced artifact: \
`# RESULT: <name>`.
3. Reference artifacts from dependency tasks by the names their scripts \
declared.

RESPONSE FORMAT: return ONLY a JSON object:
{\"scripts\": {\"<task id>\": \"<script text>\", ...}}";

#[derive(Debug, Deserialize)]
struct ScriptPayload {
    scripts: BTreeMap<TaskId, String>,
}

/// Agent that renders task graphs into executable scripts
pub struct GeneratorAgent {
    provider: Arc<dyn LanguageModel>,
    retry: RetryConfig,
    temperature: f32,
}

impl GeneratorAgent {
    /// Create a generator over the given provider
    pub fn new(provider: Arc<dyn LanguageModel>) -> Self {
        Self {
            provider,
            retry: RetryConfig::default(),
            temperature: 0.2,
        }
    }

    /// Override the retry strategy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Generate scripts for every task in the graph
    pub async fn generate(
        &self,
        request_id: &str,
        prompt: &str,
        graph: &TaskGraph,
        current_scripts: Option<&BTreeMap<TaskId, String>>,
        feedback: Option<&str>,
        cancel: &watch::Receiver<bool>,
    ) -> Result<BTreeMap<TaskId, String>> {
        let mut structural_feedback: Option<String> = None;
        let mut last_error = String::new();
        let attempts = self.retry.max_retries + 1;

        for attempt in 0..attempts {
            if *cancel.borrow() {
                return Err(AgentError::Cancelled);
            }

            let request = self.build_request(
                prompt,
                graph,
                current_scripts,
                feedback,
                structural_feedback.as_deref(),
            );
            let response = retry_with_backoff(&self.retry, "generator_completion", cancel, || {
                self.provider.complete(request.clone())
            })
            .await?;

            match self.parse_scripts(graph, &response.text) {
                Ok(scripts) => {
                    info!(
                        request_id,
                        scripts = scripts.len(),
                        attempt,
                        refining = current_scripts.is_some(),
                        "Generator produced scripts"
                    );
                    return Ok(scripts);
                }
                Err(e) => {
                    warn!(request_id, attempt, error = %e, "Generator output rejected");
                    last_error = e.to_string();
                    structural_feedback = Some(format!(
                        "Your previous response was rejected: {last_error}. \
                         Fix the violations and return the full JSON object again."
                    ));
                }
            }
        }

        Err(AgentError::GenerationFailed {
            attempts,
            last_error,
        })
    }

    fn build_request(
        &self,
        prompt: &str,
        graph: &TaskGraph,
        current_scripts: Option<&BTreeMap<TaskId, String>>,
        feedback: Option<&str>,
        structural_feedback: Option<&str>,
    ) -> CompletionRequest {
        let mut user = format!("DESIGN REQUEST:\n{prompt}\n\nTASK PLAN:\n");
        for task in graph.tasks() {
            user.push_str(&format!(
                "- {} [{}] {} deps={:?} params={}\n",
                task.id,
                task.operation,
                task.description,
                task.dependencies,
                serde_json::to_string(&task.parameters).unwrap_or_default(),
            ));
        }
        if let Some(scripts) = current_scripts {
            user.push_str("\nCURRENT SCRIPTS (revise where needed):\n");
            for (id, script) in scripts {
                user.push_str(&format!("--- {id} ---\n{script}\n"));
            }
        }
        if let Some(fb) = feedback {
            user.push_str(&format!("\nVALIDATION FEEDBACK:\n{fb}\n"));
        }
        if let Some(fb) = structural_feedback {
            user.push_str(&format!("\n{fb}\n"));
        }
        CompletionRequest::new(vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user)])
            .with_temperature(self.temperature)
    }

    fn parse_scripts(
        &self,
        graph: &TaskGraph,
        text: &str,
    ) -> Result<BTreeMap<TaskId, String>> {
        let json = extract_json_object(text)
            .ok_or_else(|| AgentError::InvalidOutput("no JSON object in response".into()))?;
        let payload: ScriptPayload = serde_json::from_str(&json)
            .map_err(|e| AgentError::InvalidOutput(format!("malformed scripts JSON: {e}")))?;

        for id in graph.task_ids() {
            if !payload.scripts.contains_key(id) {
                return Err(AgentError::InvalidOutput(format!(
                    "missing script for task '{id}'"
                )));
            }
        }

        for (task_id, script) in &payload.scripts {
            let violations = script_rules::validate_script(script);
            if !violations.is_empty() {
                return Err(AgentError::ScriptViolation {
                    task_id: task_id.clone(),
                    violations,
                });
            }
        }

        Ok(payload.scripts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{CompletionResponse, FinishReason};
    use async_trait::async_trait;
    use cadweave_graph::{OperationKind, TaskNode};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedModel {
        responses: Mutex<VecDeque<String>>,
        calls: Mutex<u32>,
    }

    impl ScriptedModel {
        fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().map(String::from).collect()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse> {
            *self.calls.lock().unwrap() += 1;
            let text = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| "{}".into());
            Ok(CompletionResponse {
                text,
                usage: None,
                finish_reason: FinishReason::Stop,
            })
        }
    }

    fn no_cancel() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        rx
    }

    fn one_task_graph() -> TaskGraph {
        let mut g = TaskGraph::new("req-1");
        g.add_task(
            TaskNode::new("t1", OperationKind::CreatePrimitive).with_description("base box"),
        )
        .unwrap();
        g
    }

    const GOOD_SCRIPTS: &str = r#"{"scripts": {"t1": "from cad.primitives import box\nbase = box(10.0, 10.0, 10.0)\n# RESULT: base\n"}}"#;

    #[tokio::test]
    async fn accepts_clean_scripts() {
        let model = Arc::new(ScriptedModel::new(vec![GOOD_SCRIPTS]));
        let generator = GeneratorAgent::new(model.clone());

        let scripts = generator
            .generate("req-1", "cube", &one_task_graph(), None, None, &no_cancel())
            .await
            .unwrap();
        assert_eq!(scripts.len(), 1);
        assert!(scripts["t1"].contains("# RESULT: base"));
    }

    #[tokio::test]
    async fn missing_task_script_is_rejected() {
        let missing = r#"{"scripts": {}}"#;
        let model = Arc::new(ScriptedModel::new(vec![missing, GOOD_SCRIPTS]));
        let generator = GeneratorAgent::new(model.clone())
            .with_retry(RetryConfig::new(1).with_initial_backoff(1).with_jitter(false));

        let scripts = generator
            .generate("req-1", "cube", &one_task_graph(), None, None, &no_cancel())
            .await
            .unwrap();
        assert_eq!(scripts.len(), 1);
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn forbidden_script_exhausts_to_generation_failed() {
        let evil =
            r#"{"scripts": {"t1": "import os\nos.system('x')\n# RESULT: base\n"}}"#;
        let model = Arc::new(ScriptedModel::new(vec![evil, evil]));
        let generator = GeneratorAgent::new(model.clone())
            .with_retry(RetryConfig::new(1).with_initial_backoff(1).with_jitter(false));

        let err = generator
            .generate("req-1", "cube", &one_task_graph(), None, None, &no_cancel())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::GenerationFailed { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn missing_sentinel_is_rejected() {
        let no_sentinel = r#"{"scripts": {"t1": "from cad.primitives import box\nbase = box(1.0, 1.0, 1.0)\n"}}"#;
        let model = Arc::new(ScriptedModel::new(vec![no_sentinel, GOOD_SCRIPTS]));
        let generator = GeneratorAgent::new(model.clone())
            .with_retry(RetryConfig::new(1).with_initial_backoff(1).with_jitter(false));

        let scripts = generator
            .generate("req-1", "cube", &one_task_graph(), None, None, &no_cancel())
            .await
            .unwrap();
        assert!(scripts["t1"].contains("RESULT"));
        assert_eq!(model.calls(), 2);
    }
}
