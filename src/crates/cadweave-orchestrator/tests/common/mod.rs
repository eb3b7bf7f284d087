//! Shared mocks for orchestrator integration tests

use async_trait::async_trait;
use cadweave_agents::{
    Artifact, CompletionRequest, CompletionResponse, ExecutionReport, FinishReason, LanguageModel,
    ScriptExecutor,
};
use cadweave_graph::TaskId;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Scripted provider that routes calls by adapter role
///
/// The role is recognized from the system prompt. Each role has its own
/// response queue; when a queue is down to its last entry, that entry is
/// repeated for subsequent calls.
pub struct MockProvider {
    plans: Mutex<VecDeque<String>>,
    scripts: Mutex<VecDeque<String>>,
    reviews: Mutex<VecDeque<String>>,
    pub planner_calls: AtomicU32,
    pub generator_calls: AtomicU32,
    pub validator_calls: AtomicU32,
    /// When set, generator calls block until notified
    pub generator_block: Mutex<Option<Arc<Notify>>>,
}

impl MockProvider {
    pub fn new<P, S, R>(plans: Vec<P>, scripts: Vec<S>, reviews: Vec<R>) -> Arc<Self>
    where
        P: Into<String>,
        S: Into<String>,
        R: Into<String>,
    {
        Arc::new(Self {
            plans: Mutex::new(plans.into_iter().map(Into::into).collect()),
            scripts: Mutex::new(scripts.into_iter().map(Into::into).collect()),
            reviews: Mutex::new(reviews.into_iter().map(Into::into).collect()),
            planner_calls: AtomicU32::new(0),
            generator_calls: AtomicU32::new(0),
            validator_calls: AtomicU32::new(0),
            generator_block: Mutex::new(None),
        })
    }

    fn next(queue: &Mutex<VecDeque<String>>) -> String {
        let mut q = queue.lock().unwrap();
        if q.len() > 1 {
            q.pop_front().unwrap()
        } else {
            q.front().cloned().unwrap_or_else(|| "{}".into())
        }
    }
}

#[async_trait]
impl LanguageModel for MockProvider {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> cadweave_agents::Result<CompletionResponse> {
        let system = request
            .messages
            .first()
            .map(|m| m.content.clone())
            .unwrap_or_default();

        let text = if system.contains("design planner") {
            self.planner_calls.fetch_add(1, Ordering::SeqCst);
            Self::next(&self.plans)
        } else if system.contains("script generator") {
            self.generator_calls.fetch_add(1, Ordering::SeqCst);
            let gate = self.generator_block.lock().unwrap().clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            Self::next(&self.scripts)
        } else if system.contains("design reviewer") {
            self.validator_calls.fetch_add(1, Ordering::SeqCst);
            Self::next(&self.reviews)
        } else {
            panic!("unrecognized system prompt: {system}");
        };

        Ok(CompletionResponse {
            text,
            usage: None,
            finish_reason: FinishReason::Stop,
        })
    }
}

/// Span of one recorded execution call
#[derive(Debug, Clone)]
pub struct ExecutionSpan {
    pub task_id: String,
    pub started: Instant,
    pub ended: Instant,
}

/// Executor that records call spans and fabricates clean geometry
pub struct MockExecutor {
    pub spans: Mutex<Vec<ExecutionSpan>>,
    delay: Duration,
}

impl MockExecutor {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            spans: Mutex::new(Vec::new()),
            delay,
        })
    }

    pub fn spans(&self) -> Vec<ExecutionSpan> {
        self.spans.lock().unwrap().clone()
    }

    pub fn span_of(&self, task_id: &str) -> ExecutionSpan {
        self.spans()
            .into_iter()
            .find(|s| s.task_id == task_id)
            .unwrap_or_else(|| panic!("no execution span for {task_id}"))
    }
}

#[async_trait]
impl ScriptExecutor for MockExecutor {
    async fn execute(
        &self,
        scripts: &BTreeMap<TaskId, String>,
        _request_id: &str,
        _timeout: Duration,
    ) -> cadweave_agents::Result<ExecutionReport> {
        let task_id = scripts.keys().next().cloned().unwrap_or_default();
        let started = Instant::now();
        tokio::time::sleep(self.delay).await;
        let ended = Instant::now();
        self.spans.lock().unwrap().push(ExecutionSpan {
            task_id: task_id.clone(),
            started,
            ended,
        });

        // Fixed duration keeps the report digest deterministic
        Ok(ExecutionReport::success(
            vec![Artifact {
                id: format!("artifact_{task_id}"),
                name: format!("body_{task_id}"),
                kind: "solid".into(),
                bounding_box: Some([0.0, 0.0, 0.0, 10.0, 10.0, 10.0]),
                volume: Some(1000.0),
            }],
            Duration::from_millis(10),
        ))
    }
}

/// One-task plan: a 10x10x10 box
pub const CUBE_PLAN: &str = r#"{
    "tasks": [
        {"id": "t1", "operation": "create_primitive",
         "description": "Create base cube 10x10x10",
         "parameters": {"kind": "box", "x": 10.0, "y": 10.0, "z": 10.0}}
    ],
    "dependencies": []
}"#;

pub const CUBE_SCRIPTS: &str = r#"{"scripts": {"t1": "from cad.primitives import box\nbase = box(10.0, 10.0, 10.0)\n# RESULT: base\n"}}"#;

/// Diamond plan: t1 and t2 feed the boolean t3
pub const DIAMOND_PLAN: &str = r#"{
    "tasks": [
        {"id": "t1", "operation": "create_primitive",
         "description": "Create base cube",
         "parameters": {"kind": "box", "x": 10.0, "y": 10.0, "z": 10.0}},
        {"id": "t2", "operation": "create_primitive",
         "description": "Create hole cylinder",
         "parameters": {"kind": "cylinder", "radius": 1.0, "height": 12.0}},
        {"id": "t3", "operation": "boolean_op",
         "description": "Cut the hole",
         "parameters": {"op": "cut", "base": {"task_ref": "t1"}, "tool": {"task_ref": "t2"}}}
    ],
    "dependencies": [
        {"from_task_id": "t1", "to_task_id": "t3"},
        {"from_task_id": "t2", "to_task_id": "t3"}
    ]
}"#;

pub const DIAMOND_SCRIPTS: &str = r#"{"scripts": {
    "t1": "from cad.primitives import box\nbase = box(10.0, 10.0, 10.0)\n# RESULT: base\n",
    "t2": "from cad.primitives import cylinder\nhole = cylinder(1.0, 12.0)\n# RESULT: hole\n",
    "t3": "from cad.ops import cut\nresult = cut(base, hole)\n# RESULT: result\n"
}}"#;

pub fn review(score: f64) -> String {
    format!(r#"{{"score": {score}, "issues": ["needs work"], "suggestions": ["refine dimensions"]}}"#)
}

/// Install the test-output subscriber once per process
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
