//! End-to-end pipeline scenarios driven through the orchestrator

mod common;

use cadweave_orchestrator::{
    CoreConfig, Orchestrator, PipelineEvent, PipelineStatus, RequestOptions, GLOBAL_TOPIC,
};
use cadweave_state::InMemoryStateStore;
use common::{
    review, MockExecutor, MockProvider, CUBE_PLAN, CUBE_SCRIPTS, DIAMOND_PLAN, DIAMOND_SCRIPTS,
};
use futures::StreamExt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const AWAIT: Duration = Duration::from_secs(30);

fn orchestrator(
    config: CoreConfig,
    provider: Arc<MockProvider>,
    executor: Arc<MockExecutor>,
) -> Orchestrator {
    common::init_tracing();
    Orchestrator::new(
        config,
        provider,
        Some(executor as Arc<dyn cadweave_agents::ScriptExecutor>),
        Arc::new(InMemoryStateStore::new()),
    )
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_a_single_task_success_no_refinement() {
    let provider = MockProvider::new(vec![CUBE_PLAN], vec![CUBE_SCRIPTS], vec![review(0.95)]);
    let executor = MockExecutor::new(Duration::from_millis(10));
    let orch = orchestrator(CoreConfig::default(), provider.clone(), executor.clone());

    let id = orch
        .submit_request(
            "session-a",
            "Create a cube 10x10x10",
            RequestOptions {
                max_iterations: Some(3),
                enable_execution: Some(true),
            },
        )
        .unwrap();
    let state = orch.await_result(&id, AWAIT).await.unwrap();

    assert_eq!(state.status, PipelineStatus::Completed);
    assert_eq!(state.current_iteration, 1);
    assert_eq!(
        state.node_names(),
        vec!["planning", "generating", "executing", "validating"]
    );
    assert!(state.reason.is_none());
    assert_eq!(provider.planner_calls.load(Ordering::SeqCst), 1);
    assert_eq!(provider.generator_calls.load(Ordering::SeqCst), 1);
    assert_eq!(provider.validator_calls.load(Ordering::SeqCst), 1);
    assert_eq!(executor.spans().len(), 1);
    assert_eq!(state.artifacts.len(), 1);

    // Node history is strictly monotonic
    for pair in state.node_history.windows(2) {
        assert!(pair[0].started_at <= pair[1].started_at);
    }
    orch.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_b_one_refinement_then_pass() {
    // First review drags the overall into the refine band; second passes
    let provider = MockProvider::new(
        vec![CUBE_PLAN],
        vec![CUBE_SCRIPTS],
        vec![review(0.0), review(0.95)],
    );
    let executor = MockExecutor::new(Duration::from_millis(5));
    let orch = orchestrator(CoreConfig::default(), provider.clone(), executor.clone());

    let id = orch
        .submit_request(
            "session-b",
            "Create a cube 10x10x10",
            RequestOptions {
                max_iterations: Some(3),
                enable_execution: Some(true),
            },
        )
        .unwrap();
    let state = orch.await_result(&id, AWAIT).await.unwrap();

    assert_eq!(state.status, PipelineStatus::Completed);
    assert_eq!(state.current_iteration, 2);
    let generating_entries = state
        .node_names()
        .iter()
        .filter(|n| **n == "generating")
        .count();
    assert_eq!(generating_entries, 2);
    assert!(state.node_names().contains(&"refining"));
    // Planner is called once: a refinement is not a replan
    assert_eq!(provider.planner_calls.load(Ordering::SeqCst), 1);
    assert_eq!(provider.generator_calls.load(Ordering::SeqCst), 2);
    assert_eq!(provider.validator_calls.load(Ordering::SeqCst), 2);
    orch.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_c_replan_after_low_score() {
    // With a clean execution the geometric and semantic components floor
    // the overall at 0.7; thresholds are raised so the first pass lands
    // in the replan band and the second passes.
    let config = CoreConfig::default().with_thresholds(0.90, 0.75, 0.60);
    let provider = MockProvider::new(
        vec![CUBE_PLAN],
        vec![CUBE_SCRIPTS],
        vec![review(0.0), review(0.95)],
    );
    let executor = MockExecutor::new(Duration::from_millis(5));
    let orch = orchestrator(config, provider.clone(), executor.clone());

    let id = orch
        .submit_request(
            "session-c",
            "Create a cube 10x10x10",
            RequestOptions {
                max_iterations: Some(3),
                enable_execution: Some(true),
            },
        )
        .unwrap();
    let state = orch.await_result(&id, AWAIT).await.unwrap();

    assert_eq!(state.status, PipelineStatus::Completed);
    assert_eq!(state.current_iteration, 2);
    // Replanning invokes the planner again with feedback
    assert_eq!(provider.planner_calls.load(Ordering::SeqCst), 2);
    let planning_entries = state
        .node_names()
        .iter()
        .filter(|n| **n == "planning")
        .count();
    assert_eq!(planning_entries, 2);
    assert!(!state.node_names().contains(&"refining"));
    orch.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_d_budget_exhaustion_fails() {
    // Every validation lands in the refine band; with max_iterations=2
    // the second non-passing validation exhausts the budget.
    let provider = MockProvider::new(vec![CUBE_PLAN], vec![CUBE_SCRIPTS], vec![review(0.0)]);
    let executor = MockExecutor::new(Duration::from_millis(5));
    let orch = orchestrator(CoreConfig::default(), provider.clone(), executor.clone());

    let id = orch
        .submit_request(
            "session-d",
            "Create a cube 10x10x10",
            RequestOptions {
                max_iterations: Some(2),
                enable_execution: Some(true),
            },
        )
        .unwrap();
    let state = orch.await_result(&id, AWAIT).await.unwrap();

    assert_eq!(state.status, PipelineStatus::Failed);
    assert_eq!(state.reason.as_deref(), Some("budget_exceeded"));
    assert_eq!(state.current_iteration, 2);
    assert!(state.current_iteration <= state.max_iterations);
    assert_eq!(provider.validator_calls.load(Ordering::SeqCst), 2);
    orch.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_e_dependency_ordering_across_layers() {
    let provider = MockProvider::new(
        vec![DIAMOND_PLAN],
        vec![DIAMOND_SCRIPTS],
        vec![review(0.95)],
    );
    let executor = MockExecutor::new(Duration::from_millis(50));
    let config = CoreConfig::default().with_worker_concurrency(2);
    let orch = orchestrator(config, provider.clone(), executor.clone());

    let id = orch
        .submit_request(
            "session-e",
            "Create a cube with a hole",
            RequestOptions {
                max_iterations: Some(3),
                enable_execution: Some(true),
            },
        )
        .unwrap();
    let state = orch.await_result(&id, AWAIT).await.unwrap();

    assert_eq!(state.status, PipelineStatus::Completed);
    assert_eq!(executor.spans().len(), 3);

    let t1 = executor.span_of("t1");
    let t2 = executor.span_of("t2");
    let t3 = executor.span_of("t3");
    // The boolean starts only after both inputs have terminated
    assert!(t3.started >= t1.ended, "t3 started before t1 ended");
    assert!(t3.started >= t2.ended, "t3 started before t2 ended");
    orch.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_f_cancellation_before_execution() {
    let provider = MockProvider::new(vec![CUBE_PLAN], vec![CUBE_SCRIPTS], vec![review(0.95)]);
    let gate = Arc::new(Notify::new());
    *provider.generator_block.lock().unwrap() = Some(Arc::clone(&gate));
    let executor = MockExecutor::new(Duration::from_millis(5));
    let orch = orchestrator(CoreConfig::default(), provider.clone(), executor.clone());

    let id = orch
        .submit_request("session-f", "Create a cube 10x10x10", RequestOptions::default())
        .unwrap();

    // Wait until the pipeline is inside Generating, then cancel
    for _ in 0..100 {
        if provider.generator_calls.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(orch.cancel(&id));
    gate.notify_one();

    let state = orch.await_result(&id, AWAIT).await.unwrap();
    assert_eq!(state.status, PipelineStatus::Cancelled);
    assert_eq!(state.reason.as_deref(), Some("cancelled"));
    assert!(!state.node_names().contains(&"executing"));
    assert!(!state.node_names().contains(&"validating"));
    assert!(executor.spans().is_empty());
    // Cancelling a terminal request is a no-op
    assert!(!orch.cancel(&id));
    orch.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn identical_resubmission_hits_the_decision_cache() {
    let provider = MockProvider::new(vec![CUBE_PLAN], vec![CUBE_SCRIPTS], vec![review(1.0)]);
    let executor = MockExecutor::new(Duration::from_millis(5));
    let orch = orchestrator(CoreConfig::default(), provider.clone(), executor.clone());

    let options = RequestOptions {
        max_iterations: Some(3),
        enable_execution: Some(false),
    };
    let first = orch
        .submit_request("session-cache", "Create a cube 10x10x10", options.clone())
        .unwrap();
    let state = orch.await_result(&first, AWAIT).await.unwrap();
    assert_eq!(state.status, PipelineStatus::Completed);
    assert_eq!(provider.planner_calls.load(Ordering::SeqCst), 1);

    let second = orch
        .submit_request("session-cache", "Create a cube 10x10x10", options)
        .unwrap();
    let state = orch.await_result(&second, AWAIT).await.unwrap();
    assert_eq!(state.status, PipelineStatus::Completed);

    // Every agent role was served from cache on the second run
    assert_eq!(provider.planner_calls.load(Ordering::SeqCst), 1);
    assert_eq!(provider.generator_calls.load(Ordering::SeqCst), 1);
    assert_eq!(provider.validator_calls.load(Ordering::SeqCst), 1);
    let metrics = orch.metrics();
    assert!(metrics.decision_cache.hits >= 3, "{:?}", metrics.decision_cache);
    orch.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_pipeline_per_session_at_a_time() {
    let provider = MockProvider::new(vec![CUBE_PLAN], vec![CUBE_SCRIPTS], vec![review(0.95)]);
    let gate = Arc::new(Notify::new());
    *provider.generator_block.lock().unwrap() = Some(Arc::clone(&gate));
    let executor = MockExecutor::new(Duration::from_millis(5));
    let orch = orchestrator(CoreConfig::default(), provider.clone(), executor.clone());

    let first = orch
        .submit_request("session-busy", "Create a cube", RequestOptions::default())
        .unwrap();
    let err = orch.submit_request("session-busy", "Create a sphere", RequestOptions::default());
    assert!(err.is_err());

    gate.notify_one();
    orch.await_result(&first, AWAIT).await.unwrap();
    // The slot frees after the terminal state
    let again = orch.submit_request("session-busy", "Create a cube", RequestOptions::default());
    assert!(again.is_ok());
    gate.notify_one();
    orch.await_result(&again.unwrap(), AWAIT).await.unwrap();
    orch.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn terminal_events_and_checkpoints_are_published() {
    let provider = MockProvider::new(vec![CUBE_PLAN], vec![CUBE_SCRIPTS], vec![review(0.95)]);
    let executor = MockExecutor::new(Duration::from_millis(5));
    let orch = orchestrator(CoreConfig::default(), provider.clone(), executor.clone());

    let mut events = orch.subscribe(GLOBAL_TOPIC);
    let id = orch
        .submit_request("session-ev", "Create a cube 10x10x10", RequestOptions::default())
        .unwrap();
    let state = orch.await_result(&id, AWAIT).await.unwrap();
    assert_eq!(state.status, PipelineStatus::Completed);

    let mut kinds = Vec::new();
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(200), events.next()).await
    {
        kinds.push(event.kind());
        if matches!(event, PipelineEvent::PipelineTerminal { .. }) {
            break;
        }
    }
    for expected in [
        "node_entered",
        "task_started",
        "task_completed",
        "validation_scored",
        "state_checkpoint",
        "pipeline_terminal",
    ] {
        assert!(kinds.contains(&expected), "missing {expected} in {kinds:?}");
    }

    // The terminal checkpoint is durable and readable
    let latest = orch.checkpointer().latest("session-ev").await.unwrap();
    let (record, snapshot) = latest.unwrap();
    assert_eq!(record.name, "terminal");
    assert_eq!(snapshot.object_count(), 1);
    orch.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn global_cap_queues_submissions_fifo() {
    let provider = MockProvider::new(vec![CUBE_PLAN], vec![CUBE_SCRIPTS], vec![review(0.95)]);
    let executor = MockExecutor::new(Duration::from_millis(20));
    let config = CoreConfig::default().with_max_concurrent_requests(1);
    let orch = orchestrator(config, provider.clone(), executor.clone());

    let a = orch
        .submit_request("cap-1", "Create a cube", RequestOptions::default())
        .unwrap();
    let b = orch
        .submit_request("cap-2", "Create a cube", RequestOptions::default())
        .unwrap();

    let state_a = orch.await_result(&a, AWAIT).await.unwrap();
    let state_b = orch.await_result(&b, AWAIT).await.unwrap();
    assert_eq!(state_a.status, PipelineStatus::Completed);
    assert_eq!(state_b.status, PipelineStatus::Completed);

    let metrics = orch.metrics();
    assert_eq!(metrics.requests_submitted, 2);
    assert_eq!(metrics.requests_completed, 2);
    assert_eq!(metrics.active_requests, 0);
    orch.shutdown().await;
}
