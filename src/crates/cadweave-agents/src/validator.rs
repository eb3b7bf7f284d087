//! Validator adapter: scoring of generated designs
//!
//! The overall score blends three components:
//!
//! - geometric (weight 0.4, only when an execution report is present):
//!   manifoldness, face validity, self-intersection, body count vs plan
//! - semantic (weight 0.3): operations the prompt asks for actually
//!   appear in the plan and scripts
//! - LLM review (weight 0.3, or 0.5 without a report): model-rated
//!   quality in [0, 1]
//!
//! Weights renormalize to sum to 1. The execution report is an input to
//! the score, never a gate: a failed execution with a passing overall
//! score still passes.

use crate::error::{AgentError, Result};
use crate::executor::ExecutionReport;
use crate::parse::extract_json_object;
use crate::provider::{ChatMessage, CompletionRequest, LanguageModel};
use crate::retry::{retry_with_backoff, RetryConfig};
use cadweave_graph::{OperationKind, TaskGraph, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

const SYSTEM_PROMPT: &str = "\
You are an expert CAD design reviewer. Assess whether the generated \
scripts faithfully realize the design request.

Consider: completeness against the request, correct use of dependencies, \
dimensional plausibility, and any execution problems reported.

RESPONSE FORMAT: return ONLY a JSON object:
{\"score\": <0.0 to 1.0>, \"issues\": [\"...\"], \"suggestions\": [\"...\"]}";

/// Outcome of validating one pipeline iteration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Blended score in [0, 1]
    pub overall_score: f64,
    /// Per-component scores (geometric, semantic, llm_review)
    pub dimensional_scores: BTreeMap<String, f64>,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
    /// `overall_score >= pass_threshold`
    pub is_valid: bool,
    /// `refine_threshold <= overall_score < pass_threshold`
    pub should_refine: bool,
}

impl ValidationResult {
    /// Build a result from a bare overall score and thresholds
    pub fn from_score(overall: f64, pass_threshold: f64, refine_threshold: f64) -> Self {
        Self {
            overall_score: overall,
            dimensional_scores: BTreeMap::new(),
            issues: Vec::new(),
            suggestions: Vec::new(),
            is_valid: overall >= pass_threshold,
            should_refine: overall >= refine_threshold && overall < pass_threshold,
        }
    }

    /// Issues and suggestions as feedback text for the next iteration
    pub fn feedback_text(&self) -> String {
        let mut out = String::new();
        if !self.issues.is_empty() {
            out.push_str("Issues:\n");
            for issue in &self.issues {
                out.push_str(&format!("- {issue}\n"));
            }
        }
        if !self.suggestions.is_empty() {
            out.push_str("Suggestions:\n");
            for s in &self.suggestions {
                out.push_str(&format!("- {s}\n"));
            }
        }
        out
    }
}

#[derive(Debug, Deserialize)]
struct ReviewPayload {
    score: f64,
    #[serde(default)]
    issues: Vec<String>,
    #[serde(default)]
    suggestions: Vec<String>,
}

/// Agent that scores generated designs
pub struct ValidatorAgent {
    provider: Arc<dyn LanguageModel>,
    retry: RetryConfig,
    temperature: f32,
    pass_threshold: f64,
    refine_threshold: f64,
}

impl ValidatorAgent {
    /// Create a validator over the given provider
    pub fn new(provider: Arc<dyn LanguageModel>) -> Self {
        Self {
            provider,
            retry: RetryConfig::default(),
            temperature: 0.3,
            pass_threshold: 0.80,
            refine_threshold: 0.40,
        }
    }

    /// Override the retry strategy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Override the pass/refine thresholds
    pub fn with_thresholds(mut self, pass: f64, refine: f64) -> Self {
        self.pass_threshold = pass;
        self.refine_threshold = refine;
        self
    }

    /// Score a generated design
    pub async fn validate(
        &self,
        request_id: &str,
        prompt: &str,
        graph: &TaskGraph,
        scripts: &BTreeMap<TaskId, String>,
        report: Option<&ExecutionReport>,
        cancel: &watch::Receiver<bool>,
    ) -> Result<ValidationResult> {
        let mut issues = Vec::new();

        let geometric = report.map(|r| geometric_score(r, scripts, &mut issues));
        let semantic = semantic_score(prompt, graph, scripts);
        let review = self.llm_review(prompt, graph, scripts, report, cancel).await?;

        let mut weighted = vec![("semantic", semantic, 0.3), ("llm_review", review.score, 0.3)];
        if let Some(g) = geometric {
            weighted.push(("geometric", g, 0.4));
        }
        let total_weight: f64 = weighted.iter().map(|(_, _, w)| w).sum();
        let overall: f64 = weighted
            .iter()
            .map(|(_, s, w)| s * w / total_weight)
            .sum::<f64>()
            .clamp(0.0, 1.0);

        let dimensional_scores: BTreeMap<String, f64> = weighted
            .iter()
            .map(|(name, score, _)| (name.to_string(), *score))
            .collect();

        issues.extend(review.issues);

        let result = ValidationResult {
            overall_score: overall,
            dimensional_scores,
            issues,
            suggestions: review.suggestions,
            is_valid: overall >= self.pass_threshold,
            should_refine: overall >= self.refine_threshold && overall < self.pass_threshold,
        };

        info!(
            request_id,
            score = result.overall_score,
            is_valid = result.is_valid,
            should_refine = result.should_refine,
            "Validation scored"
        );
        Ok(result)
    }

    async fn llm_review(
        &self,
        prompt: &str,
        graph: &TaskGraph,
        scripts: &BTreeMap<TaskId, String>,
        report: Option<&ExecutionReport>,
        cancel: &watch::Receiver<bool>,
    ) -> Result<ReviewPayload> {
        let mut user = format!("DESIGN REQUEST:\n{prompt}\n\nPLAN:\n");
        for task in graph.tasks() {
            user.push_str(&format!("- {} [{}] {}\n", task.id, task.operation, task.description));
        }
        user.push_str("\nSCRIPTS:\n");
        for (id, script) in scripts {
            user.push_str(&format!("--- {id} ---\n{script}\n"));
        }
        if let Some(r) = report {
            user.push_str(&format!(
                "\nEXECUTION REPORT: success={} artifacts={} manifold={} errors={:?}\n",
                r.success,
                r.artifacts.len(),
                r.is_manifold,
                r.errors
            ));
        }
        let request =
            CompletionRequest::new(vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user)])
                .with_temperature(self.temperature);

        let mut last_error = String::new();
        let attempts = self.retry.max_retries + 1;
        for attempt in 0..attempts {
            if *cancel.borrow() {
                return Err(AgentError::Cancelled);
            }
            let response = retry_with_backoff(&self.retry, "validator_completion", cancel, || {
                self.provider.complete(request.clone())
            })
            .await?;

            match parse_review(&response.text) {
                Ok(review) => return Ok(review),
                Err(e) => {
                    warn!(attempt, error = %e, "Validator review rejected");
                    last_error = e.to_string();
                }
            }
        }
        Err(AgentError::ValidationFailed {
            attempts,
            last_error,
        })
    }
}

fn parse_review(text: &str) -> Result<ReviewPayload> {
    let json = extract_json_object(text)
        .ok_or_else(|| AgentError::InvalidOutput("no JSON object in response".into()))?;
    let mut review: ReviewPayload = serde_json::from_str(&json)
        .map_err(|e| AgentError::InvalidOutput(format!("malformed review JSON: {e}")))?;
    if !review.score.is_finite() {
        return Err(AgentError::InvalidOutput("review score is not finite".into()));
    }
    review.score = review.score.clamp(0.0, 1.0);
    Ok(review)
}

/// Geometric component: validity flags and body count against the plan
fn geometric_score(
    report: &ExecutionReport,
    scripts: &BTreeMap<TaskId, String>,
    issues: &mut Vec<String>,
) -> f64 {
    let mut indicators = Vec::with_capacity(4);

    indicators.push(if report.is_manifold { 1.0 } else { 0.0 });
    if !report.is_manifold {
        issues.push("produced geometry is not manifold".to_string());
    }
    indicators.push(if report.has_invalid_faces { 0.0 } else { 1.0 });
    if report.has_invalid_faces {
        issues.push("produced geometry has invalid faces".to_string());
    }
    indicators.push(if report.has_self_intersections { 0.0 } else { 1.0 });
    if report.has_self_intersections {
        issues.push("produced geometry self-intersects".to_string());
    }

    // Each script declares exactly one artifact via its RESULT sentinel
    let expected = scripts.len().max(1) as f64;
    let count_ratio = (report.artifacts.len() as f64 / expected).min(1.0);
    indicators.push(count_ratio);
    if count_ratio < 1.0 {
        issues.push(format!(
            "expected {} artifacts, executor produced {}",
            scripts.len(),
            report.artifacts.len()
        ));
    }

    for error in &report.errors {
        issues.push(format!("execution error: {error}"));
    }

    indicators.iter().sum::<f64>() / indicators.len() as f64
}

/// Features a design prompt asks for, keyed to operation kinds
fn expected_operations(prompt: &str) -> BTreeSet<OperationKind> {
    const KEYWORDS: &[(&str, OperationKind)] = &[
        ("cube", OperationKind::CreatePrimitive),
        ("box", OperationKind::CreatePrimitive),
        ("block", OperationKind::CreatePrimitive),
        ("plate", OperationKind::CreatePrimitive),
        ("cylinder", OperationKind::CreatePrimitive),
        ("sphere", OperationKind::CreatePrimitive),
        ("cone", OperationKind::CreatePrimitive),
        ("torus", OperationKind::CreatePrimitive),
        ("hole", OperationKind::BooleanOp),
        ("cut", OperationKind::BooleanOp),
        ("subtract", OperationKind::BooleanOp),
        ("union", OperationKind::BooleanOp),
        ("fuse", OperationKind::BooleanOp),
        ("intersect", OperationKind::BooleanOp),
        ("fillet", OperationKind::FilletChamfer),
        ("round", OperationKind::FilletChamfer),
        ("chamfer", OperationKind::FilletChamfer),
        ("bevel", OperationKind::FilletChamfer),
        ("pattern", OperationKind::Pattern),
        ("array", OperationKind::Pattern),
        ("grid", OperationKind::Pattern),
        ("extrude", OperationKind::ExtrudeRevolve),
        ("revolve", OperationKind::ExtrudeRevolve),
        ("sketch", OperationKind::SketchCreate),
        ("profile", OperationKind::SketchCreate),
        ("translate", OperationKind::Transform),
        ("rotate", OperationKind::Transform),
        ("scale", OperationKind::Transform),
        ("mirror", OperationKind::Transform),
    ];
    let lower = prompt.to_lowercase();
    KEYWORDS
        .iter()
        .filter(|(kw, _)| lower.contains(kw))
        .map(|(_, op)| *op)
        .collect()
}

/// Keywords an operation is expected to leave in its script text
fn script_hints(op: OperationKind) -> &'static [&'static str] {
    match op {
        OperationKind::CreatePrimitive => {
            &["box", "cylinder", "sphere", "cone", "torus", "primitives"]
        }
        OperationKind::BooleanOp => &["cut", "fuse", "common", "boolean"],
        OperationKind::Transform => &["translate", "rotate", "scale", "transform"],
        OperationKind::Pattern => &["pattern", "array"],
        OperationKind::FilletChamfer => &["fillet", "chamfer"],
        OperationKind::ExtrudeRevolve => &["extrude", "revolve"],
        OperationKind::SketchCreate => &["sketch"],
        OperationKind::SketchConstrain => &["constrain"],
    }
}

/// Semantic component: prompt features covered by the plan and scripts
fn semantic_score(prompt: &str, graph: &TaskGraph, scripts: &BTreeMap<TaskId, String>) -> f64 {
    let expected = expected_operations(prompt);
    if expected.is_empty() {
        return 1.0;
    }
    let present: BTreeSet<OperationKind> = graph.tasks().map(|t| t.operation).collect();
    let covered_in_plan = expected.intersection(&present).count() as f64 / expected.len() as f64;

    let all_scripts = scripts
        .values()
        .cloned()
        .collect::<Vec<_>>()
        .join("\n")
        .to_lowercase();
    let covered_in_scripts = expected
        .iter()
        .filter(|op| script_hints(**op).iter().any(|h| all_scripts.contains(h)))
        .count() as f64
        / expected.len() as f64;

    (covered_in_plan + covered_in_scripts) / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{CompletionResponse, FinishReason};
    use async_trait::async_trait;
    use cadweave_graph::TaskNode;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    struct ScriptedModel {
        responses: Mutex<VecDeque<String>>,
    }

    impl ScriptedModel {
        fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().map(String::from).collect()),
            }
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse> {
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

    fn cube_fixture() -> (TaskGraph, BTreeMap<TaskId, String>) {
        let mut g = TaskGraph::new("req-1");
        g.add_task(TaskNode::new("t1", OperationKind::CreatePrimitive).with_description("cube"))
            .unwrap();
        let scripts = BTreeMap::from([(
            "t1".to_string(),
            "from cad.primitives import box\nb = box(10.0, 10.0, 10.0)\n# RESULT: b\n".to_string(),
        )]);
        (g, scripts)
    }

    fn clean_report() -> ExecutionReport {
        ExecutionReport::success(
            vec![crate::executor::Artifact {
                id: "a1".into(),
                name: "b".into(),
                kind: "solid".into(),
                bounding_box: Some([0.0, 0.0, 0.0, 10.0, 10.0, 10.0]),
                volume: Some(1000.0),
            }],
            Duration::from_millis(120),
        )
    }

    #[tokio::test]
    async fn clean_run_scores_high() {
        let model = Arc::new(ScriptedModel::new(vec![
            r#"{"score": 0.95, "issues": [], "suggestions": []}"#,
        ]));
        let validator = ValidatorAgent::new(model);
        let (graph, scripts) = cube_fixture();

        let result = validator
            .validate("req-1", "Create a cube 10x10x10", &graph, &scripts, Some(&clean_report()), &no_cancel())
            .await
            .unwrap();

        assert!(result.overall_score > 0.9, "score was {}", result.overall_score);
        assert!(result.is_valid);
        assert!(!result.should_refine);
        assert_eq!(result.dimensional_scores.len(), 3);
    }

    #[tokio::test]
    async fn missing_report_renormalizes_weights() {
        let model = Arc::new(ScriptedModel::new(vec![
            r#"{"score": 1.0, "issues": [], "suggestions": []}"#,
        ]));
        let validator = ValidatorAgent::new(model);
        let (graph, scripts) = cube_fixture();

        let result = validator
            .validate("req-1", "Create a cube", &graph, &scripts, None, &no_cancel())
            .await
            .unwrap();

        // semantic 1.0 * 0.5 + review 1.0 * 0.5
        assert!((result.overall_score - 1.0).abs() < 1e-9);
        assert!(!result.dimensional_scores.contains_key("geometric"));
    }

    #[tokio::test]
    async fn broken_geometry_drags_score_down() {
        let model = Arc::new(ScriptedModel::new(vec![
            r#"{"score": 0.9, "issues": [], "suggestions": []}"#,
        ]));
        let validator = ValidatorAgent::new(model);
        let (graph, scripts) = cube_fixture();
        let mut report = clean_report();
        report.is_manifold = false;
        report.has_self_intersections = true;

        let result = validator
            .validate("req-1", "Create a cube", &graph, &scripts, Some(&report), &no_cancel())
            .await
            .unwrap();

        assert!(result.overall_score < 0.8);
        assert!(result.issues.iter().any(|i| i.contains("manifold")));
        assert!(result.issues.iter().any(|i| i.contains("self-intersects")));
    }

    #[tokio::test]
    async fn malformed_review_retries_then_fails() {
        let model = Arc::new(ScriptedModel::new(vec!["garbage", "more garbage"]));
        let validator = ValidatorAgent::new(model)
            .with_retry(RetryConfig::new(1).with_initial_backoff(1).with_jitter(false));
        let (graph, scripts) = cube_fixture();

        let err = validator
            .validate("req-1", "cube", &graph, &scripts, None, &no_cancel())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ValidationFailed { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn review_score_is_clamped() {
        let model = Arc::new(ScriptedModel::new(vec![
            r#"{"score": 7.5, "issues": [], "suggestions": []}"#,
        ]));
        let validator = ValidatorAgent::new(model);
        let (graph, scripts) = cube_fixture();

        let result = validator
            .validate("req-1", "cube", &graph, &scripts, None, &no_cancel())
            .await
            .unwrap();
        assert!(result.overall_score <= 1.0);
    }

    #[test]
    fn from_score_thresholds() {
        let passing = ValidationResult::from_score(0.80, 0.80, 0.40);
        assert!(passing.is_valid && !passing.should_refine);

        let refinable = ValidationResult::from_score(0.40, 0.80, 0.40);
        assert!(!refinable.is_valid && refinable.should_refine);

        let failing = ValidationResult::from_score(0.10, 0.80, 0.40);
        assert!(!failing.is_valid && !failing.should_refine);
    }

    #[test]
    fn expected_operations_from_prompt() {
        let ops = expected_operations("Create a cube with a hole and fillet the edges");
        assert!(ops.contains(&OperationKind::CreatePrimitive));
        assert!(ops.contains(&OperationKind::BooleanOp));
        assert!(ops.contains(&OperationKind::FilletChamfer));
        assert!(!ops.contains(&OperationKind::Pattern));
    }
}
