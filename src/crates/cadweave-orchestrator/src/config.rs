//! Core configuration
//!
//! All durations are stored as integer seconds or milliseconds so a plain
//! YAML file deserializes directly. Every field has a default; a partial
//! file overrides only what it names.

use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration recognized by the orchestration core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Pipeline refinement cap per request
    pub max_iterations: u32,
    /// Global cap on concurrently active pipelines
    pub max_concurrent_requests: usize,
    /// Worker pool size for the command queue
    pub worker_concurrency: usize,
    /// Default command timeout in seconds
    pub command_timeout_secs: u64,
    /// Total attempts allowed per command
    pub command_max_attempts: u32,
    /// Periodic checkpoint interval in seconds while a pipeline is active
    pub checkpoint_interval_secs: u64,
    /// Decision cache TTL in seconds
    pub decision_cache_ttl_secs: u64,
    /// Per-subscriber event backlog before the bus starts dropping
    pub event_subscriber_backlog: usize,
    /// Default for per-request execution enablement
    pub enable_execution: bool,
    /// Whether the refinement loop is enabled
    pub enable_refinement: bool,
    /// Validation score at or above which a design passes
    pub pass_threshold: f64,
    /// Validation score at or above which a design is refined
    pub refine_threshold: f64,
    /// Validation score at or above which the pipeline replans
    pub replan_threshold: f64,
    /// Sessions idle longer than this are destroyed, in seconds
    pub session_idle_timeout_secs: u64,
    /// Backoff before re-enqueueing a dependency-blocked command, in ms
    pub dependency_requeue_delay_ms: u64,
    /// Bound on queued async checkpoint writes
    pub checkpoint_pending_limit: usize,
    /// Checkpoints retained per session
    pub checkpoint_history_limit: usize,
    /// Retry attempts inside each agent adapter
    pub agent_max_retries: u32,
    /// Entries kept in a pipeline's error history
    pub error_history_limit: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            max_concurrent_requests: 3,
            worker_concurrency: 3,
            command_timeout_secs: 300,
            command_max_attempts: 3,
            checkpoint_interval_secs: 30,
            decision_cache_ttl_secs: 300,
            event_subscriber_backlog: 1024,
            enable_execution: true,
            enable_refinement: true,
            pass_threshold: 0.80,
            refine_threshold: 0.40,
            replan_threshold: 0.20,
            session_idle_timeout_secs: 3600,
            dependency_requeue_delay_ms: 50,
            checkpoint_pending_limit: 64,
            checkpoint_history_limit: 20,
            agent_max_retries: 3,
            error_history_limit: 20,
        }
    }
}

impl CoreConfig {
    /// Default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a YAML file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            OrchestratorError::InvalidConfiguration(format!(
                "failed to read {:?}: {e}",
                path.as_ref()
            ))
        })?;
        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            OrchestratorError::InvalidConfiguration(format!("failed to parse YAML: {e}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Set the iteration cap
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    /// Set the global pipeline cap
    pub fn with_max_concurrent_requests(mut self, max: usize) -> Self {
        self.max_concurrent_requests = max;
        self
    }

    /// Set the worker pool size
    pub fn with_worker_concurrency(mut self, workers: usize) -> Self {
        self.worker_concurrency = workers;
        self
    }

    /// Set the default command timeout
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout_secs = timeout.as_secs();
        self
    }

    /// Set the validation thresholds
    pub fn with_thresholds(mut self, pass: f64, refine: f64, replan: f64) -> Self {
        self.pass_threshold = pass;
        self.refine_threshold = refine;
        self.replan_threshold = replan;
        self
    }

    /// Enable or disable execution by default
    pub fn with_execution(mut self, enabled: bool) -> Self {
        self.enable_execution = enabled;
        self
    }

    /// Enable or disable the refinement loop
    pub fn with_refinement(mut self, enabled: bool) -> Self {
        self.enable_refinement = enabled;
        self
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(OrchestratorError::InvalidConfiguration(
                "max_iterations must be at least 1".into(),
            ));
        }
        if self.worker_concurrency == 0 {
            return Err(OrchestratorError::InvalidConfiguration(
                "worker_concurrency must be at least 1".into(),
            ));
        }
        if self.max_concurrent_requests == 0 {
            return Err(OrchestratorError::InvalidConfiguration(
                "max_concurrent_requests must be at least 1".into(),
            ));
        }
        for (name, value) in [
            ("pass_threshold", self.pass_threshold),
            ("refine_threshold", self.refine_threshold),
            ("replan_threshold", self.replan_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(OrchestratorError::InvalidConfiguration(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if !(self.replan_threshold <= self.refine_threshold
            && self.refine_threshold <= self.pass_threshold)
        {
            return Err(OrchestratorError::InvalidConfiguration(format!(
                "thresholds must satisfy replan <= refine <= pass, got {} / {} / {}",
                self.replan_threshold, self.refine_threshold, self.pass_threshold
            )));
        }
        Ok(())
    }

    /// Default command timeout as a duration
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Periodic checkpoint interval as a duration
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }

    /// Decision cache TTL as a duration
    pub fn decision_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.decision_cache_ttl_secs)
    }

    /// Session idle timeout as a duration
    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    /// Dependency re-enqueue backoff as a duration
    pub fn dependency_requeue_delay(&self) -> Duration {
        Duration::from_millis(self.dependency_requeue_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CoreConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_iterations, 5);
        assert_eq!(config.worker_concurrency, 3);
        assert_eq!(config.pass_threshold, 0.80);
    }

    #[test]
    fn builder_methods_chain() {
        let config = CoreConfig::new()
            .with_max_iterations(2)
            .with_worker_concurrency(8)
            .with_thresholds(0.9, 0.5, 0.3)
            .with_execution(false);

        config.validate().unwrap();
        assert_eq!(config.max_iterations, 2);
        assert_eq!(config.worker_concurrency, 8);
        assert!(!config.enable_execution);
    }

    #[test]
    fn threshold_ordering_is_enforced() {
        let bad = CoreConfig::new().with_thresholds(0.5, 0.8, 0.2);
        assert!(matches!(
            bad.validate(),
            Err(OrchestratorError::InvalidConfiguration(_))
        ));

        let out_of_range = CoreConfig::new().with_thresholds(1.5, 0.4, 0.2);
        assert!(out_of_range.validate().is_err());
    }

    #[test]
    fn zero_workers_rejected() {
        let bad = CoreConfig::new().with_worker_concurrency(0);
        assert!(bad.validate().is_err());
    }

    #[test]
    fn partial_yaml_overrides_defaults() {
        let yaml = "max_iterations: 7\nworker_concurrency: 2\n";
        let config: CoreConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.max_iterations, 7);
        assert_eq!(config.worker_concurrency, 2);
        // Untouched fields keep their defaults
        assert_eq!(config.command_timeout_secs, 300);
        assert_eq!(config.pass_threshold, 0.80);
    }
}
