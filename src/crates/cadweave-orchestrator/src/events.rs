//! Typed event bus
//!
//! Decouples the pipeline from any real-time consumer. Topics are cheap
//! string channels; each request publishes to its own topic
//! (`pipeline:{request_id}`) and to the global `pipeline` topic.
//!
//! Delivery is lossy per subscriber: publishing never blocks, and a
//! subscriber that falls more than the configured backlog behind has its
//! oldest events dropped and receives a [`PipelineEvent::SubscriberLagging`]
//! notice in-stream. Ordering is FIFO per topic; nothing is guaranteed
//! across topics.

use dashmap::DashMap;
use futures::stream::Stream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

/// The global topic every pipeline event is mirrored to
pub const GLOBAL_TOPIC: &str = "pipeline";

/// Topic name for one request's events
pub fn request_topic(request_id: &str) -> String {
    format!("pipeline:{request_id}")
}

/// Events published by the pipeline runtime and its collaborators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    NodeEntered {
        request_id: String,
        node: String,
        iteration: u32,
    },
    NodeExited {
        request_id: String,
        node: String,
        iteration: u32,
    },
    TaskStarted {
        request_id: String,
        task_id: String,
    },
    TaskCompleted {
        request_id: String,
        task_id: String,
        artifact: Option<String>,
    },
    TaskFailed {
        request_id: String,
        task_id: String,
        error: String,
    },
    ValidationScored {
        request_id: String,
        score: f64,
        is_valid: bool,
        iteration: u32,
    },
    RefinementRequested {
        request_id: String,
        iteration: u32,
    },
    StateCheckpoint {
        session_id: String,
        name: String,
    },
    Error {
        request_id: Option<String>,
        message: String,
    },
    PipelineTerminal {
        request_id: String,
        status: String,
        reason: Option<String>,
    },
    SubscriberLagging {
        topic: String,
        missed: u64,
    },
}

impl PipelineEvent {
    /// Stable event kind name
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineEvent::NodeEntered { .. } => "node_entered",
            PipelineEvent::NodeExited { .. } => "node_exited",
            PipelineEvent::TaskStarted { .. } => "task_started",
            PipelineEvent::TaskCompleted { .. } => "task_completed",
            PipelineEvent::TaskFailed { .. } => "task_failed",
            PipelineEvent::ValidationScored { .. } => "validation_scored",
            PipelineEvent::RefinementRequested { .. } => "refinement_requested",
            PipelineEvent::StateCheckpoint { .. } => "state_checkpoint",
            PipelineEvent::Error { .. } => "error",
            PipelineEvent::PipelineTerminal { .. } => "pipeline_terminal",
            PipelineEvent::SubscriberLagging { .. } => "subscriber_lagging",
        }
    }
}

/// Stream of events for one subscription
pub type EventStream = Pin<Box<dyn Stream<Item = PipelineEvent> + Send>>;

/// Per-topic broadcast fan-out
pub struct EventBus {
    topics: DashMap<String, broadcast::Sender<PipelineEvent>>,
    backlog: usize,
    published: AtomicU64,
}

impl EventBus {
    /// Create a bus with the given per-subscriber backlog
    pub fn new(backlog: usize) -> Self {
        Self {
            topics: DashMap::new(),
            backlog: backlog.max(1),
            published: AtomicU64::new(0),
        }
    }

    /// Publish an event to a topic; never blocks
    ///
    /// Events published to a topic nobody subscribes to are discarded;
    /// subscriptions are cold streams with no backfill.
    pub fn publish(&self, topic: &str, event: PipelineEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        if let Some(sender) = self.topics.get(topic) {
            // Err means no live receivers; drop silently
            let _ = sender.send(event);
        }
    }

    /// Subscribe to a topic's subsequent events
    ///
    /// A subscriber that lags beyond the backlog loses its oldest events
    /// and observes a `SubscriberLagging` item where the gap occurred.
    pub fn subscribe(&self, topic: &str) -> EventStream {
        let sender = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.backlog).0);
        let receiver = sender.subscribe();
        let topic = topic.to_string();
        Box::pin(BroadcastStream::new(receiver).map(move |item| match item {
            Ok(event) => event,
            Err(BroadcastStreamRecvError::Lagged(missed)) => PipelineEvent::SubscriberLagging {
                topic: topic.clone(),
                missed,
            },
        }))
    }

    /// Total events published through this bus
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Number of topics with at least one subscription ever taken
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Drop topics whose subscribers are all gone
    pub fn prune(&self) {
        self.topics.retain(|_, sender| sender.receiver_count() > 0);
    }
}
