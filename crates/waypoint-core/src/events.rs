//! Action lifecycle events and the event bus they are published on.
//!
//! The orchestrator emits one `action:start` per admitted action followed by
//! exactly one `action:complete` or `action:error`. Consumers either register
//! callbacks by event name (`"*"` matches everything) or take a broadcast
//! receiver for streaming.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::Timestamp;

pub const ACTION_START: &str = "action:start";
pub const ACTION_COMPLETE: &str = "action:complete";
pub const ACTION_ERROR: &str = "action:error";
/// Subscribe to every event name.
pub const WILDCARD: &str = "*";

/// Lifecycle events published by the action pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ActionEvent {
    /// An action was admitted and is about to build its context.
    ActionStarted {
        action_id: Uuid,
        result_id: String,
        query: String,
        timestamp: Timestamp,
    },

    /// An action finished, either executed or prevented.
    ActionCompleted {
        action_id: Uuid,
        result_id: String,
        success: bool,
        prevented: bool,
        reason: Option<String>,
        processing_time_ms: f64,
        timestamp: Timestamp,
    },

    /// An action failed while building context or executing.
    ActionFailed {
        action_id: Uuid,
        result_id: String,
        error: String,
        processing_time_ms: f64,
        timestamp: Timestamp,
    },
}

impl ActionEvent {
    /// Returns the bus name this event is published under.
    pub fn event_name(&self) -> &'static str {
        match self {
            ActionEvent::ActionStarted { .. } => ACTION_START,
            ActionEvent::ActionCompleted { .. } => ACTION_COMPLETE,
            ActionEvent::ActionFailed { .. } => ACTION_ERROR,
        }
    }

    pub fn action_id(&self) -> Uuid {
        match self {
            ActionEvent::ActionStarted { action_id, .. }
            | ActionEvent::ActionCompleted { action_id, .. }
            | ActionEvent::ActionFailed { action_id, .. } => *action_id,
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        match self {
            ActionEvent::ActionStarted { timestamp, .. }
            | ActionEvent::ActionCompleted { timestamp, .. }
            | ActionEvent::ActionFailed { timestamp, .. } => *timestamp,
        }
    }
}

/// Handle returned by every subscription; pass it to `unsubscribe`.
pub type SubscriptionId = Uuid;

/// Callback invoked synchronously for each delivered event.
pub type EventCallback = Arc<dyn Fn(&ActionEvent) -> Result<(), String> + Send + Sync>;

/// Wrap a closure as an [`EventCallback`].
pub fn event_callback<F>(f: F) -> EventCallback
where
    F: Fn(&ActionEvent) -> Result<(), String> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Options accepted by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Remove the subscription after its first delivery.
    pub once: bool,
}

/// Aggregated outcome of one `emit` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmitReport {
    pub delivered: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

/// Publish/subscribe seam consumed by the action pipeline.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Deliver an event to every matching subscriber.
    async fn emit(&self, event: &ActionEvent) -> EmitReport;

    /// Register a callback for an event name (or [`WILDCARD`]).
    fn subscribe(
        &self,
        event_name: &str,
        callback: EventCallback,
        options: SubscribeOptions,
    ) -> SubscriptionId;

    /// Remove a subscription. Returns `false` if it was already gone.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

struct Subscriber {
    id: SubscriptionId,
    event_name: String,
    callback: EventCallback,
    once: bool,
}

/// In-process event bus.
///
/// Callbacks run in subscription order. Every emitted event is also sent on a
/// broadcast channel; lagging receivers lose the oldest events.
pub struct InMemoryEventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    sender: broadcast::Sender<ActionEvent>,
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    /// Create a bus whose broadcast channel buffers `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            subscribers: Mutex::new(Vec::new()),
            sender,
        }
    }

    /// Receive every event emitted after this call.
    pub fn stream(&self) -> broadcast::Receiver<ActionEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn emit(&self, event: &ActionEvent) -> EmitReport {
        let name = event.event_name();
        let targets: Vec<(SubscriptionId, EventCallback)> = {
            let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            let targets = subscribers
                .iter()
                .filter(|s| s.event_name == name || s.event_name == WILDCARD)
                .map(|s| (s.id, Arc::clone(&s.callback)))
                .collect::<Vec<_>>();
            subscribers.retain(|s| !(s.once && targets.iter().any(|(id, _)| *id == s.id)));
            targets
        };

        let mut report = EmitReport::default();
        for (id, callback) in targets {
            match callback(event) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(subscription_id = %id, event = name, error = %e, "Event subscriber failed");
                    report.failed += 1;
                    report.errors.push(e);
                }
            }
        }

        // No receivers is not an error.
        let _ = self.sender.send(event.clone());
        debug!(event = name, delivered = report.delivered, failed = report.failed, "Event emitted");
        report
    }

    fn subscribe(
        &self,
        event_name: &str,
        callback: EventCallback,
        options: SubscribeOptions,
    ) -> SubscriptionId {
        let id = Uuid::new_v4();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Subscriber {
                id,
                event_name: event_name.to_string(),
                callback,
                once: options.once,
            });
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }
}
