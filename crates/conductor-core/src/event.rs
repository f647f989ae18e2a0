//! Lifecycle events and the observer bus that fans them out.
//!
//! Components publish [`Event`]s on a shared [`EventBus`]; transports (the
//! WebSocket gateway, tests, log sinks) register an [`EventSink`] and receive
//! every event in publish order. A sink that reports
//! [`ConductorError::SubscriberClosed`] is pruned on the spot; any other sink
//! error is logged and isolated from the remaining subscribers.

use crate::agent::AgentInfo;
use crate::error::{ConductorError, ConductorResult};
use crate::task::TaskStatus;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Events pushed to subscribers. Serialized with a `type` tag such as `task:updated`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum Event {
    /// An agent joined the registry.
    #[serde(rename = "agent:registered")]
    AgentRegistered {
        /// Snapshot at registration time.
        agent: AgentInfo,
    },
    /// An agent left the registry.
    #[serde(rename = "agent:unregistered")]
    AgentUnregistered {
        /// Agent name.
        name: String,
    },
    /// An agent became healthy.
    #[serde(rename = "agent:healthy")]
    AgentHealthy {
        /// Agent name.
        name: String,
    },
    /// An agent failed its health check.
    #[serde(rename = "agent:unhealthy")]
    AgentUnhealthy {
        /// Agent name.
        name: String,
        /// Health check error, if one was reported.
        error: Option<String>,
    },
    /// Progress without a status change.
    #[serde(rename = "task:progress")]
    TaskProgress {
        /// Task id.
        task_id: Uuid,
        /// Progress in `0.0..=1.0`.
        progress: Option<f32>,
        /// Human-readable step.
        message: String,
    },
    /// A task changed status.
    #[serde(rename = "task:updated")]
    TaskUpdated {
        /// Task id.
        task_id: Uuid,
        /// New status.
        status: TaskStatus,
        /// Status before the change.
        previous: TaskStatus,
        /// Last known progress.
        progress: Option<f32>,
    },
    /// A task finished successfully.
    #[serde(rename = "task:completed")]
    TaskCompleted {
        /// Task id.
        task_id: Uuid,
        /// Result reported by the agent.
        result: Option<serde_json::Value>,
    },
    /// A task failed, either on the agent or after too many failed checks.
    #[serde(rename = "task:failed")]
    TaskFailed {
        /// Task id.
        task_id: Uuid,
        /// Failure reason.
        error: String,
        /// Failed status checks before giving up.
        retries: u32,
    },
}

impl Event {
    /// The wire name of the event (`agent:registered`, `task:failed`, ...).
    pub fn name(&self) -> &'static str {
        match self {
            Event::AgentRegistered { .. } => "agent:registered",
            Event::AgentUnregistered { .. } => "agent:unregistered",
            Event::AgentHealthy { .. } => "agent:healthy",
            Event::AgentUnhealthy { .. } => "agent:unhealthy",
            Event::TaskProgress { .. } => "task:progress",
            Event::TaskUpdated { .. } => "task:updated",
            Event::TaskCompleted { .. } => "task:completed",
            Event::TaskFailed { .. } => "task:failed",
        }
    }

    /// Task the event refers to, if any.
    pub fn task_id(&self) -> Option<Uuid> {
        match self {
            Event::TaskProgress { task_id, .. }
            | Event::TaskUpdated { task_id, .. }
            | Event::TaskCompleted { task_id, .. }
            | Event::TaskFailed { task_id, .. } => Some(*task_id),
            _ => None,
        }
    }
}

/// Receiving end of a subscription.
pub trait EventSink: Send + Sync {
    /// Deliver one event. Return [`ConductorError::SubscriberClosed`] once the
    /// underlying transport is gone so the bus can drop the subscription.
    fn deliver(&self, event: &Event) -> ConductorResult<()>;
}

impl EventSink for mpsc::UnboundedSender<Event> {
    fn deliver(&self, event: &Event) -> ConductorResult<()> {
        self.send(event.clone())
            .map_err(|_| ConductorError::SubscriberClosed)
    }
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

struct Subscription {
    id: SubscriptionId,
    session_id: Option<Uuid>,
    sink: Arc<dyn EventSink>,
}

/// Observer registry for lifecycle events.
pub struct EventBus {
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Bus without subscribers.
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Receive every event.
    pub fn subscribe(&self, sink: Arc<dyn EventSink>) -> SubscriptionId {
        self.add(None, sink)
    }

    /// Subscribe on behalf of a client session.
    pub fn subscribe_session(&self, session_id: Uuid, sink: Arc<dyn EventSink>) -> SubscriptionId {
        self.add(Some(session_id), sink)
    }

    fn add(&self, session_id: Option<Uuid>, sink: Arc<dyn EventSink>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.write().push(Subscription {
            id,
            session_id,
            sink,
        });
        debug!(subscription = id.0, session_id = ?session_id, "Subscriber added");
        id
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscriptions.write();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        before != subs.len()
    }

    /// Remove every subscription held by a session.
    pub fn unsubscribe_session(&self, session_id: Uuid) -> usize {
        let mut subs = self.subscriptions.write();
        let before = subs.len();
        subs.retain(|s| s.session_id != Some(session_id));
        before - subs.len()
    }

    /// Deliver an event to every live subscriber; returns how many accepted it.
    pub fn publish(&self, event: Event) -> usize {
        let targets: Vec<(SubscriptionId, Arc<dyn EventSink>)> = self
            .subscriptions
            .read()
            .iter()
            .map(|s| (s.id, s.sink.clone()))
            .collect();

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, sink) in targets {
            match sink.deliver(&event) {
                Ok(()) => delivered += 1,
                Err(ConductorError::SubscriberClosed) => closed.push(id),
                Err(e) => {
                    warn!(subscription = id.0, event = event.name(), error = %e, "Event delivery failed");
                }
            }
        }

        if !closed.is_empty() {
            self.subscriptions
                .write()
                .retain(|s| !closed.contains(&s.id));
            debug!(pruned = closed.len(), "Pruned disconnected subscribers");
        }

        delivered
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
