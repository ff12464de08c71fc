//! Event hub — typed fan-out of state-change notifications.
//!
//! Pure consumer of the other components' side effects. The presentation
//! relay (WebSocket, dashboard) subscribes here; the core never depends on
//! any subscriber being present.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::model::{AgentStatus, TaskStatus};
use crate::runtime::AgentEvent;

/// A notification published to Event Hub subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HubEvent {
    TaskCreated {
        task_id: Uuid,
        tenant: String,
        assignee: String,
        delegator_id: Option<Uuid>,
    },
    TaskStatusChanged {
        task_id: Uuid,
        tenant: String,
        status: TaskStatus,
    },
    AgentStatusChanged {
        agent: String,
        tenant: String,
        status: AgentStatus,
    },
    MessageCreated {
        message_id: Uuid,
        tenant: String,
        to_agent: String,
    },
    /// A runtime execution event relayed live from one task invocation.
    /// Ordered within an invocation; unordered across agents.
    AgentActivity {
        task_id: Uuid,
        tenant: String,
        agent: String,
        event: AgentEvent,
    },
}

/// Broadcast hub for [`HubEvent`]s.
#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<HubEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// Publish an event. Dropped silently when nobody is subscribed.
    pub fn publish(&self, event: HubEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
