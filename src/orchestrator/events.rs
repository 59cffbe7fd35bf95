use crate::protocol::AgentIdentity;
use crate::work_tracker::TaskStatus;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

/// Domain events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    TaskAssigned {
        task_id: String,
        agent_instance_id: String,
    },
    TaskProgress {
        task_id: String,
        percent: Option<f64>,
        status_line: Option<String>,
    },
    TaskCompleted {
        task_id: String,
        status: TaskStatus,
    },
    AgentJoined {
        agent: AgentIdentity,
    },
    AgentLeft {
        agent: AgentIdentity,
    },
}

pub type EventListener = Arc<dyn Fn(&OrchestratorEvent) + Send + Sync>;

/// Explicit listener list; a panicking listener is isolated so the rest
/// still observe the event.
pub(crate) struct EventBus {
    listeners: RwLock<Vec<EventListener>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub async fn subscribe(&self, listener: EventListener) {
        self.listeners.write().await.push(listener);
    }

    pub async fn emit(&self, event: &OrchestratorEvent) {
        let listeners = self.listeners.read().await.clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!("Event listener panicked; continuing with remaining listeners");
            }
        }
    }
}
