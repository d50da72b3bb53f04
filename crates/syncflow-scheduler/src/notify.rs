//! Task event bus: best-effort, in-process wake-ups for output waiters and
//! long-polling dequeue callers.
//!
//! Events only shorten waits. Every consumer re-reads the store before it
//! answers, so a dropped or lagged event costs latency, never correctness.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::tasks::{Task, TaskState};

const DEFAULT_CAPACITY: usize = 1024;

/// Something happened to a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// A task became CREATED: new work, a retry, or a materialized schedule run.
    Created { task_id: String, group_key: String },
    /// A task reached a terminal state.
    Terminated {
        task_id: String,
        group_key: String,
        state: TaskState,
        output: Option<Value>,
    },
}

impl TaskEvent {
    pub fn created(task: &Task) -> Self {
        TaskEvent::Created {
            task_id: task.id.clone(),
            group_key: task.group_key.clone(),
        }
    }

    pub fn terminated(task: &Task) -> Self {
        TaskEvent::Terminated {
            task_id: task.id.clone(),
            group_key: task.group_key.clone(),
            state: task.state,
            output: task.output.clone(),
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            TaskEvent::Created { task_id, .. } | TaskEvent::Terminated { task_id, .. } => task_id,
        }
    }

    pub fn group_key(&self) -> &str {
        match self {
            TaskEvent::Created { group_key, .. } | TaskEvent::Terminated { group_key, .. } => {
                group_key
            }
        }
    }
}

/// Fan-out channel for [`TaskEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TaskEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to current subscribers. Returns how many received it.
    pub fn publish(&self, event: TaskEvent) -> usize {
        tracing::debug!("📣 {} {}", event_kind(&event), event.task_id());
        // No subscribers is not an error.
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

fn event_kind(event: &TaskEvent) -> &'static str {
    match event {
        TaskEvent::Created { .. } => "created",
        TaskEvent::Terminated { .. } => "terminated",
    }
}
