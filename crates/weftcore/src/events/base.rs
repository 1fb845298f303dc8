use crate::{ExecutedVia, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::broadcast;
use uuid::Uuid;

pub type ExecutionId = Uuid;

/// Events emitted during workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    WorkflowStarted {
        execution_id: ExecutionId,
        workflow_id: WorkflowId,
        timestamp: DateTime<Utc>,
    },
    WorkflowPaused {
        execution_id: ExecutionId,
        missing: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    WorkflowResumed {
        execution_id: ExecutionId,
        supplied: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    WorkflowCompleted {
        execution_id: ExecutionId,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    WorkflowFailed {
        execution_id: ExecutionId,
        error: String,
        failed_steps: BTreeMap<String, String>,
        timestamp: DateTime<Utc>,
    },
    WorkflowCancelled {
        execution_id: ExecutionId,
        timestamp: DateTime<Utc>,
    },
    StepStarted {
        execution_id: ExecutionId,
        step_id: String,
        step_type: String,
        timestamp: DateTime<Utc>,
    },
    StepCompleted {
        execution_id: ExecutionId,
        step_id: String,
        executed_via: ExecutedVia,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    StepFailed {
        execution_id: ExecutionId,
        step_id: String,
        error: String,
        will_retry: bool,
        timestamp: DateTime<Utc>,
    },
}

/// Coarse event category exposed to notification sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Started,
    Paused,
    Resumed,
    Completed,
    Failed,
    Cancelled,
    Step,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::Started => "started",
            EventType::Paused => "paused",
            EventType::Resumed => "resumed",
            EventType::Completed => "completed",
            EventType::Failed => "failed",
            EventType::Cancelled => "cancelled",
            EventType::Step => "step",
        };
        f.write_str(s)
    }
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> ExecutionId {
        match self {
            ExecutionEvent::WorkflowStarted { execution_id, .. }
            | ExecutionEvent::WorkflowPaused { execution_id, .. }
            | ExecutionEvent::WorkflowResumed { execution_id, .. }
            | ExecutionEvent::WorkflowCompleted { execution_id, .. }
            | ExecutionEvent::WorkflowFailed { execution_id, .. }
            | ExecutionEvent::WorkflowCancelled { execution_id, .. }
            | ExecutionEvent::StepStarted { execution_id, .. }
            | ExecutionEvent::StepCompleted { execution_id, .. }
            | ExecutionEvent::StepFailed { execution_id, .. } => *execution_id,
        }
    }

    pub fn event_type(&self) -> EventType {
        match self {
            ExecutionEvent::WorkflowStarted { .. } => EventType::Started,
            ExecutionEvent::WorkflowPaused { .. } => EventType::Paused,
            ExecutionEvent::WorkflowResumed { .. } => EventType::Resumed,
            ExecutionEvent::WorkflowCompleted { .. } => EventType::Completed,
            ExecutionEvent::WorkflowFailed { .. } => EventType::Failed,
            ExecutionEvent::WorkflowCancelled { .. } => EventType::Cancelled,
            ExecutionEvent::StepStarted { .. }
            | ExecutionEvent::StepCompleted { .. }
            | ExecutionEvent::StepFailed { .. } => EventType::Step,
        }
    }

    /// Event payload without the envelope fields, for transports that send
    /// `(execution_id, event_type, details)` triples.
    pub fn details(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let Some(map) = value.as_object_mut() {
            map.remove("type");
            map.remove("execution_id");
        }
        value
    }
}

/// In-process event bus; subscribers receive every event published after
/// they subscribe.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    /// Publish; having no subscribers is not an error.
    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}
