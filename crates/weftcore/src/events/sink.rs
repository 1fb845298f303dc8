use super::{EventBus, EventType, ExecutionEvent};
use crate::NotifyError;
use async_trait::async_trait;

/// Receiver of execution notifications (websocket relays, webhooks, ...).
///
/// Delivery is best-effort: the engine logs errors and moves on.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, event: &ExecutionEvent) -> Result<(), NotifyError>;
}

#[async_trait]
impl NotificationSink for EventBus {
    fn name(&self) -> &str {
        "event-bus"
    }

    async fn notify(&self, event: &ExecutionEvent) -> Result<(), NotifyError> {
        self.emit(event.clone());
        Ok(())
    }
}

/// Writes lifecycle events to the log; step events go to `debug`.
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn notify(&self, event: &ExecutionEvent) -> Result<(), NotifyError> {
        let execution_id = event.execution_id();
        match event.event_type() {
            EventType::Step => {
                tracing::debug!(%execution_id, details = %event.details(), "step event");
            }
            EventType::Failed => {
                tracing::warn!(%execution_id, details = %event.details(), "workflow failed");
            }
            kind => {
                tracing::info!(%execution_id, event = %kind, details = %event.details(), "workflow event");
            }
        }
        Ok(())
    }
}
