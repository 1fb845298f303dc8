use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use weftcore::{ExecutionEvent, NotificationSink};

/// Fire-and-forget fan-out of execution events.
///
/// Each sink gets its own worker task and bounded queue, so a slow or failing
/// sink neither blocks the scheduler nor delays other sinks. Events reach a
/// given sink in the order they were published; when a sink's queue is full
/// new events for it are dropped.
#[derive(Clone)]
pub struct Notifier {
    queues: Arc<Vec<mpsc::Sender<ExecutionEvent>>>,
}

impl Notifier {
    /// Spawns one worker per sink; must be called within a tokio runtime.
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>, capacity: usize, timeout: Duration) -> Self {
        let queues = sinks
            .into_iter()
            .map(|sink| {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                tokio::spawn(deliver(sink, rx, timeout));
                tx
            })
            .collect();
        Self {
            queues: Arc::new(queues),
        }
    }

    pub fn disabled() -> Self {
        Self {
            queues: Arc::new(Vec::new()),
        }
    }

    pub fn sink_count(&self) -> usize {
        self.queues.len()
    }

    /// Queue `event` for every sink. Never blocks and never fails.
    pub fn publish(&self, event: ExecutionEvent) {
        for queue in self.queues.iter() {
            match queue.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => tracing::warn!(
                    execution_id = %event.execution_id(),
                    event = %event.event_type(),
                    "notification queue full, dropping event"
                ),
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::warn!(execution_id = %event.execution_id(), "notification worker is gone, dropping event")
                }
            }
        }
    }
}

async fn deliver(sink: Arc<dyn NotificationSink>, mut rx: mpsc::Receiver<ExecutionEvent>, timeout: Duration) {
    while let Some(event) = rx.recv().await {
        match tokio::time::timeout(timeout, sink.notify(&event)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(
                sink = sink.name(),
                execution_id = %event.execution_id(),
                event = %event.event_type(),
                "notification failed: {}", e
            ),
            Err(_) => tracing::warn!(
                sink = sink.name(),
                execution_id = %event.execution_id(),
                event = %event.event_type(),
                "notification timed out after {:?}", timeout
            ),
        }
    }
    tracing::debug!(sink = sink.name(), "notification worker stopped");
}
