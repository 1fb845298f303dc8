use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use weftcore::{StepContext, StepError, StepOutput, StepType};

/// Hooks run around every executor invocation, in registration order for
/// `before` and reverse order for `after`.
pub trait StepMiddleware: Send + Sync {
    fn before(&self, _ctx: &StepContext) {}

    fn after(&self, _ctx: &StepContext, _result: &Result<StepOutput, StepError>, _elapsed: Duration) {}
}

/// Structured log line per dispatch.
pub struct TracingMiddleware;

impl StepMiddleware for TracingMiddleware {
    fn before(&self, ctx: &StepContext) {
        tracing::debug!(
            execution_id = %ctx.execution_id,
            step_id = %ctx.step_id,
            step_type = %ctx.step_type,
            attempt = ctx.attempt,
            "dispatching step"
        );
    }

    fn after(&self, ctx: &StepContext, result: &Result<StepOutput, StepError>, elapsed: Duration) {
        let elapsed_ms = elapsed.as_millis() as u64;
        match result {
            Ok(_) => tracing::debug!(
                execution_id = %ctx.execution_id,
                step_id = %ctx.step_id,
                elapsed_ms,
                "step succeeded"
            ),
            Err(e) => tracing::warn!(
                execution_id = %ctx.execution_id,
                step_id = %ctx.step_id,
                attempt = ctx.attempt,
                kind = e.kind(),
                elapsed_ms,
                "step attempt failed: {}", e
            ),
        }
    }
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    total_ms: AtomicU64,
}

/// Per step-type counters, shared with whoever holds the `Arc`.
#[derive(Default)]
pub struct StepMetrics {
    counters: Mutex<HashMap<StepType, Arc<Counters>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub total_ms: u64,
}

impl StepMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, step_type: StepType) -> Arc<Counters> {
        let mut map = self.counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        map.entry(step_type).or_default().clone()
    }

    pub fn snapshot(&self) -> HashMap<StepType, MetricsSnapshot> {
        let map = self.counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        map.iter()
            .map(|(step_type, c)| {
                (
                    *step_type,
                    MetricsSnapshot {
                        dispatched: c.dispatched.load(Ordering::Relaxed),
                        succeeded: c.succeeded.load(Ordering::Relaxed),
                        failed: c.failed.load(Ordering::Relaxed),
                        total_ms: c.total_ms.load(Ordering::Relaxed),
                    },
                )
            })
            .collect()
    }
}

impl StepMiddleware for StepMetrics {
    fn before(&self, ctx: &StepContext) {
        self.counters(ctx.step_type).dispatched.fetch_add(1, Ordering::Relaxed);
    }

    fn after(&self, ctx: &StepContext, result: &Result<StepOutput, StepError>, elapsed: Duration) {
        let counters = self.counters(ctx.step_type);
        counters
            .total_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        match result {
            Ok(_) => counters.succeeded.fetch_add(1, Ordering::Relaxed),
            Err(_) => counters.failed.fetch_add(1, Ordering::Relaxed),
        };
    }
}

impl<T: StepMiddleware + ?Sized> StepMiddleware for Arc<T> {
    fn before(&self, ctx: &StepContext) {
        (**self).before(ctx)
    }

    fn after(&self, ctx: &StepContext, result: &Result<StepOutput, StepError>, elapsed: Duration) {
        (**self).after(ctx, result, elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weftcore::WorkflowStep;

    #[test]
    fn metrics_count_per_step_type() {
        let metrics = StepMetrics::new();
        let step = WorkflowStep::new("s", StepType::IntegrationCall);
        let ctx = StepContext::new(uuid::Uuid::nil(), &step, HashMap::new());

        metrics.before(&ctx);
        metrics.after(&ctx, &Ok(StepOutput::default()), Duration::from_millis(5));
        metrics.before(&ctx);
        metrics.after(&ctx, &Err(StepError::Timeout { ms: 1 }), Duration::from_millis(1));

        let snapshot = metrics.snapshot()[&StepType::IntegrationCall];
        assert_eq!(snapshot.dispatched, 2);
        assert_eq!(snapshot.succeeded, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.total_ms, 6);
    }
}
