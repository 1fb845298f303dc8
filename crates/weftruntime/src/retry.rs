//! Per-step attempt loop: dispatch, back off and retry, then fall back.

use crate::dispatcher::{unnamed_missing_input, StepDispatcher, StepOutcome};
use crate::fallback::FallbackPolicy;
use crate::notifier::Notifier;
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use weftcore::{
    ExecutedVia, ExecutionEvent, RetryPolicy, StepContext, StepError, StepFailure, StepResult, WorkflowStep,
};

/// Final outcome of one step after retries and fallback.
#[derive(Debug, Clone, PartialEq)]
pub enum StepReport {
    Completed(StepResult),
    Missing(BTreeSet<String>),
    Failed(StepFailure),
}

#[derive(Clone)]
pub struct StepRunner {
    dispatcher: Arc<StepDispatcher>,
    fallback: Arc<dyn FallbackPolicy>,
    notifier: Notifier,
    default_retry: RetryPolicy,
}

impl StepRunner {
    pub fn new(
        dispatcher: Arc<StepDispatcher>,
        fallback: Arc<dyn FallbackPolicy>,
        notifier: Notifier,
        default_retry: RetryPolicy,
    ) -> Self {
        Self {
            dispatcher,
            fallback,
            notifier,
            default_retry,
        }
    }

    pub fn dispatcher(&self) -> &Arc<StepDispatcher> {
        &self.dispatcher
    }

    /// Run `step` with already-resolved parameters in `ctx`.
    pub async fn run(&self, step: &WorkflowStep, mut ctx: StepContext) -> StepReport {
        let policy = step.retry_policy.as_ref().unwrap_or(&self.default_retry);
        let timeout = step.timeout_ms.map(Duration::from_millis);
        let start = Instant::now();
        let mut attempt = 1;

        let error = loop {
            ctx.attempt = attempt;
            let outcome = self.dispatcher.dispatch(ctx.clone(), timeout).await;
            let error = match outcome {
                StepOutcome::Success(output) => {
                    return StepReport::Completed(StepResult::new(
                        output.value,
                        ExecutedVia::Primary,
                        attempt,
                        start.elapsed().as_millis() as u64,
                    ));
                }
                StepOutcome::MissingInput(names) => return StepReport::Missing(names),
                StepOutcome::RetryableFailure(e) | StepOutcome::FatalFailure(e) => e,
            };

            let will_retry = policy.should_retry(&error, attempt) && !ctx.cancellation.is_cancelled();
            self.notifier.publish(ExecutionEvent::StepFailed {
                execution_id: ctx.execution_id,
                step_id: step.step_id.clone(),
                error: error.to_string(),
                will_retry,
                timestamp: Utc::now(),
            });
            if !will_retry {
                break error;
            }

            let delay = backoff(policy, attempt);
            tracing::info!(
                execution_id = %ctx.execution_id,
                step_id = %step.step_id,
                attempt,
                "retrying in {:?} after: {}", delay, error
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.cancellation.cancelled() => break error,
            }
            attempt += 1;
        };

        if !self.fallback.should_fallback(step, &error) {
            return StepReport::Failed(failure(&error, attempt));
        }

        let mut fallback_ctx = ctx;
        fallback_ctx.prior_error = Some(error.clone());
        match self.fallback.execute_fallback(fallback_ctx, step, &error).await {
            Ok(output) => StepReport::Completed(StepResult::new(
                output.value,
                ExecutedVia::Fallback,
                attempt,
                start.elapsed().as_millis() as u64,
            )),
            Err(StepError::MissingInput(names)) if names.is_empty() => {
                StepReport::Failed(failure(&unnamed_missing_input(), attempt))
            }
            Err(StepError::MissingInput(names)) => StepReport::Missing(names.into_iter().collect()),
            Err(fallback_error) => {
                tracing::warn!(
                    step_id = %step.step_id,
                    "fallback failed: {} (primary: {})", fallback_error, error
                );
                StepReport::Failed(failure(&fallback_error, attempt))
            }
        }
    }
}

/// Delay before the next attempt, with up to 25% random jitter when the
/// policy asks for it.
fn backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
    let delay = policy.delay_for_attempt(attempt);
    if policy.jitter {
        delay + delay.mul_f64(rand::random::<f64>() * 0.25)
    } else {
        delay
    }
}

fn failure(error: &StepError, attempts: u32) -> StepFailure {
    StepFailure {
        kind: error.kind().to_string(),
        message: error.message(),
        attempts,
    }
}
