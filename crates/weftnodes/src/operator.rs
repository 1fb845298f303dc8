use async_trait::async_trait;
use chrono::Utc;
use weftcore::{ExecutorInfo, StepContext, StepError, StepExecutor, StepOutput};

/// Fallback strategy that hands a failed step to a human operator.
///
/// Always succeeds with a low-trust placeholder so the rest of the workflow
/// can continue; downstream steps see `status = "queued_for_operator"`.
pub struct ManualOperatorFallback;

#[async_trait]
impl StepExecutor for ManualOperatorFallback {
    fn name(&self) -> &str {
        "manual-operator"
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, StepError> {
        let (reason, message) = match &ctx.prior_error {
            Some(e) => (e.kind().to_string(), e.message()),
            None => ("unknown".to_string(), String::new()),
        };
        tracing::warn!(
            execution_id = %ctx.execution_id,
            step_id = %ctx.step_id,
            "queued for manual operator after {}: {}", reason, message
        );

        let mut output = StepOutput::default()
            .with_output("status", "queued_for_operator")
            .with_output("step_id", ctx.step_id.clone())
            .with_output("reason", reason)
            .with_output("message", message)
            .with_output("queued_at", Utc::now().to_rfc3339())
            .with_metadata("trust", "low");
        if let Some(service) = &ctx.service {
            output = output.with_output("service", service.clone());
        }
        Ok(output)
    }

    fn describe(&self) -> ExecutorInfo {
        ExecutorInfo {
            name: self.name().to_string(),
            description: "Queue a failed step for a human operator".to_string(),
            parameters: Vec::new(),
        }
    }
}
