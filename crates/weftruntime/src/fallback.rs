use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use weftcore::{StepContext, StepError, StepExecutor, StepOutput, StepType, WorkflowStep};

/// Decides what happens after a step has exhausted its retries or failed in
/// a way retries cannot fix.
#[async_trait]
pub trait FallbackPolicy: Send + Sync {
    fn should_fallback(&self, step: &WorkflowStep, error: &StepError) -> bool;

    /// Run the alternate path. `ctx` carries the resolved parameters and the
    /// primary error in `prior_error`.
    async fn execute_fallback(&self, ctx: StepContext, step: &WorkflowStep, error: &StepError) -> Result<StepOutput, StepError>;
}

/// Never substitutes anything; failures surface as they are.
pub struct NoFallback;

#[async_trait]
impl FallbackPolicy for NoFallback {
    fn should_fallback(&self, _step: &WorkflowStep, _error: &StepError) -> bool {
        false
    }

    async fn execute_fallback(&self, _ctx: StepContext, _step: &WorkflowStep, error: &StepError) -> Result<StepOutput, StepError> {
        Err(error.clone())
    }
}

/// Substitutes a registered alternate strategy, looked up by the step's
/// service first and its step type second.
pub struct SelfHealingPolicy {
    by_service: HashMap<String, Arc<dyn StepExecutor>>,
    by_type: HashMap<StepType, Arc<dyn StepExecutor>>,
    on_transient: bool,
    on_permanent: bool,
}

impl SelfHealingPolicy {
    pub fn new() -> Self {
        Self {
            by_service: HashMap::new(),
            by_type: HashMap::new(),
            on_transient: true,
            on_permanent: true,
        }
    }

    pub fn with_service_strategy(mut self, service: impl Into<String>, strategy: Arc<dyn StepExecutor>) -> Self {
        self.by_service.insert(service.into(), strategy);
        self
    }

    pub fn with_type_strategy(mut self, step_type: StepType, strategy: Arc<dyn StepExecutor>) -> Self {
        self.by_type.insert(step_type, strategy);
        self
    }

    /// Whether transient (network, timeout) failures may be healed.
    pub fn on_transient(mut self, enabled: bool) -> Self {
        self.on_transient = enabled;
        self
    }

    /// Whether permanent (validation, not found) failures may be healed.
    pub fn on_permanent(mut self, enabled: bool) -> Self {
        self.on_permanent = enabled;
        self
    }

    fn strategy_for(&self, step: &WorkflowStep) -> Option<&Arc<dyn StepExecutor>> {
        step.service
            .as_deref()
            .and_then(|s| self.by_service.get(s))
            .or_else(|| self.by_type.get(&step.step_type))
    }
}

impl Default for SelfHealingPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FallbackPolicy for SelfHealingPolicy {
    fn should_fallback(&self, step: &WorkflowStep, error: &StepError) -> bool {
        let eligible = match error {
            StepError::MissingInput(_) | StepError::Cancelled => false,
            e if e.is_retryable() => self.on_transient,
            _ => self.on_permanent,
        };
        eligible && self.strategy_for(step).is_some()
    }

    async fn execute_fallback(&self, ctx: StepContext, step: &WorkflowStep, error: &StepError) -> Result<StepOutput, StepError> {
        let Some(strategy) = self.strategy_for(step) else {
            return Err(error.clone());
        };
        tracing::info!(
            execution_id = %ctx.execution_id,
            step_id = %step.step_id,
            strategy = strategy.name(),
            "running fallback after: {}", error
        );
        strategy.execute(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Operator;

    #[async_trait]
    impl StepExecutor for Operator {
        fn name(&self) -> &str {
            "operator"
        }

        async fn execute(&self, ctx: StepContext) -> Result<StepOutput, StepError> {
            let reason = ctx.prior_error.map(|e| e.kind().to_string()).unwrap_or_default();
            Ok(StepOutput::default().with_output("reason", reason))
        }
    }

    fn step(service: &str) -> WorkflowStep {
        WorkflowStep::new("send", StepType::IntegrationCall).with_service(service)
    }

    #[test]
    fn eligibility_depends_on_error_class_and_strategy() {
        let policy = SelfHealingPolicy::new()
            .with_service_strategy("slack", Arc::new(Operator))
            .on_permanent(false);

        let network = StepError::transient("network", "reset");
        assert!(policy.should_fallback(&step("slack"), &network));
        assert!(!policy.should_fallback(&step("xero"), &network));
        assert!(!policy.should_fallback(&step("slack"), &StepError::permanent("validation", "bad")));
        assert!(!policy.should_fallback(&step("slack"), &StepError::MissingInput(vec!["to".into()])));
        assert!(!policy.should_fallback(&step("slack"), &StepError::Cancelled));
        assert!(!NoFallback.should_fallback(&step("slack"), &network));
    }

    #[test]
    fn type_strategy_applies_when_no_service_matches() {
        let policy = SelfHealingPolicy::new().with_type_strategy(StepType::IntegrationCall, Arc::new(Operator));
        assert!(policy.should_fallback(&step("anything"), &StepError::Timeout { ms: 5 }));
    }

    #[tokio::test]
    async fn fallback_sees_prior_error() {
        let policy = SelfHealingPolicy::new().with_service_strategy("slack", Arc::new(Operator));
        let s = step("slack");
        let error = StepError::transient("rate_limit", "429");
        let mut ctx = StepContext::new(uuid::Uuid::nil(), &s, HashMap::new());
        ctx.prior_error = Some(error.clone());

        let out = policy.execute_fallback(ctx, &s, &error).await.unwrap();
        assert_eq!(out.value.get_path(&["reason"]).and_then(|v| v.as_str()), Some("rate_limit"));
    }
}
