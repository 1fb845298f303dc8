use crate::middleware::StepMiddleware;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use weftcore::{ExecutorInfo, StepContext, StepError, StepExecutor, StepOutput, StepType};

/// Classified result of one dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Success(StepOutput),
    /// The executor asked for inputs nobody supplied.
    MissingInput(BTreeSet<String>),
    RetryableFailure(StepError),
    FatalFailure(StepError),
}

impl StepOutcome {
    pub fn classify(result: Result<StepOutput, StepError>) -> Self {
        match result {
            Ok(output) => StepOutcome::Success(output),
            Err(StepError::MissingInput(names)) if names.is_empty() => StepOutcome::FatalFailure(unnamed_missing_input()),
            Err(StepError::MissingInput(names)) => StepOutcome::MissingInput(names.into_iter().collect()),
            Err(e) if e.is_retryable() => StepOutcome::RetryableFailure(e),
            Err(e) => StepOutcome::FatalFailure(e),
        }
    }

    pub fn error(&self) -> Option<&StepError> {
        match self {
            StepOutcome::RetryableFailure(e) | StepOutcome::FatalFailure(e) => Some(e),
            _ => None,
        }
    }
}

/// A pause needs at least one name to wait for, so an empty request fails the
/// step instead.
pub(crate) fn unnamed_missing_input() -> StepError {
    StepError::permanent(
        "invalid_missing_input",
        "executor reported missing input without naming a parameter",
    )
}

/// Routes a step to its executor. One slot per `StepType` variant, plus
/// integration executors selected by the step's `service`.
#[derive(Clone)]
pub struct StepDispatcher {
    integration: Option<Arc<dyn StepExecutor>>,
    integrations: HashMap<String, Arc<dyn StepExecutor>>,
    conditional: Option<Arc<dyn StepExecutor>>,
    parallel: Option<Arc<dyn StepExecutor>>,
    reasoning: Option<Arc<dyn StepExecutor>>,
    sub_agent: Option<Arc<dyn StepExecutor>>,
    human_input: Option<Arc<dyn StepExecutor>>,
    middleware: Vec<Arc<dyn StepMiddleware>>,
    default_timeout: Duration,
}

impl StepDispatcher {
    pub fn new() -> Self {
        Self {
            integration: None,
            integrations: HashMap::new(),
            conditional: None,
            parallel: None,
            reasoning: None,
            sub_agent: None,
            human_input: None,
            middleware: Vec::new(),
            default_timeout: Duration::from_secs(300),
        }
    }

    fn slot_mut(&mut self, step_type: StepType) -> &mut Option<Arc<dyn StepExecutor>> {
        match step_type {
            StepType::IntegrationCall => &mut self.integration,
            StepType::ConditionalLogic => &mut self.conditional,
            StepType::ParallelGroup => &mut self.parallel,
            StepType::SystemReasoning => &mut self.reasoning,
            StepType::SubAgentSpawn => &mut self.sub_agent,
            StepType::HumanInput => &mut self.human_input,
        }
    }

    fn slot(&self, step_type: StepType) -> Option<&Arc<dyn StepExecutor>> {
        match step_type {
            StepType::IntegrationCall => self.integration.as_ref(),
            StepType::ConditionalLogic => self.conditional.as_ref(),
            StepType::ParallelGroup => self.parallel.as_ref(),
            StepType::SystemReasoning => self.reasoning.as_ref(),
            StepType::SubAgentSpawn => self.sub_agent.as_ref(),
            StepType::HumanInput => self.human_input.as_ref(),
        }
    }

    /// Install the executor for a step type, replacing any previous one. For
    /// integration calls this is the executor used when no service matches.
    pub fn register(&mut self, step_type: StepType, executor: Arc<dyn StepExecutor>) {
        tracing::info!("Registering {} executor: {}", step_type, executor.name());
        *self.slot_mut(step_type) = Some(executor);
    }

    /// Install the executor for integration calls targeting `service`.
    pub fn register_integration(&mut self, service: impl Into<String>, executor: Arc<dyn StepExecutor>) {
        let service = service.into();
        tracing::info!("Registering integration '{}': {}", service, executor.name());
        self.integrations.insert(service, executor);
    }

    pub fn add_middleware(&mut self, middleware: Arc<dyn StepMiddleware>) {
        self.middleware.push(middleware);
    }

    pub fn with_middleware(mut self, middleware: Arc<dyn StepMiddleware>) -> Self {
        self.add_middleware(middleware);
        self
    }

    pub fn set_default_timeout(&mut self, timeout: Duration) {
        self.default_timeout = timeout;
    }

    pub fn executor_for(&self, step_type: StepType, service: Option<&str>) -> Result<&Arc<dyn StepExecutor>, StepError> {
        if step_type == StepType::IntegrationCall {
            if let Some(executor) = service.and_then(|s| self.integrations.get(s)) {
                return Ok(executor);
            }
        }
        self.slot(step_type).ok_or_else(|| match service {
            Some(service) if step_type == StepType::IntegrationCall => {
                StepError::NoExecutor(format!("{} (service '{}')", step_type, service))
            }
            _ => StepError::NoExecutor(step_type.to_string()),
        })
    }

    /// Run one attempt: middleware `before`, the executor under a timeout,
    /// middleware `after`, then classification.
    pub async fn dispatch(&self, ctx: StepContext, timeout: Option<Duration>) -> StepOutcome {
        let executor = match self.executor_for(ctx.step_type, ctx.service.as_deref()) {
            Ok(executor) => executor.clone(),
            Err(e) => return StepOutcome::FatalFailure(e),
        };
        let limit = timeout.unwrap_or(self.default_timeout);

        for m in &self.middleware {
            m.before(&ctx);
        }

        let start = Instant::now();
        let result = match tokio::time::timeout(limit, executor.execute(ctx.clone())).await {
            Ok(result) => result,
            Err(_) => Err(StepError::Timeout {
                ms: limit.as_millis() as u64,
            }),
        };
        let elapsed = start.elapsed();

        for m in self.middleware.iter().rev() {
            m.after(&ctx, &result, elapsed);
        }

        StepOutcome::classify(result)
    }

    /// Descriptions of every registered executor, keyed by slot label.
    pub fn list(&self) -> Vec<(String, ExecutorInfo)> {
        let mut out: Vec<(String, ExecutorInfo)> = StepType::ALL
            .iter()
            .filter_map(|t| self.slot(*t).map(|e| (t.to_string(), e.describe())))
            .collect();
        let mut services: Vec<_> = self.integrations.iter().collect();
        services.sort_by(|a, b| a.0.cmp(b.0));
        out.extend(
            services
                .into_iter()
                .map(|(service, e)| (format!("{}:{}", StepType::IntegrationCall, service), e.describe())),
        );
        out
    }
}

impl Default for StepDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use weftcore::{Value, WorkflowStep};

    struct Named(&'static str);

    #[async_trait]
    impl StepExecutor for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn execute(&self, _ctx: StepContext) -> Result<StepOutput, StepError> {
            Ok(StepOutput::new(self.0))
        }
    }

    struct Slow;

    #[async_trait]
    impl StepExecutor for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn execute(&self, _ctx: StepContext) -> Result<StepOutput, StepError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(StepOutput::default())
        }
    }

    fn ctx(step_type: StepType, service: Option<&str>) -> StepContext {
        let mut step = WorkflowStep::new("s", step_type);
        step.service = service.map(str::to_string);
        StepContext::new(uuid::Uuid::nil(), &step, HashMap::new())
    }

    #[tokio::test]
    async fn routes_by_type_and_service() {
        let mut dispatcher = StepDispatcher::new();
        dispatcher.register(StepType::SystemReasoning, Arc::new(Named("system")));
        dispatcher.register(StepType::IntegrationCall, Arc::new(Named("generic")));
        dispatcher.register_integration("slack", Arc::new(Named("slack")));

        let out = dispatcher.dispatch(ctx(StepType::IntegrationCall, Some("slack")), None).await;
        assert_eq!(out, StepOutcome::Success(StepOutput::new("slack")));

        let out = dispatcher.dispatch(ctx(StepType::IntegrationCall, Some("xero")), None).await;
        assert_eq!(out, StepOutcome::Success(StepOutput::new("generic")));

        let out = dispatcher.dispatch(ctx(StepType::SystemReasoning, None), None).await;
        assert_eq!(out, StepOutcome::Success(StepOutput::new(Value::from("system"))));

        let out = dispatcher.dispatch(ctx(StepType::HumanInput, None), None).await;
        assert!(matches!(out, StepOutcome::FatalFailure(StepError::NoExecutor(_))));
    }

    #[tokio::test]
    async fn timeout_is_retryable() {
        let mut dispatcher = StepDispatcher::new();
        dispatcher.register(StepType::SystemReasoning, Arc::new(Slow));
        let out = dispatcher
            .dispatch(ctx(StepType::SystemReasoning, None), Some(Duration::from_millis(20)))
            .await;
        assert_eq!(out, StepOutcome::RetryableFailure(StepError::Timeout { ms: 20 }));
    }

    #[test]
    fn classification() {
        assert!(matches!(
            StepOutcome::classify(Err(StepError::MissingInput(vec!["b".into(), "a".into()]))),
            StepOutcome::MissingInput(names) if names.len() == 2
        ));
        assert!(matches!(
            StepOutcome::classify(Err(StepError::transient("network", "reset"))),
            StepOutcome::RetryableFailure(_)
        ));
        assert!(matches!(
            StepOutcome::classify(Err(StepError::invalid("email", "malformed"))),
            StepOutcome::FatalFailure(_)
        ));
        assert!(matches!(
            StepOutcome::classify(Err(StepError::MissingInput(Vec::new()))),
            StepOutcome::FatalFailure(e) if e.kind() == "invalid_missing_input" && !e.is_retryable()
        ));
    }

    #[test]
    fn list_includes_services() {
        let mut dispatcher = StepDispatcher::new();
        dispatcher.register(StepType::SystemReasoning, Arc::new(Named("system")));
        dispatcher.register_integration("http", Arc::new(Named("http")));
        let labels: Vec<String> = dispatcher.list().into_iter().map(|(label, _)| label).collect();
        assert_eq!(labels, vec!["system-reasoning", "integration-call:http"]);
    }
}
