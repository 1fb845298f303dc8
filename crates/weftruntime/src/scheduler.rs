//! Wavefront DAG executor.
//!
//! Each pass computes the ready set (steps whose dependencies all have
//! results), resolves their parameters, dispatches the runnable ones
//! concurrently and waits for the whole wave before looking again. A step
//! that is missing input is parked; unrelated branches keep going. When
//! nothing is ready the execution is concluded as completed, paused, failed
//! or deadlocked.

use crate::graph::DependencyGraph;
use crate::notifier::Notifier;
use crate::resolver::VariableResolver;
use crate::retry::{StepReport, StepRunner};
use crate::state::ExecutionStateStore;
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use weftcore::{
    ChildRunner, ConditionOperator, EngineError, ExecutedVia, ExecutionEvent, ExecutionStatus, StepContext, StepError, StepFailure,
    StepOutput, StepResult, Value, WorkflowContext, WorkflowDefinition, WorkflowStep,
};

/// Sub-workflows nested deeper than this fail instead of recursing.
pub const MAX_NESTING: u32 = 8;

pub struct RunOptions<'a> {
    /// Where results and the header are checkpointed; `None` for
    /// sub-workflows, which live only inside their parent step.
    pub state: Option<&'a ExecutionStateStore>,
    pub cancel: CancellationToken,
    pub nesting: u32,
}

impl RunOptions<'_> {
    pub fn detached() -> Self {
        RunOptions {
            state: None,
            cancel: CancellationToken::new(),
            nesting: 0,
        }
    }
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    runner: StepRunner,
    resolver: VariableResolver,
    notifier: Notifier,
    max_parallel: usize,
}

enum Prepared {
    Run(HashMap<String, Value>),
    Skip,
    Blocked(BTreeSet<String>),
}

impl Scheduler {
    pub fn new(runner: StepRunner, resolver: VariableResolver, notifier: Notifier, max_parallel: usize) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                runner,
                resolver,
                notifier,
                max_parallel: max_parallel.max(1),
            }),
        }
    }

    pub fn resolver(&self) -> &VariableResolver {
        &self.inner.resolver
    }

    pub fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    pub fn runner(&self) -> &StepRunner {
        &self.inner.runner
    }

    /// Drive a `Running` execution until nothing more can be done in this
    /// pass. Results already present in `ctx` are never re-run.
    ///
    /// Returns an error only when persistence fails; step failures and
    /// deadlocks are recorded on the returned context.
    pub async fn run(
        &self,
        definition: &WorkflowDefinition,
        mut ctx: WorkflowContext,
        options: RunOptions<'_>,
    ) -> Result<WorkflowContext, EngineError> {
        let graph = DependencyGraph::build(definition);
        for dangling in graph.dangling() {
            tracing::debug!(
                execution_id = %ctx.execution_id,
                step_id = %dangling.step_id,
                "reference '{}' names no step", dangling.reference
            );
        }

        // Blocked steps are re-evaluated on every pass.
        ctx.blocked_steps.clear();
        let mut wave = 0u32;

        loop {
            if options.cancel.is_cancelled() {
                tracing::info!(execution_id = %ctx.execution_id, wave, "cancellation observed between waves");
                break;
            }

            let ready = ready_steps(definition, &graph, &ctx);
            if ready.is_empty() {
                break;
            }
            wave += 1;
            tracing::debug!(
                execution_id = %ctx.execution_id,
                wave,
                steps = ?ready.iter().map(|s| s.step_id.as_str()).collect::<Vec<_>>(),
                "wave ready"
            );

            let mut runnable = Vec::new();
            for step in ready {
                match self.prepare(step, &ctx) {
                    Prepared::Run(parameters) => runnable.push((step, parameters)),
                    Prepared::Skip => {
                        tracing::info!(execution_id = %ctx.execution_id, step_id = %step.step_id, "conditions not met, skipping");
                        let result = StepResult::new(Value::Null, ExecutedVia::Skipped, 0, 0);
                        self.record_completed(&mut ctx, &step.step_id, result, &options).await?;
                    }
                    Prepared::Blocked(missing) => {
                        tracing::info!(
                            execution_id = %ctx.execution_id,
                            step_id = %step.step_id,
                            missing = ?missing,
                            "step is waiting for input"
                        );
                        ctx.record_blocked(&step.step_id, missing);
                    }
                }
            }

            for (step_id, report) in self.run_wave(runnable, &ctx, &options).await {
                match report {
                    StepReport::Completed(result) => {
                        self.record_completed(&mut ctx, &step_id, result, &options).await?;
                    }
                    StepReport::Missing(missing) => {
                        tracing::info!(
                            execution_id = %ctx.execution_id,
                            step_id = %step_id,
                            missing = ?missing,
                            "executor reported missing input"
                        );
                        ctx.record_blocked(&step_id, missing);
                    }
                    StepReport::Failed(failure) => {
                        tracing::warn!(
                            execution_id = %ctx.execution_id,
                            step_id = %step_id,
                            kind = %failure.kind,
                            attempts = failure.attempts,
                            "step failed: {}", failure.message
                        );
                        ctx.record_failure(&step_id, failure);
                    }
                }
            }

            if let Some(state) = options.state {
                state.save_header(&ctx).await?;
            }
        }

        self.conclude(&graph, &mut ctx, &options)?;
        if let Some(state) = options.state {
            state.save_header(&ctx).await?;
        }
        if options.nesting == 0 {
            self.announce(&ctx);
        }
        Ok(ctx)
    }

    /// Resolve parameters and conditions against the current context.
    fn prepare(&self, step: &WorkflowStep, ctx: &WorkflowContext) -> Prepared {
        let resolver = &self.inner.resolver;
        let (parameters, unresolved) = resolver.resolve_parameters(&step.parameters, ctx);

        let mut missing: BTreeSet<String> = unresolved
            .into_iter()
            .filter(|(key, _)| step.is_required(key))
            .flat_map(|(_, names)| names)
            .collect();

        let mut conditions_hold = true;
        for condition in &step.conditions {
            let (mut left, left_missing) = resolver.resolve_reporting(&condition.left, ctx);
            let (right, right_missing) = resolver.resolve_reporting(&condition.right, ctx);
            // presence checks answer "no" for an absent operand instead of waiting on it
            match condition.operator {
                ConditionOperator::Exists | ConditionOperator::Truthy if !left_missing.is_empty() => {
                    left = Value::Null;
                }
                _ => missing.extend(left_missing),
            }
            missing.extend(right_missing);
            conditions_hold &= condition.operator.evaluate(&left, &right);
        }

        if !missing.is_empty() {
            Prepared::Blocked(missing)
        } else if conditions_hold {
            Prepared::Run(parameters)
        } else {
            Prepared::Skip
        }
    }

    /// Dispatch one wave, at most `max_parallel` steps at a time, and wait
    /// for all of it.
    async fn run_wave(
        &self,
        runnable: Vec<(&WorkflowStep, HashMap<String, Value>)>,
        ctx: &WorkflowContext,
        options: &RunOptions<'_>,
    ) -> Vec<(String, StepReport)> {
        let mut reports = Vec::with_capacity(runnable.len());
        let mut running = FuturesUnordered::new();
        let children: Arc<dyn ChildRunner> = Arc::new(self.clone());

        for (step, parameters) in runnable {
            if running.len() >= self.inner.max_parallel {
                if let Some(done) = running.next().await {
                    reports.push(done);
                }
            }

            let mut step_ctx = StepContext::new(ctx.execution_id, step, parameters);
            step_ctx.cancellation = options.cancel.child_token();
            step_ctx.children = Some(children.clone());
            step_ctx.nesting = options.nesting;

            self.inner.notifier.publish(ExecutionEvent::StepStarted {
                execution_id: ctx.execution_id,
                step_id: step.step_id.clone(),
                step_type: step.step_type.to_string(),
                timestamp: Utc::now(),
            });

            let runner = self.inner.runner.clone();
            let step = step.clone();
            let step_id = step.step_id.clone();
            let handle = tokio::spawn(async move { runner.run(&step, step_ctx).await });

            let notifier = self.inner.notifier.clone();
            let execution_id = ctx.execution_id;
            running.push(async move {
                let report = match handle.await {
                    Ok(report) => report,
                    Err(e) => {
                        tracing::error!(%execution_id, step_id = %step_id, "step task aborted: {}", e);
                        notifier.publish(ExecutionEvent::StepFailed {
                            execution_id,
                            step_id: step_id.clone(),
                            error: e.to_string(),
                            will_retry: false,
                            timestamp: Utc::now(),
                        });
                        StepReport::Failed(StepFailure {
                            kind: "panic".to_string(),
                            message: e.to_string(),
                            attempts: 1,
                        })
                    }
                };
                (step_id, report)
            });
        }

        while let Some(done) = running.next().await {
            reports.push(done);
        }
        reports
    }

    async fn record_completed(
        &self,
        ctx: &mut WorkflowContext,
        step_id: &str,
        result: StepResult,
        options: &RunOptions<'_>,
    ) -> Result<(), EngineError> {
        let event = ExecutionEvent::StepCompleted {
            execution_id: ctx.execution_id,
            step_id: step_id.to_string(),
            executed_via: result.executed_via,
            duration_ms: result.duration_ms,
            timestamp: Utc::now(),
        };
        if let Some(state) = options.state {
            state.save_result(ctx.execution_id, step_id, &result).await?;
        }
        if !ctx.record_result(step_id, result) {
            tracing::warn!(execution_id = %ctx.execution_id, step_id, "duplicate result ignored");
            return Ok(());
        }
        tracing::info!(execution_id = %ctx.execution_id, step_id, "step completed");
        self.inner.notifier.publish(event);
        Ok(())
    }

    /// Decide the status once nothing is ready. Precedence: all done,
    /// cancelled, deadlock, paused, failed.
    fn conclude(
        &self,
        graph: &DependencyGraph,
        ctx: &mut WorkflowContext,
        options: &RunOptions<'_>,
    ) -> Result<(), EngineError> {
        let pending: Vec<&String> = graph.order().iter().filter(|id| !ctx.is_completed(id)).collect();

        if pending.is_empty() {
            return ctx.mark_completed();
        }
        if options.cancel.is_cancelled() {
            return ctx.mark_cancelled();
        }

        let halted: Vec<&String> = ctx.blocked_steps.keys().chain(ctx.failed_steps.keys()).collect();
        let downstream = graph.transitive_dependents(halted.iter().copied());
        let stuck: Vec<String> = pending
            .into_iter()
            .filter(|id| {
                !ctx.blocked_steps.contains_key(*id)
                    && !ctx.failed_steps.contains_key(*id)
                    && !downstream.contains(*id)
            })
            .cloned()
            .collect();

        if !stuck.is_empty() {
            let cycles = graph
                .cycles()
                .into_iter()
                .filter(|cycle| cycle.iter().any(|id| stuck.contains(id)))
                .collect();
            let error = EngineError::Deadlock { steps: stuck, cycles };
            tracing::error!(execution_id = %ctx.execution_id, "{}", error);
            return ctx.mark_failed(error.kind(), error.to_string());
        }

        if !ctx.blocked_steps.is_empty() {
            return ctx.mark_paused();
        }

        let summary: Vec<String> = ctx
            .failed_steps
            .iter()
            .map(|(id, f)| format!("{} ({}): {}", id, f.kind, f.message))
            .collect();
        let kind = match ctx.failed_steps.values().next() {
            Some(only) if ctx.failed_steps.len() == 1 => only.kind.clone(),
            _ => "step_failed".to_string(),
        };
        ctx.mark_failed(kind, format!("steps failed: {}", summary.join("; ")))
    }

    fn announce(&self, ctx: &WorkflowContext) {
        let execution_id = ctx.execution_id;
        let timestamp = Utc::now();
        let event = match ctx.status {
            ExecutionStatus::Completed => {
                let duration_ms = ctx
                    .started_at
                    .map(|at| (timestamp - at).num_milliseconds().max(0) as u64)
                    .unwrap_or(0);
                tracing::info!(%execution_id, duration_ms, "workflow completed");
                ExecutionEvent::WorkflowCompleted {
                    execution_id,
                    duration_ms,
                    timestamp,
                }
            }
            ExecutionStatus::Paused => {
                tracing::info!(%execution_id, missing = ?ctx.missing_parameters, "workflow paused");
                ExecutionEvent::WorkflowPaused {
                    execution_id,
                    missing: ctx.missing_parameters.iter().cloned().collect(),
                    timestamp,
                }
            }
            ExecutionStatus::Failed => ExecutionEvent::WorkflowFailed {
                execution_id,
                error: ctx.error_message.clone().unwrap_or_default(),
                failed_steps: ctx
                    .failed_steps
                    .iter()
                    .map(|(id, f)| (id.clone(), f.message.clone()))
                    .collect::<BTreeMap<_, _>>(),
                timestamp,
            },
            ExecutionStatus::Cancelled => {
                tracing::info!(%execution_id, "workflow cancelled");
                ExecutionEvent::WorkflowCancelled {
                    execution_id,
                    timestamp,
                }
            }
            ExecutionStatus::Pending | ExecutionStatus::Running => return,
        };
        self.inner.notifier.publish(event);
    }
}

/// Steps whose dependencies all have results and that have not completed,
/// failed or blocked yet, in declaration order.
fn ready_steps<'a>(
    definition: &'a WorkflowDefinition,
    graph: &DependencyGraph,
    ctx: &WorkflowContext,
) -> Vec<&'a WorkflowStep> {
    definition
        .steps
        .iter()
        .filter(|step| {
            let id = step.step_id.as_str();
            !ctx.is_completed(id)
                && !ctx.failed_steps.contains_key(id)
                && !ctx.blocked_steps.contains_key(id)
                && graph
                    .dependencies_of(id)
                    .is_some_and(|deps| deps.iter().all(|dep| ctx.is_completed(dep)))
        })
        .collect()
}

#[async_trait]
impl ChildRunner for Scheduler {
    async fn run_step(&self, parent: &StepContext, step: WorkflowStep) -> Result<StepOutput, StepError> {
        let mut ctx = StepContext::new(parent.execution_id, &step, step.parameters.clone());
        ctx.cancellation = parent.cancellation.child_token();
        ctx.children = parent.children.clone();
        ctx.nesting = parent.nesting;

        match self.inner.runner.run(&step, ctx).await {
            StepReport::Completed(result) => {
                Ok(StepOutput::new(result.output).with_metadata("executed_via", result.executed_via.to_string()))
            }
            StepReport::Missing(names) => Err(StepError::MissingInput(names.into_iter().collect())),
            StepReport::Failed(failure) => Err(StepError::permanent(failure.kind, failure.message)),
        }
    }

    async fn run_workflow(
        &self,
        parent: &StepContext,
        definition: &WorkflowDefinition,
        variables: HashMap<String, Value>,
    ) -> Result<StepOutput, StepError> {
        if parent.nesting >= MAX_NESTING {
            return Err(StepError::permanent(
                "nesting_limit",
                format!("sub-workflows nest deeper than {}", MAX_NESTING),
            ));
        }
        definition
            .validate()
            .map_err(|e| StepError::permanent("invalid_workflow", e.to_string()))?;

        let mut ctx = WorkflowContext::new(definition.id, variables);
        ctx.mark_running()
            .map_err(|e| StepError::permanent(e.kind(), e.to_string()))?;
        tracing::info!(
            execution_id = %parent.execution_id,
            step_id = %parent.step_id,
            child = %ctx.execution_id,
            "starting sub-workflow '{}'", definition.name
        );

        let options = RunOptions {
            state: None,
            cancel: parent.cancellation.child_token(),
            nesting: parent.nesting + 1,
        };
        let done = self
            .run(definition, ctx, options)
            .await
            .map_err(|e| StepError::permanent(e.kind(), e.to_string()))?;

        match done.status {
            ExecutionStatus::Completed => {
                let outputs: HashMap<String, Value> = done
                    .results
                    .into_iter()
                    .map(|(id, result)| (id, result.output))
                    .collect();
                Ok(StepOutput::new(outputs).with_metadata("execution_id", done.execution_id.to_string()))
            }
            ExecutionStatus::Paused => Err(StepError::MissingInput(done.missing_parameters.into_iter().collect())),
            ExecutionStatus::Cancelled => Err(StepError::Cancelled),
            _ => Err(StepError::permanent(
                "sub_workflow_failed",
                done.error_message.unwrap_or_else(|| "sub-workflow failed".to_string()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::StepDispatcher;
    use crate::fallback::NoFallback;
    use weftcore::{ConditionOperator, RetryPolicy, StepCondition, StepExecutor, StepType};

    /// Echoes its resolved parameters back as the output object.
    struct Echo;

    #[async_trait]
    impl StepExecutor for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(&self, ctx: StepContext) -> Result<StepOutput, StepError> {
            Ok(StepOutput::new(ctx.parameters))
        }
    }

    fn scheduler() -> Scheduler {
        let mut dispatcher = StepDispatcher::new();
        dispatcher.register(StepType::SystemReasoning, Arc::new(Echo));
        let runner = StepRunner::new(
            Arc::new(dispatcher),
            Arc::new(NoFallback),
            Notifier::disabled(),
            RetryPolicy::none(),
        );
        Scheduler::new(runner, VariableResolver::default(), Notifier::disabled(), 4)
    }

    fn step(id: &str) -> WorkflowStep {
        WorkflowStep::new(id, StepType::SystemReasoning)
    }

    fn running(def: &WorkflowDefinition, vars: &[(&str, &str)]) -> WorkflowContext {
        let vars = vars.iter().map(|(k, v)| (k.to_string(), Value::from(*v))).collect();
        let mut ctx = WorkflowContext::new(def.id, vars);
        ctx.mark_running().unwrap();
        ctx
    }

    #[tokio::test]
    async fn optional_parameters_do_not_block() {
        let def = WorkflowDefinition::new("optional").with_step(
            step("greet")
                .with_parameter("name", "{{name}}")
                .with_parameter("title", "{{title}}")
                .optional("title"),
        );
        let done = scheduler()
            .run(&def, running(&def, &[("name", "Ada")]), RunOptions::detached())
            .await
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        let output = &done.results["greet"].output;
        assert_eq!(output.get_path(&["title"]), Some(&Value::from("{{title}}")));
    }

    #[tokio::test]
    async fn false_conditions_skip_the_step() {
        let def = WorkflowDefinition::new("conditions")
            .with_step(step("score").with_parameter("value", "2"))
            .with_step(
                step("alert")
                    .with_condition(StepCondition::new("{{score.value}}", ConditionOperator::Gt, 5))
                    .with_parameter("msg", "high"),
            );
        let done = scheduler()
            .run(&def, running(&def, &[]), RunOptions::detached())
            .await
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(done.results["alert"].executed_via, ExecutedVia::Skipped);
        assert_eq!(done.results["alert"].output, Value::Null);
    }

    #[tokio::test]
    async fn absent_operand_fails_presence_checks() {
        let guarded = |id: &str, operator: ConditionOperator| {
            step(id)
                .with_condition(StepCondition::new("{{coupon}}", operator, Value::Null))
                .with_parameter("msg", "discount")
        };
        let def = WorkflowDefinition::new("coupon")
            .with_step(guarded("apply", ConditionOperator::Exists))
            .with_step(guarded("flag", ConditionOperator::Truthy));

        let done = scheduler()
            .run(&def, running(&def, &[]), RunOptions::detached())
            .await
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert!(done.missing_parameters.is_empty());
        assert_eq!(done.results["apply"].executed_via, ExecutedVia::Skipped);
        assert_eq!(done.results["flag"].executed_via, ExecutedVia::Skipped);

        let done = scheduler()
            .run(&def, running(&def, &[("coupon", "SAVE10")]), RunOptions::detached())
            .await
            .unwrap();
        assert_eq!(done.results["apply"].executed_via, ExecutedVia::Primary);
    }

    #[tokio::test]
    async fn absent_operand_still_blocks_comparisons() {
        let def = WorkflowDefinition::new("compare").with_step(
            step("alert").with_condition(StepCondition::new("{{score}}", ConditionOperator::Gt, 5)),
        );
        let done = scheduler()
            .run(&def, running(&def, &[]), RunOptions::detached())
            .await
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Paused);
        assert_eq!(done.missing_parameters, BTreeSet::from(["score".to_string()]));
    }

    #[tokio::test]
    async fn failure_downstream_is_not_a_deadlock() {
        let def = WorkflowDefinition::new("no executor")
            .with_step(WorkflowStep::new("call", StepType::HumanInput))
            .with_step(step("after").with_dependency("call"))
            .with_step(step("independent"));
        let done = scheduler()
            .run(&def, running(&def, &[]), RunOptions::detached())
            .await
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Failed);
        assert_eq!(done.error_kind.as_deref(), Some("no_executor"));
        assert!(done.error_message.unwrap().contains("call"));
        assert!(done.results.contains_key("independent"));
        assert!(!done.results.contains_key("after"));
    }

    #[tokio::test]
    async fn sub_workflows_run_nested() {
        let child = WorkflowDefinition::new("child")
            .with_step(step("inner").with_parameter("greeting", "hi {{who}}"));
        let parent_step = step("parent");
        let mut parent = StepContext::new(uuid::Uuid::new_v4(), &parent_step, HashMap::new());
        let sched = scheduler();
        parent.children = Some(Arc::new(sched.clone()));

        let out = sched
            .run_workflow(&parent, &child, HashMap::from([("who".to_string(), Value::from("Ada"))]))
            .await
            .unwrap();
        assert_eq!(out.value.get_path(&["inner", "greeting"]), Some(&Value::from("hi Ada")));

        let err = sched.run_workflow(&parent, &child, HashMap::new()).await.unwrap_err();
        assert_eq!(err, StepError::MissingInput(vec!["who".to_string()]));

        parent.nesting = MAX_NESTING;
        let err = sched.run_workflow(&parent, &child, HashMap::new()).await.unwrap_err();
        assert_eq!(err.kind(), "nesting_limit");
    }
}
