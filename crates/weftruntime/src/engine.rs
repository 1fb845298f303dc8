use crate::config::EngineConfig;
use crate::dispatcher::StepDispatcher;
use crate::fallback::{FallbackPolicy, NoFallback};
use crate::middleware::StepMiddleware;
use crate::notifier::Notifier;
use crate::resolver::VariableResolver;
use crate::retry::StepRunner;
use crate::scheduler::{RunOptions, Scheduler};
use crate::state::ExecutionStateStore;
use crate::store::{FileStateStore, MemoryStateStore, StateStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;
use weftcore::{
    EngineError, EventBus, ExecutionEvent, ExecutionId, ExecutionStatus, NotificationSink, Result, StepExecutor,
    StepFailure, StepResult, StepType, Value, WorkflowContext, WorkflowDefinition, WorkflowId,
};

/// Read-only view of one execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSnapshot {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub status: ExecutionStatus,
    pub results: BTreeMap<String, StepResult>,
    pub missing_parameters: BTreeSet<String>,
    pub blocked_steps: BTreeMap<String, BTreeSet<String>>,
    pub failed_steps: BTreeMap<String, StepFailure>,
    pub error_message: Option<String>,
    pub error_kind: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionSnapshot {
    pub fn output(&self, step_id: &str) -> Option<&Value> {
        self.results.get(step_id).map(|r| &r.output)
    }
}

impl From<WorkflowContext> for ExecutionSnapshot {
    fn from(ctx: WorkflowContext) -> Self {
        Self {
            execution_id: ctx.execution_id,
            workflow_id: ctx.workflow_id,
            status: ctx.status,
            results: ctx.results,
            missing_parameters: ctx.missing_parameters,
            blocked_steps: ctx.blocked_steps,
            failed_steps: ctx.failed_steps,
            error_message: ctx.error_message,
            error_kind: ctx.error_kind,
            started_at: ctx.started_at,
            completed_at: ctx.completed_at,
        }
    }
}

struct RunHandle {
    run_id: u64,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

struct EngineInner {
    scheduler: Scheduler,
    state: ExecutionStateStore,
    notifier: Notifier,
    events: EventBus,
    dispatcher: Arc<StepDispatcher>,
    config: EngineConfig,
    runs: Mutex<HashMap<ExecutionId, RunHandle>>,
    /// Serializes resume and cancel so a paused execution is never resumed
    /// twice or resumed while being cancelled.
    transitions: Mutex<()>,
    next_run: AtomicU64,
}

/// Entry point of the engine: starts, resumes, inspects and cancels
/// executions. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn dispatcher(&self) -> &Arc<StepDispatcher> {
        &self.inner.dispatcher
    }

    pub fn state(&self) -> &ExecutionStateStore {
        &self.inner.state
    }

    /// Subscribe to every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.inner.events.subscribe()
    }

    /// Validate, persist and start a run in the background. Returns as soon
    /// as the execution is `Running`.
    pub async fn start(&self, definition: WorkflowDefinition, variables: HashMap<String, Value>) -> Result<ExecutionId> {
        definition.validate()?;

        let mut ctx = WorkflowContext::new(definition.id, variables);
        let execution_id = ctx.execution_id;
        self.inner.state.create(&definition, &ctx).await?;
        ctx.mark_running()?;
        self.inner.state.save_header(&ctx).await?;

        tracing::info!(%execution_id, workflow = %definition.name, "starting workflow execution");
        self.inner.notifier.publish(ExecutionEvent::WorkflowStarted {
            execution_id,
            workflow_id: definition.id,
            timestamp: Utc::now(),
        });

        self.spawn_run(Arc::new(definition), ctx).await;
        Ok(execution_id)
    }

    /// Supply values for a paused execution and continue it. Steps that
    /// already have results are not run again.
    ///
    /// Fails with `NotResumable`, and changes nothing, unless the execution
    /// is currently paused.
    pub async fn resume(&self, execution_id: ExecutionId, supplied: HashMap<String, Value>) -> Result<()> {
        let _guard = self.inner.transitions.lock().await;

        let mut ctx = self.inner.state.load(execution_id).await?;
        let mut names: Vec<String> = supplied.keys().cloned().collect();
        names.sort();
        ctx.resume_with(supplied)?;

        let definition = self.inner.state.load_definition(execution_id).await?;
        self.inner.state.save_header(&ctx).await?;

        tracing::info!(%execution_id, supplied = ?names, "resuming workflow execution");
        self.inner.notifier.publish(ExecutionEvent::WorkflowResumed {
            execution_id,
            supplied: names,
            timestamp: Utc::now(),
        });

        self.spawn_run(Arc::new(definition), ctx).await;
        Ok(())
    }

    pub async fn get_state(&self, execution_id: ExecutionId) -> Result<ExecutionSnapshot> {
        Ok(self.inner.state.load(execution_id).await?.into())
    }

    /// Wait until the current run of `execution_id` stops (paused or
    /// terminal) and return its state.
    pub async fn wait(&self, execution_id: ExecutionId) -> Result<ExecutionSnapshot> {
        let done = {
            let runs = self.inner.runs.lock().await;
            runs.get(&execution_id).map(|handle| handle.done.clone())
        };
        if let Some(mut done) = done {
            // A closed channel means the run task is gone; the store has the rest.
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.get_state(execution_id).await
    }

    /// Start and wait for the first stop.
    pub async fn run_to_end(
        &self,
        definition: WorkflowDefinition,
        variables: HashMap<String, Value>,
    ) -> Result<ExecutionSnapshot> {
        let execution_id = self.start(definition, variables).await?;
        self.wait(execution_id).await
    }

    /// Cancel an execution. A running one stops between waves; a paused one
    /// is cancelled immediately.
    pub async fn cancel(&self, execution_id: ExecutionId) -> Result<()> {
        let _guard = self.inner.transitions.lock().await;

        let token = {
            let runs = self.inner.runs.lock().await;
            runs.get(&execution_id).map(|handle| handle.cancel.clone())
        };
        let mut ctx = self.inner.state.load(execution_id).await?;
        if let (ExecutionStatus::Running, Some(token)) = (ctx.status, token) {
            tracing::info!(%execution_id, "cancelling running execution");
            token.cancel();
            return Ok(());
        }

        ctx.mark_cancelled()?;
        self.inner.state.save_header(&ctx).await?;
        tracing::info!(%execution_id, "execution cancelled");
        self.inner.notifier.publish(ExecutionEvent::WorkflowCancelled {
            execution_id,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Re-enter every persisted execution that was running when the process
    /// stopped. Returns the ids that were restarted.
    pub async fn recover(&self) -> Result<Vec<ExecutionId>> {
        let mut recovered = Vec::new();
        for execution_id in self.inner.state.list().await? {
            if self.inner.runs.lock().await.contains_key(&execution_id) {
                continue;
            }
            let mut ctx = match self.inner.state.load(execution_id).await {
                Ok(ctx) => ctx,
                Err(e) => {
                    tracing::warn!(%execution_id, "cannot recover execution: {}", e);
                    continue;
                }
            };
            match ctx.status {
                ExecutionStatus::Running => {}
                ExecutionStatus::Pending => {
                    ctx.mark_running()?;
                    self.inner.state.save_header(&ctx).await?;
                }
                _ => continue,
            }
            let definition = self.inner.state.load_definition(execution_id).await?;
            tracing::info!(%execution_id, completed = ctx.results.len(), "recovering execution");
            self.spawn_run(Arc::new(definition), ctx).await;
            recovered.push(execution_id);
        }
        Ok(recovered)
    }

    /// Remove terminal executions finished more than `older_than` ago.
    pub async fn purge(&self, older_than: chrono::Duration) -> Result<Vec<ExecutionId>> {
        self.inner.state.purge_terminal(older_than).await
    }

    /// Purge according to `retention_secs`; a no-op when it is unset.
    pub async fn purge_expired(&self) -> Result<Vec<ExecutionId>> {
        match self.inner.config.retention() {
            Some(retention) => self.purge(retention).await,
            None => Ok(Vec::new()),
        }
    }

    async fn spawn_run(&self, definition: Arc<WorkflowDefinition>, ctx: WorkflowContext) {
        let execution_id = ctx.execution_id;
        let run_id = self.inner.next_run.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);

        self.inner.runs.lock().await.insert(
            execution_id,
            RunHandle {
                run_id,
                cancel: cancel.clone(),
                done: done_rx,
            },
        );

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let options = RunOptions {
                state: Some(&inner.state),
                cancel: cancel.clone(),
                nesting: 0,
            };
            match inner.scheduler.run(&definition, ctx, options).await {
                Ok(done) if done.status == ExecutionStatus::Paused && cancel.is_cancelled() => {
                    // cancelled after the last wave but before the pause was recorded
                    cancel_paused(&inner, done).await;
                }
                Ok(done) => {
                    tracing::debug!(%execution_id, status = %done.status, "run finished");
                }
                Err(e) => {
                    tracing::error!(%execution_id, "run aborted: {}", e);
                    record_abort(&inner, execution_id, &e).await;
                }
            }

            {
                let mut runs = inner.runs.lock().await;
                if runs.get(&execution_id).is_some_and(|h| h.run_id == run_id) {
                    runs.remove(&execution_id);
                }
            }
            let _ = done_tx.send(true);
        });
    }
}

async fn cancel_paused(inner: &EngineInner, mut ctx: WorkflowContext) {
    let execution_id = ctx.execution_id;
    if ctx.mark_cancelled().is_err() {
        return;
    }
    if let Err(e) = inner.state.save_header(&ctx).await {
        tracing::error!(%execution_id, "cannot persist cancellation: {}", e);
        return;
    }
    inner.notifier.publish(ExecutionEvent::WorkflowCancelled {
        execution_id,
        timestamp: Utc::now(),
    });
}

/// Best effort: mark an execution failed after the scheduler itself errored.
async fn record_abort(inner: &EngineInner, execution_id: ExecutionId, error: &EngineError) {
    let mut ctx = match inner.state.load(execution_id).await {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::error!(%execution_id, "cannot load execution to record failure: {}", e);
            return;
        }
    };
    if ctx.status.is_terminal() || ctx.mark_failed(error.kind(), error.to_string()).is_err() {
        return;
    }
    if let Err(e) = inner.state.save_header(&ctx).await {
        tracing::error!(%execution_id, "cannot persist failure: {}", e);
    }
    inner.notifier.publish(ExecutionEvent::WorkflowFailed {
        execution_id,
        error: error.to_string(),
        failed_steps: BTreeMap::new(),
        timestamp: Utc::now(),
    });
}

/// Assembles an [`Engine`]; every collaborator is injected here.
pub struct EngineBuilder {
    config: EngineConfig,
    dispatcher: StepDispatcher,
    store: Option<Arc<dyn StateStore>>,
    fallback: Arc<dyn FallbackPolicy>,
    sinks: Vec<Arc<dyn NotificationSink>>,
    middleware: Vec<Arc<dyn StepMiddleware>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            dispatcher: StepDispatcher::new(),
            store: None,
            fallback: Arc::new(NoFallback),
            sinks: Vec::new(),
            middleware: Vec::new(),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn dispatcher(mut self, dispatcher: StepDispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn register(mut self, step_type: StepType, executor: Arc<dyn StepExecutor>) -> Self {
        self.dispatcher.register(step_type, executor);
        self
    }

    pub fn register_integration(mut self, service: impl Into<String>, executor: Arc<dyn StepExecutor>) -> Self {
        self.dispatcher.register_integration(service, executor);
        self
    }

    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn fallback(mut self, fallback: Arc<dyn FallbackPolicy>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn middleware(mut self, middleware: Arc<dyn StepMiddleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Must be called within a tokio runtime: notification workers are
    /// spawned here.
    pub async fn build(self) -> Result<Engine> {
        self.config
            .validate()
            .map_err(|e| EngineError::Execution(e.to_string()))?;

        let store: Arc<dyn StateStore> = match (self.store, &self.config.state_dir) {
            (Some(store), _) => store,
            (None, Some(dir)) => Arc::new(FileStateStore::open(dir.clone()).await?),
            (None, None) => Arc::new(MemoryStateStore::new()),
        };

        let events = EventBus::new(self.config.event_buffer_size);
        let mut sinks = self.sinks;
        sinks.push(Arc::new(events.clone()));
        let notifier = Notifier::new(sinks, self.config.event_buffer_size, self.config.notify_timeout());

        let mut dispatcher = self.dispatcher;
        dispatcher.set_default_timeout(self.config.step_timeout());
        for m in self.middleware {
            dispatcher.add_middleware(m);
        }
        let dispatcher = Arc::new(dispatcher);

        let runner = StepRunner::new(
            dispatcher.clone(),
            self.fallback,
            notifier.clone(),
            self.config.default_retry.clone(),
        );
        let scheduler = Scheduler::new(
            runner,
            VariableResolver::new(self.config.max_resolution_depth),
            notifier.clone(),
            self.config.max_parallel_steps,
        );

        Ok(Engine {
            inner: Arc::new(EngineInner {
                scheduler,
                state: ExecutionStateStore::new(store),
                notifier,
                events,
                dispatcher,
                config: self.config,
                runs: Mutex::new(HashMap::new()),
                transitions: Mutex::new(()),
                next_run: AtomicU64::new(0),
            }),
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
