use crate::store::StateStore;
use chrono::{Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use weftcore::{
    EngineError, ExecutionId, ExecutionStatus, StepResult, StoreError, WorkflowContext, WorkflowDefinition,
};

const DEFINITION_KEY: &str = "definition";
const HEADER_KEY: &str = "header";
const RESULT_PREFIX: &str = "result/";

/// Layout of one execution's keyspace on top of a [`StateStore`].
///
/// `definition` holds the workflow, `header` everything in the context except
/// results, and each completed step lives under its own `result/<step_id>`
/// key, so concurrent steps never write the same key.
#[derive(Clone)]
pub struct ExecutionStateStore {
    backend: Arc<dyn StateStore>,
}

impl ExecutionStateStore {
    pub fn new(backend: Arc<dyn StateStore>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn StateStore> {
        &self.backend
    }

    /// Persist a new execution: its definition, header and any results it
    /// already carries.
    pub async fn create(&self, definition: &WorkflowDefinition, ctx: &WorkflowContext) -> Result<(), EngineError> {
        self.backend
            .set(ctx.execution_id, DEFINITION_KEY, serde_json::to_value(definition)?)
            .await?;
        for (step_id, result) in &ctx.results {
            self.save_result(ctx.execution_id, step_id, result).await?;
        }
        self.save_header(ctx).await?;
        tracing::debug!(execution_id = %ctx.execution_id, "execution persisted");
        Ok(())
    }

    pub async fn save_header(&self, ctx: &WorkflowContext) -> Result<(), EngineError> {
        let mut header = serde_json::to_value(ctx)?;
        if let Some(map) = header.as_object_mut() {
            map.insert("results".to_string(), serde_json::Value::Object(Default::default()));
        }
        self.backend.set(ctx.execution_id, HEADER_KEY, header).await?;
        Ok(())
    }

    pub async fn save_result(&self, execution_id: ExecutionId, step_id: &str, result: &StepResult) -> Result<(), EngineError> {
        let key = format!("{}{}", RESULT_PREFIX, step_id);
        self.backend
            .set(execution_id, &key, serde_json::to_value(result)?)
            .await?;
        tracing::debug!(execution_id = %execution_id, step_id, "step result checkpointed");
        Ok(())
    }

    /// Reassemble the context from its header and result keys.
    pub async fn load(&self, execution_id: ExecutionId) -> Result<WorkflowContext, EngineError> {
        let header = self
            .backend
            .get(execution_id, HEADER_KEY)
            .await?
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;
        let mut ctx: WorkflowContext = serde_json::from_value(header).map_err(|e| corrupt(execution_id, "header", e))?;

        let mut results = BTreeMap::new();
        for key in self.backend.keys(execution_id).await? {
            let Some(step_id) = key.strip_prefix(RESULT_PREFIX) else {
                continue;
            };
            if let Some(value) = self.backend.get(execution_id, &key).await? {
                let result: StepResult = serde_json::from_value(value).map_err(|e| corrupt(execution_id, &key, e))?;
                results.insert(step_id.to_string(), result);
            }
        }
        ctx.results = results;
        Ok(ctx)
    }

    pub async fn load_definition(&self, execution_id: ExecutionId) -> Result<WorkflowDefinition, EngineError> {
        let value = self
            .backend
            .get(execution_id, DEFINITION_KEY)
            .await?
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;
        serde_json::from_value(value).map_err(|e| corrupt(execution_id, DEFINITION_KEY, e))
    }

    pub async fn list(&self) -> Result<Vec<ExecutionId>, EngineError> {
        Ok(self.backend.executions().await?)
    }

    /// Executions whose persisted status is `status`.
    pub async fn list_with_status(&self, status: ExecutionStatus) -> Result<Vec<ExecutionId>, EngineError> {
        let mut matching = Vec::new();
        for execution_id in self.list().await? {
            match self.load(execution_id).await {
                Ok(ctx) if ctx.status == status => matching.push(execution_id),
                Ok(_) => {}
                Err(e) => tracing::warn!(execution_id = %execution_id, "skipping unreadable execution: {}", e),
            }
        }
        Ok(matching)
    }

    pub async fn remove(&self, execution_id: ExecutionId) -> Result<(), EngineError> {
        self.backend.remove(execution_id).await?;
        Ok(())
    }

    /// Remove terminal executions that completed more than `older_than` ago.
    /// Returns the removed ids.
    pub async fn purge_terminal(&self, older_than: Duration) -> Result<Vec<ExecutionId>, EngineError> {
        let cutoff = Utc::now() - older_than;
        let mut removed = Vec::new();
        for execution_id in self.list().await? {
            let Ok(ctx) = self.load(execution_id).await else {
                continue;
            };
            let expired = ctx.status.is_terminal() && ctx.completed_at.is_some_and(|at| at <= cutoff);
            if expired {
                self.remove(execution_id).await?;
                removed.push(execution_id);
            }
        }
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "purged terminal executions");
        }
        Ok(removed)
    }
}

fn corrupt(execution_id: ExecutionId, key: &str, error: serde_json::Error) -> EngineError {
    EngineError::Store(StoreError::Corrupt {
        execution_id,
        reason: format!("{}: {}", key, error),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FileStateStore, MemoryStateStore};
    use std::collections::{BTreeSet, HashMap};
    use weftcore::{ExecutedVia, StepType, Value, WorkflowStep};

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition::new("persist")
            .with_step(WorkflowStep::new("fetch", StepType::IntegrationCall))
            .with_step(WorkflowStep::new("notify", StepType::SystemReasoning).with_parameter("to", "{{email}}"))
    }

    #[tokio::test]
    async fn header_and_results_round_trip() {
        let store = ExecutionStateStore::new(Arc::new(MemoryStateStore::new()));
        let def = definition();
        let mut ctx = WorkflowContext::new(def.id, HashMap::from([("k".to_string(), Value::from(1))]));
        store.create(&def, &ctx).await.unwrap();

        ctx.mark_running().unwrap();
        let result = StepResult::new(Value::from("http://x"), ExecutedVia::Fallback, 2, 10);
        ctx.record_result("fetch", result.clone());
        store.save_result(ctx.execution_id, "fetch", &result).await.unwrap();
        ctx.record_blocked("notify", BTreeSet::from(["email".to_string()]));
        ctx.mark_paused().unwrap();
        store.save_header(&ctx).await.unwrap();

        let header = store.backend().get(ctx.execution_id, "header").await.unwrap().unwrap();
        assert_eq!(header["results"], serde_json::json!({}));

        let loaded = store.load(ctx.execution_id).await.unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Paused);
        assert_eq!(loaded.results["fetch"], result);
        assert_eq!(loaded.missing_parameters, BTreeSet::from(["email".to_string()]));
        assert_eq!(store.load_definition(ctx.execution_id).await.unwrap().steps.len(), 2);
    }

    #[tokio::test]
    async fn unknown_execution_is_not_found() {
        let store = ExecutionStateStore::new(Arc::new(MemoryStateStore::new()));
        let id = uuid::Uuid::new_v4();
        assert!(matches!(store.load(id).await, Err(EngineError::ExecutionNotFound(e)) if e == id));
    }

    #[tokio::test]
    async fn purge_only_removes_old_terminal_executions() {
        let dir = tempfile::tempdir().unwrap();
        let store = ExecutionStateStore::new(Arc::new(FileStateStore::open(dir.path()).await.unwrap()));
        let def = definition();

        let mut done = WorkflowContext::new(def.id, HashMap::new());
        done.mark_running().unwrap();
        done.mark_completed().unwrap();
        done.completed_at = Some(Utc::now() - Duration::hours(2));
        store.create(&def, &done).await.unwrap();

        let mut running = WorkflowContext::new(def.id, HashMap::new());
        running.mark_running().unwrap();
        store.create(&def, &running).await.unwrap();

        assert!(store.purge_terminal(Duration::hours(3)).await.unwrap().is_empty());
        assert_eq!(store.purge_terminal(Duration::hours(1)).await.unwrap(), vec![done.execution_id]);
        assert_eq!(store.list().await.unwrap(), vec![running.execution_id]);
        assert_eq!(
            store.list_with_status(ExecutionStatus::Running).await.unwrap(),
            vec![running.execution_id]
        );
    }
}
