use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use weftcore::{
    ExecutorInfo, ParameterInfo, StepContext, StepError, StepExecutor, StepOutput, Value, WorkflowDefinition,
};

/// Named workflow definitions a `sub-agent-spawn` step can start.
#[derive(Default)]
pub struct WorkflowLibrary {
    definitions: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
}

impl WorkflowLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a definition under its `name`.
    pub async fn insert(&self, definition: WorkflowDefinition) {
        tracing::info!("Registering sub-workflow: {}", definition.name);
        self.definitions
            .write()
            .await
            .insert(definition.name.clone(), Arc::new(definition));
    }

    pub async fn get(&self, name: &str) -> Option<Arc<WorkflowDefinition>> {
        self.definitions.read().await.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.definitions.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Runs a library workflow as a child execution of the current step.
///
/// `inputs` become the child's variables. The child's step outputs come back
/// as one object keyed by child step id, so `{{spawn.summary.text}}` reads
/// step `summary` of the sub-workflow started by step `spawn`.
pub struct SubWorkflowExecutor {
    library: Arc<WorkflowLibrary>,
}

impl SubWorkflowExecutor {
    pub fn new(library: Arc<WorkflowLibrary>) -> Self {
        Self { library }
    }
}

#[async_trait]
impl StepExecutor for SubWorkflowExecutor {
    fn name(&self) -> &str {
        "sub-workflow"
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, StepError> {
        let name = ctx.require_str("workflow")?;
        let definition = self.library.get(name).await.ok_or_else(|| {
            StepError::permanent("unknown_workflow", format!("no sub-workflow named '{}'", name))
        })?;

        let variables = match ctx.parameters.get("inputs") {
            None | Some(Value::Null) => HashMap::new(),
            Some(Value::Object(inputs)) => inputs.clone(),
            Some(_) => return Err(StepError::invalid("inputs", "expected an object")),
        };

        ctx.children()?.run_workflow(&ctx, &definition, variables).await
    }

    fn describe(&self) -> ExecutorInfo {
        ExecutorInfo {
            name: self.name().to_string(),
            description: "Run a named workflow as a nested execution".to_string(),
            parameters: vec![
                ParameterInfo::required("workflow", "name of a registered workflow"),
                ParameterInfo::optional("inputs", "object of variables for the child"),
            ],
        }
    }
}
