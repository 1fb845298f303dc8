use crate::events::ExecutionId;
use crate::{StepError, StepType, Value, WorkflowDefinition, WorkflowStep};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Plug-in interface implemented by every step executor, internal or
/// external.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Identifier shown in logs and listings (e.g. "system", "http").
    fn name(&self) -> &str;

    /// Execute with already-resolved parameters.
    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, StepError>;

    fn describe(&self) -> ExecutorInfo {
        ExecutorInfo {
            name: self.name().to_string(),
            description: String::new(),
            parameters: Vec::new(),
        }
    }
}

/// Lets fan-out executors run nested steps and whole sub-workflows through
/// the same dispatcher and policies as the parent.
#[async_trait]
pub trait ChildRunner: Send + Sync {
    async fn run_step(
        &self,
        parent: &StepContext,
        step: WorkflowStep,
    ) -> Result<StepOutput, StepError>;

    async fn run_workflow(
        &self,
        parent: &StepContext,
        definition: &WorkflowDefinition,
        variables: HashMap<String, Value>,
    ) -> Result<StepOutput, StepError>;
}

/// Execution context passed to each executor
#[derive(Clone)]
pub struct StepContext {
    pub execution_id: ExecutionId,
    pub step_id: String,
    pub step_type: StepType,
    pub service: Option<String>,

    /// Parameters after template resolution
    pub parameters: HashMap<String, Value>,

    /// 1-based attempt number
    pub attempt: u32,

    pub cancellation: tokio_util::sync::CancellationToken,

    pub children: Option<Arc<dyn ChildRunner>>,

    /// Sub-workflow nesting level; 0 for top-level steps
    pub nesting: u32,

    /// Error from the primary path when running as a fallback
    pub prior_error: Option<StepError>,
}

impl StepContext {
    pub fn new(execution_id: ExecutionId, step: &WorkflowStep, parameters: HashMap<String, Value>) -> Self {
        Self {
            execution_id,
            step_id: step.step_id.clone(),
            step_type: step.step_type,
            service: step.service.clone(),
            parameters,
            attempt: 1,
            cancellation: tokio_util::sync::CancellationToken::new(),
            children: None,
            nesting: 0,
            prior_error: None,
        }
    }

    /// Get required parameter or return error
    pub fn require_param(&self, name: &str) -> Result<&Value, StepError> {
        self.parameters
            .get(name)
            .ok_or_else(|| StepError::MissingInput(vec![name.to_string()]))
    }

    pub fn require_str(&self, name: &str) -> Result<&str, StepError> {
        self.require_param(name)?
            .as_str()
            .ok_or_else(|| StepError::invalid(name, "expected a string"))
    }

    /// Get parameter with default
    pub fn param_or(&self, name: &str, default: Value) -> Value {
        self.parameters.get(name).cloned().unwrap_or(default)
    }

    pub fn children(&self) -> Result<&Arc<dyn ChildRunner>, StepError> {
        self.children
            .as_ref()
            .ok_or_else(|| StepError::permanent("unsupported", "nested execution is not available here"))
    }
}

/// Output from step execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StepOutput {
    pub value: Value,
    pub metadata: HashMap<String, Value>,
}

impl StepOutput {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            metadata: HashMap::new(),
        }
    }

    /// Set a field on an object output, converting a non-object output into
    /// an empty object first.
    pub fn with_output(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if !matches!(self.value, Value::Object(_)) {
            self.value = Value::Object(HashMap::new());
        }
        if let Value::Object(map) = &mut self.value {
            map.insert(key.into(), value.into());
        }
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorInfo {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParameterInfo>,
}

#[derive(Debug, Clone)]
pub struct ParameterInfo {
    pub name: String,
    pub description: String,
    pub required: bool,
}

impl ParameterInfo {
    pub fn required(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            required: true,
        }
    }

    pub fn optional(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            required: false,
        }
    }
}
