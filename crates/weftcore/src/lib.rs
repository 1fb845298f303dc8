//! Core abstractions for the weft workflow engine
//!
//! Data model, execution context, error taxonomy, the step executor plug-in
//! interface and execution events. Nothing in here schedules anything.

mod context;
mod error;
pub mod events;
mod step;
mod value;
mod workflow;

pub use context::{ExecutedVia, ExecutionStatus, StepFailure, StepResult, WorkflowContext};
pub use error::{EngineError, NotifyError, StepError, StoreError, WorkflowError};
pub use events::*;
pub use step::{ChildRunner, ExecutorInfo, ParameterInfo, StepContext, StepExecutor, StepOutput};
pub use value::Value;
pub use workflow::{
    is_valid_step_id, ConditionOperator, RetryPolicy, StepCondition, StepId, StepType,
    WorkflowDefinition, WorkflowId, WorkflowStep,
};

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
