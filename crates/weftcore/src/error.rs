use crate::context::ExecutionStatus;
use crate::events::ExecutionId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Deadlock: steps [{}] cannot make progress{}", .steps.join(", "), format_cycles(.cycles))]
    Deadlock {
        steps: Vec<String>,
        cycles: Vec<Vec<String>>,
    },

    #[error("Execution {execution_id} is {status}, only paused executions can be resumed")]
    NotResumable {
        execution_id: ExecutionId,
        status: ExecutionStatus,
    },

    #[error("Execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Execution error: {0}")]
    Execution(String),
}

impl EngineError {
    /// Short machine-readable kind, recorded on failed executions.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Workflow(_) => "workflow",
            EngineError::Deadlock { .. } => "deadlock",
            EngineError::NotResumable { .. } => "not_resumable",
            EngineError::ExecutionNotFound(_) => "not_found",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::Store(_) => "store",
            EngineError::Serialization(_) => "serialization",
            EngineError::Execution(_) => "execution",
        }
    }
}

fn format_cycles(cycles: &[Vec<String>]) -> String {
    if cycles.is_empty() {
        return String::new();
    }
    let rendered: Vec<String> = cycles.iter().map(|c| c.join(" -> ")).collect();
    format!(" (cycles: {})", rendered.join("; "))
}

/// Step-local failure, raised by executors and classified by the dispatcher.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StepError {
    #[error("Missing required input: {}", .0.join(", "))]
    MissingInput(Vec<String>),

    #[error("Transient failure ({kind}): {message}")]
    Transient { kind: String, message: String },

    #[error("Permanent failure ({kind}): {message}")]
    Permanent { kind: String, message: String },

    #[error("Invalid parameter '{field}': {reason}")]
    InvalidParameter { field: String, reason: String },

    #[error("No executor registered for {0}")]
    NoExecutor(String),

    #[error("Timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Cancelled")]
    Cancelled,
}

impl StepError {
    pub fn transient(kind: impl Into<String>, message: impl Into<String>) -> Self {
        StepError::Transient {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn permanent(kind: impl Into<String>, message: impl Into<String>) -> Self {
        StepError::Permanent {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        StepError::InvalidParameter {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            StepError::MissingInput(_) => "missing_input",
            StepError::Transient { kind, .. } | StepError::Permanent { kind, .. } => kind,
            StepError::InvalidParameter { .. } => "invalid_parameter",
            StepError::NoExecutor(_) => "no_executor",
            StepError::Timeout { .. } => "timeout",
            StepError::Cancelled => "cancelled",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StepError::Transient { .. } | StepError::Timeout { .. })
    }

    pub fn message(&self) -> String {
        match self {
            StepError::Transient { message, .. } | StepError::Permanent { message, .. } => {
                message.clone()
            }
            other => other.to_string(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("Invalid workflow: {0}")]
    Invalid(String),

    #[error("Duplicate step id: {0}")]
    DuplicateStep(String),

    #[error("Step '{referenced_by}' references unknown step '{step_id}'")]
    StepNotFound {
        step_id: String,
        referenced_by: String,
    },

    #[error("Start step not found: {0}")]
    StartStepNotFound(String),

    #[error("Invalid step id '{0}': only letters, digits, '_' and '-' are allowed")]
    InvalidStepId(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt record for execution {execution_id}: {reason}")]
    Corrupt {
        execution_id: ExecutionId,
        reason: String,
    },

    #[error("Backend error: {0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Sink '{sink}' rejected event: {message}")]
    Rejected { sink: String, message: String },

    #[error("Sink '{0}' timed out")]
    Timeout(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_error_classification() {
        assert!(StepError::transient("network", "reset").is_retryable());
        assert!(StepError::Timeout { ms: 10 }.is_retryable());
        assert!(!StepError::permanent("validation", "bad email").is_retryable());
        assert!(!StepError::MissingInput(vec!["email".into()]).is_retryable());
        assert_eq!(StepError::transient("network", "reset").kind(), "network");
        assert_eq!(StepError::NoExecutor("x".into()).kind(), "no_executor");
    }

    #[test]
    fn deadlock_message_names_steps_and_cycles() {
        let err = EngineError::Deadlock {
            steps: vec!["x".into(), "y".into()],
            cycles: vec![vec!["x".into(), "y".into()]],
        };
        let msg = err.to_string();
        assert!(msg.contains("x, y"), "got: {msg}");
        assert!(msg.contains("x -> y"), "got: {msg}");
        assert_eq!(err.kind(), "deadlock");
    }
}
