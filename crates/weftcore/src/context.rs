use crate::events::ExecutionId;
use crate::{EngineError, StepId, Value, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use uuid::Uuid;

/// Lifecycle of one execution.
///
/// `Pending -> Running -> {Completed | Failed | Paused | Cancelled}`,
/// `Paused -> Running` (resume) and `Paused -> Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Paused)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Cancelled)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// How a recorded result was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutedVia {
    #[default]
    Primary,
    Fallback,
    Skipped,
}

impl fmt::Display for ExecutedVia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutedVia::Primary => "primary",
            ExecutedVia::Fallback => "fallback",
            ExecutedVia::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Output of a completed step, as seen by downstream steps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    pub output: Value,
    #[serde(default)]
    pub executed_via: ExecutedVia,
    pub attempts: u32,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

impl StepResult {
    pub fn new(output: Value, executed_via: ExecutedVia, attempts: u32, duration_ms: u64) -> Self {
        Self {
            output,
            executed_via,
            attempts,
            duration_ms,
            completed_at: Utc::now(),
        }
    }
}

/// Terminal failure of one step after retries and fallback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepFailure {
    pub kind: String,
    pub message: String,
    pub attempts: u32,
}

/// Live runtime state of one workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub status: ExecutionStatus,
    pub variables: HashMap<String, Value>,
    /// Append-only: a step appears here only once it has completed.
    pub results: BTreeMap<StepId, StepResult>,
    pub missing_parameters: BTreeSet<String>,
    /// Steps waiting on input, with the names each one is missing.
    #[serde(default)]
    pub blocked_steps: BTreeMap<StepId, BTreeSet<String>>,
    #[serde(default)]
    pub failed_steps: BTreeMap<StepId, StepFailure>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_kind: Option<String>,
}

impl WorkflowContext {
    pub fn new(workflow_id: WorkflowId, variables: HashMap<String, Value>) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            workflow_id,
            status: ExecutionStatus::Pending,
            variables,
            results: BTreeMap::new(),
            missing_parameters: BTreeSet::new(),
            blocked_steps: BTreeMap::new(),
            failed_steps: BTreeMap::new(),
            started_at: None,
            completed_at: None,
            error_message: None,
            error_kind: None,
        }
    }

    pub fn result(&self, step_id: &str) -> Option<&StepResult> {
        self.results.get(step_id)
    }

    pub fn is_completed(&self, step_id: &str) -> bool {
        self.results.contains_key(step_id)
    }

    /// Record a completed step. Returns false if the step already had a result.
    pub fn record_result(&mut self, step_id: &str, result: StepResult) -> bool {
        if self.results.contains_key(step_id) {
            return false;
        }
        self.blocked_steps.remove(step_id);
        self.results.insert(step_id.to_string(), result);
        true
    }

    pub fn record_failure(&mut self, step_id: &str, failure: StepFailure) {
        self.failed_steps.insert(step_id.to_string(), failure);
    }

    pub fn record_blocked(&mut self, step_id: &str, missing: BTreeSet<String>) {
        self.blocked_steps.insert(step_id.to_string(), missing);
    }

    fn transition(&mut self, next: ExecutionStatus) -> Result<(), EngineError> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn mark_running(&mut self) -> Result<(), EngineError> {
        self.transition(ExecutionStatus::Running)?;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Pause with the union of every blocked step's missing names.
    pub fn mark_paused(&mut self) -> Result<(), EngineError> {
        let missing: BTreeSet<String> = self
            .blocked_steps
            .values()
            .flat_map(|names| names.iter().cloned())
            .collect();
        if missing.is_empty() {
            return Err(EngineError::Execution(
                "cannot pause without missing parameters".to_string(),
            ));
        }
        self.transition(ExecutionStatus::Paused)?;
        self.missing_parameters = missing;
        Ok(())
    }

    pub fn mark_completed(&mut self) -> Result<(), EngineError> {
        self.transition(ExecutionStatus::Completed)?;
        self.missing_parameters.clear();
        Ok(())
    }

    pub fn mark_failed(&mut self, kind: impl Into<String>, message: impl Into<String>) -> Result<(), EngineError> {
        self.transition(ExecutionStatus::Failed)?;
        self.missing_parameters.clear();
        self.error_kind = Some(kind.into());
        self.error_message = Some(message.into());
        Ok(())
    }

    pub fn mark_cancelled(&mut self) -> Result<(), EngineError> {
        self.transition(ExecutionStatus::Cancelled)?;
        self.missing_parameters.clear();
        Ok(())
    }

    /// Merge externally supplied values and move back to `Running`.
    ///
    /// Missing names are cleared because `Running` never carries any; blocked
    /// steps are re-evaluated by the scheduler on the next pass and re-pause
    /// with whatever is still absent.
    pub fn resume_with(&mut self, supplied: HashMap<String, Value>) -> Result<(), EngineError> {
        if self.status != ExecutionStatus::Paused {
            return Err(EngineError::NotResumable {
                execution_id: self.execution_id,
                status: self.status,
            });
        }
        self.variables.extend(supplied);
        self.blocked_steps.clear();
        self.missing_parameters.clear();
        self.transition(ExecutionStatus::Running)
    }
}
