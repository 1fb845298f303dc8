use crate::{StepError, Value, WorkflowError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

pub type WorkflowId = Uuid;
pub type StepId = String;

/// Complete, immutable workflow definition.
///
/// New versions of a workflow get new ids; a published definition is never
/// edited in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default = "Uuid::new_v4")]
    pub id: WorkflowId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub start_step: StepId,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            steps: Vec::new(),
            start_step: String::new(),
        }
    }

    /// Append a step. The first step added becomes the start step.
    pub fn add_step(&mut self, step: WorkflowStep) -> StepId {
        let id = step.step_id.clone();
        if self.start_step.is_empty() {
            self.start_step = id.clone();
        }
        self.steps.push(step);
        id
    }

    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.add_step(step);
        self
    }

    pub fn find_step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Structural validation performed before a run starts.
    ///
    /// Cycles are not rejected here; the scheduler reports them as deadlocks.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.steps.is_empty() {
            return Err(WorkflowError::Invalid(format!(
                "workflow '{}' has no steps",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !is_valid_step_id(&step.step_id) {
                return Err(WorkflowError::InvalidStepId(step.step_id.clone()));
            }
            if !seen.insert(step.step_id.as_str()) {
                return Err(WorkflowError::DuplicateStep(step.step_id.clone()));
            }
        }

        if !self.start_step.is_empty() && !seen.contains(self.start_step.as_str()) {
            return Err(WorkflowError::StartStepNotFound(self.start_step.clone()));
        }

        for step in &self.steps {
            for target in step.next_steps.iter().chain(step.depends_on.iter()) {
                if !seen.contains(target.as_str()) {
                    return Err(WorkflowError::StepNotFound {
                        step_id: target.clone(),
                        referenced_by: step.step_id.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Step ids double as the first segment of `{{ step.path }}` references.
pub fn is_valid_step_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Closed set of step kinds; each maps to exactly one dispatcher slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepType {
    IntegrationCall,
    ConditionalLogic,
    ParallelGroup,
    SystemReasoning,
    SubAgentSpawn,
    HumanInput,
}

impl StepType {
    pub const ALL: [StepType; 6] = [
        StepType::IntegrationCall,
        StepType::ConditionalLogic,
        StepType::ParallelGroup,
        StepType::SystemReasoning,
        StepType::SubAgentSpawn,
        StepType::HumanInput,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::IntegrationCall => "integration-call",
            StepType::ConditionalLogic => "conditional-logic",
            StepType::ParallelGroup => "parallel-group",
            StepType::SystemReasoning => "system-reasoning",
            StepType::SubAgentSpawn => "sub-agent-spawn",
            StepType::HumanInput => "human-input",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single unit of work in a workflow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub step_id: StepId,
    pub step_type: StepType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    #[serde(default)]
    pub next_steps: Vec<StepId>,
    #[serde(default)]
    pub depends_on: Vec<StepId>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    /// External integration targeted by an integration call.
    #[serde(default)]
    pub service: Option<String>,
    /// Top-level parameters allowed to stay unresolved.
    #[serde(default)]
    pub optional_parameters: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<StepCondition>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl WorkflowStep {
    pub fn new(step_id: impl Into<String>, step_type: StepType) -> Self {
        Self {
            step_id: step_id.into(),
            step_type,
            description: String::new(),
            parameters: HashMap::new(),
            next_steps: Vec::new(),
            depends_on: Vec::new(),
            retry_policy: None,
            service: None,
            optional_parameters: Vec::new(),
            conditions: Vec::new(),
            timeout_ms: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_next(mut self, step_id: impl Into<String>) -> Self {
        self.next_steps.push(step_id.into());
        self
    }

    pub fn with_dependency(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, delay_ms: u64) -> Self {
        self.retry_policy = Some(RetryPolicy {
            max_attempts,
            delay_ms,
            backoff_multiplier: 1.0,
            ..RetryPolicy::default()
        });
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_condition(mut self, condition: StepCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn optional(mut self, parameter: impl Into<String>) -> Self {
        self.optional_parameters.push(parameter.into());
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn is_required(&self, parameter: &str) -> bool {
        !self.optional_parameters.iter().any(|p| p == parameter)
    }
}

/// Retry policy for step execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
    /// Error kinds that may be retried. Empty means every transient error.
    pub retry_on: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 60_000,
            jitter: false,
            retry_on: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Whether `error` may be retried after attempt number `attempt` (1-based).
    pub fn should_retry(&self, error: &StepError, attempt: u32) -> bool {
        if attempt >= self.max_attempts || !error.is_retryable() {
            return false;
        }
        self.retry_on.is_empty() || self.retry_on.iter().any(|k| k == error.kind())
    }

    /// Delay before the attempt that follows attempt number `attempt` (1-based),
    /// without jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let delay = self.delay_ms as f64 * self.backoff_multiplier.max(1.0).powi(exponent);
        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }
}

/// Guard evaluated against resolved values before a step runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCondition {
    pub left: Value,
    #[serde(default)]
    pub operator: ConditionOperator,
    #[serde(default)]
    pub right: Value,
}

impl StepCondition {
    pub fn new(left: impl Into<Value>, operator: ConditionOperator, right: impl Into<Value>) -> Self {
        Self {
            left: left.into(),
            operator,
            right: right.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    Exists,
    #[default]
    Truthy,
}

impl ConditionOperator {
    /// Evaluate on already-resolved operands.
    ///
    /// Numbers compare numerically, including numeric strings produced by
    /// template substitution; everything else compares by canonical text.
    pub fn evaluate(&self, left: &Value, right: &Value) -> bool {
        match self {
            ConditionOperator::Eq => loose_eq(left, right),
            ConditionOperator::Ne => !loose_eq(left, right),
            ConditionOperator::Gt => compare(left, right).is_some_and(|o| o.is_gt()),
            ConditionOperator::Gte => compare(left, right).is_some_and(|o| o.is_ge()),
            ConditionOperator::Lt => compare(left, right).is_some_and(|o| o.is_lt()),
            ConditionOperator::Lte => compare(left, right).is_some_and(|o| o.is_le()),
            ConditionOperator::Contains => match left {
                Value::Array(items) => items.iter().any(|item| loose_eq(item, right)),
                Value::Object(map) => map.contains_key(&right.to_template_string()),
                other => other
                    .to_template_string()
                    .contains(&right.to_template_string()),
            },
            ConditionOperator::Exists => !left.is_null(),
            ConditionOperator::Truthy => left.is_truthy(),
        }
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::String(s) => s.trim().parse::<f64>().ok(),
        other => other.as_f64(),
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    match (numeric(left), numeric(right)) {
        (Some(a), Some(b)) => a == b,
        _ => left.to_template_string() == right.to_template_string(),
    }
}

fn compare(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    match (numeric(left), numeric(right)) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => Some(left.to_template_string().cmp(&right.to_template_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str) -> WorkflowStep {
        WorkflowStep::new(id, StepType::SystemReasoning)
    }

    #[test]
    fn validate_rejects_duplicates_and_unknown_edges() {
        let wf = WorkflowDefinition::new("dup").with_step(step("a")).with_step(step("a"));
        assert_eq!(wf.validate(), Err(WorkflowError::DuplicateStep("a".into())));

        let wf = WorkflowDefinition::new("edge").with_step(step("a").with_next("missing"));
        assert!(matches!(
            wf.validate(),
            Err(WorkflowError::StepNotFound { ref step_id, .. }) if step_id == "missing"
        ));

        let wf = WorkflowDefinition::new("empty");
        assert!(matches!(wf.validate(), Err(WorkflowError::Invalid(_))));

        let wf = WorkflowDefinition::new("bad id").with_step(step("has.dot"));
        assert!(matches!(wf.validate(), Err(WorkflowError::InvalidStepId(_))));
    }

    #[test]
    fn validate_accepts_cycles() {
        let wf = WorkflowDefinition::new("cycle")
            .with_step(step("x").with_dependency("y"))
            .with_step(step("y").with_dependency("x"));
        assert!(wf.validate().is_ok());
        assert_eq!(wf.start_step, "x");
    }

    #[test]
    fn step_type_serializes_kebab_case() {
        let json = serde_json::to_string(&StepType::IntegrationCall).unwrap();
        assert_eq!(json, "\"integration-call\"");
        let parsed: StepType = serde_json::from_str("\"sub-agent-spawn\"").unwrap();
        assert_eq!(parsed, StepType::SubAgentSpawn);
    }

    #[test]
    fn retry_policy_backoff_and_eligibility() {
        let policy = RetryPolicy {
            max_attempts: 4,
            delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 300,
            jitter: false,
            retry_on: vec!["network".into()],
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));

        let network = StepError::transient("network", "reset");
        let rate = StepError::transient("rate_limit", "slow down");
        assert!(policy.should_retry(&network, 1));
        assert!(!policy.should_retry(&network, 4));
        assert!(!policy.should_retry(&rate, 1));
        assert!(!policy.should_retry(&StepError::permanent("network", "x"), 1));
    }

    #[test]
    fn condition_operators() {
        assert!(ConditionOperator::Eq.evaluate(&"3".into(), &Value::Integer(3)));
        assert!(ConditionOperator::Gt.evaluate(&"10".into(), &"9".into()));
        assert!(ConditionOperator::Contains.evaluate(&"hello world".into(), &"world".into()));
        assert!(ConditionOperator::Ne.evaluate(&"a".into(), &"b".into()));
        assert!(!ConditionOperator::Exists.evaluate(&Value::Null, &Value::Null));
        assert!(ConditionOperator::Truthy.evaluate(&Value::Bool(true), &Value::Null));
    }

    #[test]
    fn definition_parses_with_defaults() {
        let wf: WorkflowDefinition = serde_json::from_str(
            r#"{
                "name": "minimal",
                "steps": [
                    {"step_id": "fetch", "step_type": "integration-call", "service": "http"},
                    {"step_id": "notify", "step_type": "system-reasoning",
                     "parameters": {"message": "{{fetch.url}}"}}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(wf.steps.len(), 2);
        assert!(wf.steps[0].retry_policy.is_none());
        assert_eq!(wf.steps[1].parameters["message"], Value::from("{{fetch.url}}"));
    }
}
