use async_trait::async_trait;
use futures::future::join_all;
use std::collections::{BTreeSet, HashMap, HashSet};
use weftcore::{
    ExecutorInfo, ParameterInfo, StepContext, StepError, StepExecutor, StepOutput, Value, WorkflowStep,
};

/// Fans a list of independent child steps out concurrently and gathers their
/// outputs into one object keyed by child step id.
///
/// Children run through the same dispatcher, retry and fallback policies as
/// top-level steps. If any child is missing input the whole group reports the
/// union of missing names; otherwise the first failure in declaration order
/// fails the group.
pub struct ParallelGroupExecutor;

#[async_trait]
impl StepExecutor for ParallelGroupExecutor {
    fn name(&self) -> &str {
        "parallel"
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, StepError> {
        let children = ctx.children()?.clone();
        let steps = child_steps(ctx.require_param("steps")?)?;

        tracing::debug!(step_id = %ctx.step_id, "Running {} child steps", steps.len());
        let ids: Vec<String> = steps.iter().map(|s| s.step_id.clone()).collect();
        let results = join_all(steps.into_iter().map(|step| children.run_step(&ctx, step))).await;

        let mut outputs = HashMap::new();
        let mut missing = BTreeSet::new();
        let mut first_error = None;
        for (id, result) in ids.into_iter().zip(results) {
            match result {
                Ok(output) => {
                    outputs.insert(id, output.value);
                }
                Err(StepError::MissingInput(names)) => missing.extend(names),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some((id, e));
                    }
                }
            }
        }

        if !missing.is_empty() {
            return Err(StepError::MissingInput(missing.into_iter().collect()));
        }
        if let Some((id, e)) = first_error {
            return Err(match e {
                StepError::Cancelled => StepError::Cancelled,
                other => StepError::permanent(
                    other.kind().to_string(),
                    format!("child step '{}' failed: {}", id, other.message()),
                ),
            });
        }
        Ok(StepOutput::new(outputs))
    }

    fn describe(&self) -> ExecutorInfo {
        ExecutorInfo {
            name: self.name().to_string(),
            description: "Run child steps concurrently and collect their outputs".to_string(),
            parameters: vec![ParameterInfo::required("steps", "array of step definitions")],
        }
    }
}

fn child_steps(value: &Value) -> Result<Vec<WorkflowStep>, StepError> {
    let steps: Vec<WorkflowStep> = serde_json::from_value(value.to_json())
        .map_err(|e| StepError::invalid("steps", format!("expected an array of steps: {}", e)))?;
    if steps.is_empty() {
        return Err(StepError::invalid("steps", "a parallel group needs at least one step"));
    }
    let mut seen = HashSet::new();
    for step in &steps {
        if !seen.insert(step.step_id.as_str()) {
            return Err(StepError::invalid(
                "steps",
                format!("duplicate child step id '{}'", step.step_id),
            ));
        }
    }
    Ok(steps)
}
