use async_trait::async_trait;
use weftcore::{
    ConditionOperator, ExecutorInfo, ParameterInfo, StepContext, StepError, StepExecutor, StepOutput, Value,
};

/// Evaluates `left <operator> right` and publishes which branch was taken.
///
/// Output: `{result: bool, branch: "then" | "else", value}` where `value` is
/// the `then` or `else` parameter (null when absent). Downstream steps gate on
/// it with a condition such as `{{check.result}} truthy`.
pub struct ConditionalExecutor;

#[async_trait]
impl StepExecutor for ConditionalExecutor {
    fn name(&self) -> &str {
        "conditional"
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, StepError> {
        let operator = match ctx.parameters.get("operator") {
            None => ConditionOperator::default(),
            Some(op) => serde_json::from_value(op.to_json())
                .map_err(|_| StepError::invalid("operator", format!("unknown operator '{}'", op.to_template_string())))?,
        };
        let left = ctx.param_or("left", Value::Null);
        let right = ctx.param_or("right", Value::Null);

        let result = operator.evaluate(&left, &right);
        let branch = if result { "then" } else { "else" };
        tracing::debug!(step_id = %ctx.step_id, ?operator, result, "condition evaluated");

        Ok(StepOutput::default()
            .with_output("result", result)
            .with_output("branch", branch)
            .with_output("value", ctx.param_or(branch, Value::Null)))
    }

    fn describe(&self) -> ExecutorInfo {
        ExecutorInfo {
            name: self.name().to_string(),
            description: "Evaluate a comparison and report the branch taken".to_string(),
            parameters: vec![
                ParameterInfo::required("left", "left operand"),
                ParameterInfo::optional("operator", "eq, ne, gt, gte, lt, lte, contains, exists, truthy (default)"),
                ParameterInfo::optional("right", "right operand"),
                ParameterInfo::optional("then", "value published when the comparison holds"),
                ParameterInfo::optional("else", "value published otherwise"),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use weftcore::{StepType, WorkflowStep};

    fn run(params: &[(&str, Value)]) -> StepContext {
        let step = WorkflowStep::new("check", StepType::ConditionalLogic);
        let params: HashMap<String, Value> = params.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        StepContext::new(uuid::Uuid::nil(), &step, params)
    }

    #[tokio::test]
    async fn numeric_strings_compare_as_numbers() {
        let out = ConditionalExecutor
            .execute(run(&[
                ("left", Value::from("120")),
                ("operator", Value::from("gt")),
                ("right", Value::Integer(100)),
                ("then", Value::from("escalate")),
                ("else", Value::from("ignore")),
            ]))
            .await
            .unwrap();
        assert_eq!(out.value.get_path(&["result"]), Some(&Value::Bool(true)));
        assert_eq!(out.value.get_path(&["branch"]), Some(&Value::from("then")));
        assert_eq!(out.value.get_path(&["value"]), Some(&Value::from("escalate")));
    }

    #[tokio::test]
    async fn else_branch_without_value_is_null() {
        let out = ConditionalExecutor
            .execute(run(&[("left", Value::from(""))]))
            .await
            .unwrap();
        assert_eq!(out.value.get_path(&["branch"]), Some(&Value::from("else")));
        assert_eq!(out.value.get_path(&["value"]), Some(&Value::Null));
    }

    #[tokio::test]
    async fn unknown_operator_is_rejected() {
        let err = ConditionalExecutor
            .execute(run(&[("left", Value::Integer(1)), ("operator", Value::from("~="))]))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::InvalidParameter { ref field, .. } if field == "operator"));
    }
}
