use async_trait::async_trait;
use std::collections::HashMap;
use weftcore::{ExecutorInfo, ParameterInfo, StepContext, StepError, StepExecutor, StepOutput, Value};
use weftruntime::template;

/// Collects values an external actor supplies on resume.
///
/// `fields` names the parameters that must carry an answer. A field that is
/// absent, null or still holds a `{{token}}` (an optional parameter left
/// unresolved) makes the step report missing input, which pauses the
/// execution with the referenced variable names.
pub struct HumanInputExecutor;

#[async_trait]
impl StepExecutor for HumanInputExecutor {
    fn name(&self) -> &str {
        "human-input"
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, StepError> {
        let fields: Vec<String> = match ctx.parameters.get("fields") {
            Some(Value::Array(items)) => items.iter().map(Value::to_template_string).collect(),
            Some(Value::String(single)) => vec![single.clone()],
            None => Vec::new(),
            Some(_) => return Err(StepError::invalid("fields", "expected a name or a list of names")),
        };

        let mut answers = HashMap::new();
        let mut missing = Vec::new();
        for field in &fields {
            match ctx.parameters.get(field) {
                None | Some(Value::Null) => missing.push(field.clone()),
                Some(Value::String(text)) if template::has_tokens(text) => {
                    let refs = template::references_in(text);
                    if refs.is_empty() {
                        missing.push(field.clone());
                    } else {
                        missing.extend(refs);
                    }
                }
                Some(value) => {
                    answers.insert(field.clone(), value.clone());
                }
            }
        }

        if !missing.is_empty() {
            missing.sort();
            missing.dedup();
            if let Some(prompt) = ctx.parameters.get("prompt") {
                tracing::info!(step_id = %ctx.step_id, missing = ?missing, "awaiting input: {}", prompt.to_template_string());
            }
            return Err(StepError::MissingInput(missing));
        }

        Ok(StepOutput::new(answers).with_metadata("prompt", ctx.param_or("prompt", Value::Null)))
    }

    fn describe(&self) -> ExecutorInfo {
        ExecutorInfo {
            name: self.name().to_string(),
            description: "Pause until an operator supplies the listed fields".to_string(),
            parameters: vec![
                ParameterInfo::required("fields", "parameter names that must hold an answer"),
                ParameterInfo::optional("prompt", "text shown to whoever resumes the execution"),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weftcore::{StepType, WorkflowStep};

    fn ctx(params: serde_json::Value) -> StepContext {
        let step = WorkflowStep::new("ask", StepType::HumanInput);
        let params = match Value::from(params) {
            Value::Object(map) => map,
            _ => HashMap::new(),
        };
        StepContext::new(uuid::Uuid::nil(), &step, params)
    }

    #[tokio::test]
    async fn unresolved_field_reports_its_variable() {
        let err = HumanInputExecutor
            .execute(ctx(serde_json::json!({
                "fields": ["approved"],
                "approved": "{{manager_approval}}"
            })))
            .await
            .unwrap_err();
        assert_eq!(err, StepError::MissingInput(vec!["manager_approval".into()]));
    }

    #[tokio::test]
    async fn absent_field_reports_the_field_name() {
        let err = HumanInputExecutor
            .execute(ctx(serde_json::json!({"fields": "budget"})))
            .await
            .unwrap_err();
        assert_eq!(err, StepError::MissingInput(vec!["budget".into()]));
    }

    #[tokio::test]
    async fn answered_fields_become_the_output() {
        let out = HumanInputExecutor
            .execute(ctx(serde_json::json!({
                "fields": ["approved"],
                "approved": true,
                "prompt": "Approve the spend?"
            })))
            .await
            .unwrap();
        assert_eq!(out.value.get_path(&["approved"]), Some(&Value::Bool(true)));
        assert_eq!(out.metadata.get("prompt"), Some(&Value::from("Approve the spend?")));
    }
}
