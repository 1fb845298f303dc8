use async_trait::async_trait;
use std::collections::HashMap;
use tokio::time::{sleep, Duration};
use weftcore::{ExecutorInfo, ParameterInfo, StepContext, StepError, StepExecutor, StepOutput, Value};

/// Internal computation steps (`system-reasoning`), selected by the
/// `operation` parameter.
///
/// | operation        | parameters             | output                      |
/// |------------------|------------------------|-----------------------------|
/// | `echo` (default) | any                    | the parameters, minus `operation` |
/// | `log`            | `message`, `level`     | `{message}`                 |
/// | `delay`          | `delay_ms`, `value`    | `value`                     |
/// | `json_parse`     | `json`                 | the parsed document         |
/// | `json_stringify` | `value`, `pretty`      | `{json}`                    |
/// | `set`            | `values` (object)      | `values`                    |
pub struct SystemExecutor;

#[async_trait]
impl StepExecutor for SystemExecutor {
    fn name(&self) -> &str {
        "system"
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, StepError> {
        let operation = ctx
            .parameters
            .get("operation")
            .and_then(|v| v.as_str())
            .unwrap_or("echo")
            .to_string();

        match operation.as_str() {
            "echo" => Ok(StepOutput::new(without_operation(&ctx.parameters))),
            "log" => log(&ctx),
            "delay" => delay(&ctx).await,
            "json_parse" => json_parse(&ctx),
            "json_stringify" => json_stringify(&ctx),
            "set" => {
                let values = ctx.require_param("values")?;
                if values.as_object().is_none() {
                    return Err(StepError::invalid("values", "expected an object"));
                }
                Ok(StepOutput::new(values.clone()))
            }
            other => Err(StepError::invalid(
                "operation",
                format!("unknown system operation '{}'", other),
            )),
        }
    }

    fn describe(&self) -> ExecutorInfo {
        ExecutorInfo {
            name: self.name().to_string(),
            description: "Internal computation: echo, log, delay, json_parse, json_stringify, set".to_string(),
            parameters: vec![
                ParameterInfo::optional("operation", "operation to run (default echo)"),
                ParameterInfo::optional("message", "log: text to write"),
                ParameterInfo::optional("delay_ms", "delay: milliseconds to wait (default 1000)"),
                ParameterInfo::optional("json", "json_parse: document text"),
                ParameterInfo::optional("value", "delay/json_stringify: value to pass through or encode"),
                ParameterInfo::optional("values", "set: object to publish as the step output"),
            ],
        }
    }
}

fn without_operation(parameters: &HashMap<String, Value>) -> HashMap<String, Value> {
    parameters
        .iter()
        .filter(|(k, _)| k.as_str() != "operation")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn log(ctx: &StepContext) -> Result<StepOutput, StepError> {
    let message = ctx
        .parameters
        .get("message")
        .map(Value::to_template_string)
        .unwrap_or_else(|| "(no message)".to_string());
    let level = ctx.parameters.get("level").and_then(|v| v.as_str()).unwrap_or("info");

    match level {
        "debug" => tracing::debug!(execution_id = %ctx.execution_id, step_id = %ctx.step_id, "{}", message),
        "warn" => tracing::warn!(execution_id = %ctx.execution_id, step_id = %ctx.step_id, "{}", message),
        "error" => tracing::error!(execution_id = %ctx.execution_id, step_id = %ctx.step_id, "{}", message),
        _ => tracing::info!(execution_id = %ctx.execution_id, step_id = %ctx.step_id, "{}", message),
    }

    Ok(StepOutput::default().with_output("message", message))
}

async fn delay(ctx: &StepContext) -> Result<StepOutput, StepError> {
    let delay_ms = match ctx.parameters.get("delay_ms") {
        None => 1000,
        Some(v) => v
            .as_f64()
            .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
            .filter(|ms| *ms >= 0.0)
            .ok_or_else(|| StepError::invalid("delay_ms", "expected a non-negative number"))?
            as u64,
    };

    tracing::debug!(step_id = %ctx.step_id, "Delaying for {}ms", delay_ms);
    tokio::select! {
        _ = sleep(Duration::from_millis(delay_ms)) => {}
        _ = ctx.cancellation.cancelled() => return Err(StepError::Cancelled),
    }

    Ok(StepOutput::new(ctx.param_or("value", Value::Null)))
}

fn json_parse(ctx: &StepContext) -> Result<StepOutput, StepError> {
    let input = ctx.require_str("json")?;
    let parsed: serde_json::Value = serde_json::from_str(input)
        .map_err(|e| StepError::permanent("json_parse", format!("JSON parse error: {}", e)))?;
    Ok(StepOutput::new(parsed))
}

fn json_stringify(ctx: &StepContext) -> Result<StepOutput, StepError> {
    let value = ctx.require_param("value")?.to_json();
    let pretty = ctx.parameters.get("pretty").is_some_and(Value::is_truthy);
    let json = if pretty {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .map_err(|e| StepError::permanent("json_stringify", format!("JSON stringify error: {}", e)))?;

    Ok(StepOutput::default().with_output("json", json))
}

#[cfg(test)]
mod tests {
    use super::*;
    use weftcore::{StepType, WorkflowStep};

    fn ctx(params: serde_json::Value) -> StepContext {
        let step = WorkflowStep::new("sys", StepType::SystemReasoning);
        let params = match Value::from(params) {
            Value::Object(map) => map,
            _ => HashMap::new(),
        };
        StepContext::new(uuid::Uuid::nil(), &step, params)
    }

    #[tokio::test]
    async fn echo_is_the_default_operation() {
        let out = SystemExecutor
            .execute(ctx(serde_json::json!({"a": 1, "b": "two"})))
            .await
            .unwrap();
        assert_eq!(out.value.get_path(&["a"]), Some(&Value::Integer(1)));
        assert_eq!(out.value.get_path(&["b"]), Some(&Value::from("two")));
    }

    #[tokio::test]
    async fn json_parse_produces_a_navigable_document() {
        let out = SystemExecutor
            .execute(ctx(serde_json::json!({
                "operation": "json_parse",
                "json": r#"{"user": {"email": "ada@x.io"}}"#
            })))
            .await
            .unwrap();
        assert_eq!(out.value.get_path(&["user", "email"]), Some(&Value::from("ada@x.io")));
    }

    #[tokio::test]
    async fn json_parse_rejects_bad_input_permanently() {
        let err = SystemExecutor
            .execute(ctx(serde_json::json!({"operation": "json_parse", "json": "{nope"})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "json_parse");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn json_stringify_is_compact_by_default() {
        let out = SystemExecutor
            .execute(ctx(serde_json::json!({"operation": "json_stringify", "value": [1, 2]})))
            .await
            .unwrap();
        assert_eq!(out.value.get_path(&["json"]), Some(&Value::from("[1,2]")));
    }

    #[tokio::test]
    async fn delay_accepts_numeric_strings() {
        let out = SystemExecutor
            .execute(ctx(serde_json::json!({"operation": "delay", "delay_ms": "5", "value": "kept"})))
            .await
            .unwrap();
        assert_eq!(out.value, Value::from("kept"));
    }

    #[tokio::test]
    async fn unknown_operation_is_invalid() {
        let err = SystemExecutor
            .execute(ctx(serde_json::json!({"operation": "teleport"})))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::InvalidParameter { .. }));
    }
}
