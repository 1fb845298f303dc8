use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use weftcore::{ExecutorInfo, ParameterInfo, StepContext, StepError, StepExecutor, StepOutput, Value};

/// Generic HTTP integration call.
///
/// Network errors, timeouts, 429 and 5xx responses are transient; other
/// non-success statuses are permanent. JSON response bodies are parsed so
/// downstream steps can reference fields (`{{fetch.body.id}}`).
pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepExecutor for HttpExecutor {
    fn name(&self) -> &str {
        "http"
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, StepError> {
        let url = ctx.require_str("url")?;
        let method_value = ctx.param_or("method", Value::from("GET"));
        let method = method_value.as_str().unwrap_or("GET").to_uppercase();

        tracing::info!(step_id = %ctx.step_id, "{} {}", method, url);

        let mut request = match method.as_str() {
            "GET" => self.client.get(url),
            "POST" => self.client.post(url),
            "PUT" => self.client.put(url),
            "PATCH" => self.client.patch(url),
            "DELETE" => self.client.delete(url),
            _ => return Err(StepError::invalid("method", format!("Unsupported method: {}", method))),
        };

        if let Some(Value::Object(headers)) = ctx.parameters.get("headers") {
            for (key, value) in headers {
                request = request.header(key, value.to_template_string());
            }
        }

        if let Some(Value::Object(query)) = ctx.parameters.get("query") {
            let pairs: Vec<(String, String)> = query
                .iter()
                .map(|(k, v)| (k.clone(), v.to_template_string()))
                .collect();
            request = request.query(&pairs);
        }

        match ctx.parameters.get("body") {
            None | Some(Value::Null) => {}
            Some(Value::String(text)) => request = request.body(text.clone()),
            Some(other) => request = request.json(&other.to_json()),
        }

        if let Some(ms) = ctx.parameters.get("timeout_ms").and_then(Value::as_i64) {
            request = request.timeout(Duration::from_millis(ms.max(0) as u64));
        }

        let response = request.send().await.map_err(classify_send_error)?;

        let status = response.status();
        let headers: HashMap<String, Value> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), Value::from(v.to_str().unwrap_or(""))))
            .collect();

        let body_text = response
            .text()
            .await
            .map_err(|e| StepError::transient("network", format!("Failed to read response: {}", e)))?;

        tracing::debug!(step_id = %ctx.step_id, "Response status: {}", status);

        if status.as_u16() == 429 || status.is_server_error() {
            return Err(StepError::transient(
                format!("http_{}", status.as_u16()),
                format!("{} {} returned {}", method, url, status),
            ));
        }
        if !status.is_success() {
            return Err(StepError::permanent(
                format!("http_{}", status.as_u16()),
                format!("{} {} returned {}: {}", method, url, status, truncate(&body_text, 200)),
            ));
        }

        let body = serde_json::from_str::<serde_json::Value>(&body_text)
            .map(Value::from)
            .unwrap_or(Value::String(body_text));

        Ok(StepOutput::default()
            .with_output("status", status.as_u16() as i64)
            .with_output("body", body)
            .with_output("headers", Value::Object(headers))
            .with_metadata("url", url))
    }

    fn describe(&self) -> ExecutorInfo {
        ExecutorInfo {
            name: self.name().to_string(),
            description: "Make HTTP requests".to_string(),
            parameters: vec![
                ParameterInfo::required("url", "request URL"),
                ParameterInfo::optional("method", "GET (default), POST, PUT, PATCH, DELETE"),
                ParameterInfo::optional("headers", "object of header values"),
                ParameterInfo::optional("query", "object of query parameters"),
                ParameterInfo::optional("body", "string body, or any other value sent as JSON"),
                ParameterInfo::optional("timeout_ms", "per-request timeout"),
            ],
        }
    }
}

fn classify_send_error(e: reqwest::Error) -> StepError {
    if e.is_timeout() {
        StepError::transient("timeout", format!("HTTP request timed out: {}", e))
    } else if e.is_builder() {
        StepError::invalid("url", e.to_string())
    } else {
        StepError::transient("network", format!("HTTP request failed: {}", e))
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("ok", 10), "ok");
    }
}
