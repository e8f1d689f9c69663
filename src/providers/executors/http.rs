//! HTTP task executor.
//!
//! Interprets an `http` task definition's spec (`url`, `method`, optional
//! `headers` map) and sends the resolved input as a JSON body for
//! POST/PUT/PATCH. Dynamic request content belongs in the step's input
//! templates; the spec itself is taken literally.

use async_trait::async_trait;
use serde_json::Value;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::executor::{
    Error, FailureKind, Result, TaskExecutionResult, TaskExecutor, TaskFailure,
};
use crate::workflow::TaskDefinition;

pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskExecutor for HttpExecutor {
    async fn execute(
        &self,
        definition: &TaskDefinition,
        input: &Value,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<TaskExecutionResult> {
        let started = Instant::now();

        let Some(url) = definition.spec.get("url").and_then(Value::as_str) else {
            return Err(Error::Execution {
                message: format!("task definition '{}' has no 'url' in its spec", definition.name),
            });
        };
        let method = definition
            .spec
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("get");

        let mut request = match method.to_lowercase().as_str() {
            "post" => self.client.post(url),
            "put" => self.client.put(url),
            "delete" => self.client.delete(url),
            "patch" => self.client.patch(url),
            _ => self.client.get(url),
        };
        request = request.timeout(timeout);

        if let Some(headers) = definition.spec.get("headers").and_then(Value::as_object) {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name, value);
                }
            }
        }

        let lowered = method.to_lowercase();
        if matches!(lowered.as_str(), "post" | "put" | "patch") {
            request = request.json(input);
        }

        let response = tokio::select! {
            () = cancel.cancelled() => {
                let duration = elapsed_micros(started);
                return Ok(TaskExecutionResult::failed(
                    TaskFailure::new(FailureKind::Cancelled, "request cancelled"),
                    duration,
                ));
            }
            sent = request.send() => sent,
        };

        let duration = elapsed_micros(started);
        match response {
            Ok(response) => {
                let status = response.status();
                let body = response
                    .json::<Value>()
                    .await
                    .unwrap_or_else(|_| Value::Object(serde_json::Map::new()));
                if status.is_success() {
                    Ok(TaskExecutionResult::completed(body, duration))
                } else {
                    let failure = TaskFailure::new(
                        FailureKind::Execution,
                        format!(
                            "{} request to {url} failed with status {}",
                            lowered.to_uppercase(),
                            status.as_u16(),
                        ),
                    )
                    .with_status(status.as_u16());
                    Ok(TaskExecutionResult::failed(failure, duration))
                }
            }
            Err(error) => {
                let kind = if error.is_timeout() {
                    FailureKind::Timeout
                } else {
                    FailureKind::Execution
                };
                Ok(TaskExecutionResult::failed(
                    TaskFailure::new(kind, error.to_string()),
                    duration,
                ))
            }
        }
    }
}

fn elapsed_micros(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX)
}
