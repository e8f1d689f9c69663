//! Task executor port.
//!
//! The scheduler hands every task to a [`TaskExecutor`] and never inspects
//! task kinds itself; composing a kind-dispatching executor is the caller's
//! business (see [`crate::providers::executors::DispatchExecutor`]).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::prelude::*;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::workflow::TaskDefinition;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Execution error: {message}"))]
    Execution { message: String },

    #[snafu(display("No executor registered for task kind '{kind}'"))]
    UnknownKind { kind: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a task failure, mirrored into the run's error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    Execution,
    Timeout,
    Template,
    Cancelled,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::Execution => "ExecutionError",
            FailureKind::Timeout => "TimeoutError",
            FailureKind::Template => "TemplateError",
            FailureKind::Cancelled => "CancelledError",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

impl TaskFailure {
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status_code: None,
        }
    }

    #[must_use]
    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }
}

/// What one executor invocation produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskFailure>,
    /// Microseconds, as measured by the executor.
    pub duration: u64,
}

impl TaskExecutionResult {
    #[must_use]
    pub fn completed(output: Value, duration: u64) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
            duration,
        }
    }

    #[must_use]
    pub fn failed(error: TaskFailure, duration: u64) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error),
            duration,
        }
    }
}

/// Abstract capability to run one resolved task.
///
/// Retry and backoff are the implementor's concern, configured from the
/// step's opaque retry policy; the engine never re-invokes a failed task.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run `definition` with the fully resolved `input`.
    ///
    /// Implementations should observe `timeout` and `cancel` cooperatively;
    /// the engine additionally enforces the timeout from the outside.
    ///
    /// # Errors
    /// Infrastructure-level failures only; task-level failures are data in
    /// the returned [`TaskExecutionResult`].
    async fn execute(
        &self,
        definition: &TaskDefinition,
        input: &Value,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<TaskExecutionResult>;
}
