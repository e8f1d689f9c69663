//! Canned-response executor for tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::executor::{FailureKind, Result, TaskExecutionResult, TaskExecutor, TaskFailure};
use crate::workflow::TaskDefinition;

/// One pre-registered response.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub success: bool,
    pub output: Value,
    pub error: Option<TaskFailure>,
    /// Per-response simulated latency; overrides the executor-wide delay.
    pub delay: Option<Duration>,
}

impl MockResponse {
    #[must_use]
    pub fn completed(output: Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
            delay: None,
        }
    }

    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Value::Null,
            error: Some(TaskFailure::new(FailureKind::Execution, message)),
            delay: None,
        }
    }

    #[must_use]
    pub fn failed_with_status(message: impl Into<String>, status_code: u16) -> Self {
        Self {
            success: false,
            output: Value::Null,
            error: Some(
                TaskFailure::new(FailureKind::Execution, message).with_status(status_code),
            ),
            delay: None,
        }
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// One recorded invocation, in call order.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub task_ref: String,
    pub input: Value,
}

/// Executor that serves pre-registered responses per task ref.
///
/// Responses queue FIFO per ref; when a queue is empty the default response
/// applies (an empty completed output unless overridden). Every invocation
/// is recorded so tests can assert resolved inputs and call order.
pub struct MockExecutor {
    responses: Mutex<HashMap<String, VecDeque<MockResponse>>>,
    default_response: Mutex<MockResponse>,
    delay: Option<Duration>,
    calls: Mutex<Vec<MockCall>>,
}

impl MockExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            default_response: Mutex::new(MockResponse::completed(Value::Object(
                serde_json::Map::new(),
            ))),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Apply a simulated latency to every response without its own delay.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue a response for a task ref. Responses are consumed FIFO.
    pub fn enqueue(&self, task_ref: impl Into<String>, response: MockResponse) {
        let mut responses = lock(&self.responses);
        responses
            .entry(task_ref.into())
            .or_default()
            .push_back(response);
    }

    /// Replace the fallback used when a ref's queue is empty.
    pub fn set_default(&self, response: MockResponse) {
        *lock(&self.default_response) = response;
    }

    /// All invocations so far, in call order.
    #[must_use]
    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.calls).clone()
    }

    /// Invocations of one task ref, in call order.
    #[must_use]
    pub fn calls_for(&self, task_ref: &str) -> Vec<MockCall> {
        lock(&self.calls)
            .iter()
            .filter(|call| call.task_ref == task_ref)
            .cloned()
            .collect()
    }

    fn next_response(&self, task_ref: &str) -> MockResponse {
        let mut responses = lock(&self.responses);
        responses
            .get_mut(task_ref)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| lock(&self.default_response).clone())
    }
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[async_trait]
impl TaskExecutor for MockExecutor {
    async fn execute(
        &self,
        definition: &TaskDefinition,
        input: &Value,
        _timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<TaskExecutionResult> {
        let started = Instant::now();
        {
            let mut calls = lock(&self.calls);
            calls.push(MockCall {
                task_ref: definition.name.clone(),
                input: input.clone(),
            });
        }
        let response = self.next_response(&definition.name);

        if let Some(delay) = response.delay.or(self.delay) {
            tokio::select! {
                () = cancel.cancelled() => {
                    let duration = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
                    return Ok(TaskExecutionResult::failed(
                        TaskFailure::new(FailureKind::Cancelled, "cancelled during simulated delay"),
                        duration,
                    ));
                }
                () = tokio::time::sleep(delay) => {}
            }
        }

        let duration = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
        if response.success {
            Ok(TaskExecutionResult::completed(response.output, duration))
        } else {
            let failure = response
                .error
                .unwrap_or_else(|| TaskFailure::new(FailureKind::Execution, "mock failure"));
            Ok(TaskExecutionResult::failed(failure, duration))
        }
    }
}
