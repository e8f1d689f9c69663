//! Transform task executor.
//!
//! Runs the definition's jq query (`spec.query`) over the resolved input.
//! The query language is this executor's private concern; the orchestrator
//! only sees a task kind and an output.

use async_trait::async_trait;
use serde_json::Value;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::executor::{
    Error, FailureKind, Result, TaskExecutionResult, TaskExecutor, TaskFailure,
};
use crate::workflow::TaskDefinition;

pub struct TransformExecutor;

impl TransformExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for TransformExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskExecutor for TransformExecutor {
    async fn execute(
        &self,
        definition: &TaskDefinition,
        input: &Value,
        _timeout: Duration,
        _cancel: &CancelToken,
    ) -> Result<TaskExecutionResult> {
        let started = Instant::now();
        let Some(query) = definition.spec.get("query").and_then(Value::as_str) else {
            return Err(Error::Execution {
                message: format!(
                    "task definition '{}' has no 'query' in its spec",
                    definition.name
                ),
            });
        };

        let duration = |started: Instant| {
            u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX)
        };
        match evaluate_query(query, input) {
            Ok(output) => Ok(TaskExecutionResult::completed(output, duration(started))),
            Err(message) => Ok(TaskExecutionResult::failed(
                TaskFailure::new(FailureKind::Execution, message),
                duration(started),
            )),
        }
    }
}

/// Compile and run one jq filter over a value, returning its first result.
fn evaluate_query(query: &str, input: &Value) -> std::result::Result<Value, String> {
    use jaq_core::{
        Ctx,
        compile::Compiler,
        load::{Arena, File, Loader},
    };

    let arena = Arena::default();
    let loader = Loader::new(jaq_std::defs().chain(jaq_json::defs()));
    let file: File<_, ()> = File {
        path: (),
        code: query,
    };

    let modules = loader
        .load(&arena, file)
        .map_err(|errors| format!("jq load errors: {errors:?}"))?;

    let compiler = Compiler::default().with_funs(jaq_std::funs().chain(jaq_json::funs()));
    let filter = compiler
        .compile(modules)
        .map_err(|errors| format!("jq compile errors: {errors:?}"))?;

    let value: jaq_json::Val = input.clone().into();
    let inputs = jaq_core::RcIter::new(core::iter::empty());
    let mut results = filter.run((Ctx::new([], &inputs), value));

    match results.next() {
        None => Ok(Value::Null),
        Some(Ok(val)) => Ok(val.into()),
        Some(Err(error)) => Err(format!("jq evaluation error: {error}")),
    }
}
