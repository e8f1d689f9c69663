//! Task executor providers.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::executor::{Error, Result, TaskExecutionResult, TaskExecutor};
use crate::workflow::TaskDefinition;

mod http;
mod mock;
mod transform;

pub use http::HttpExecutor;
pub use mock::{MockCall, MockExecutor, MockResponse};
pub use transform::TransformExecutor;

/// Routes tasks to executors by definition kind.
///
/// The engine itself never inspects kinds; this is the composition point
/// for callers who want one executor per kind.
pub struct DispatchExecutor {
    executors: HashMap<String, Arc<dyn TaskExecutor>>,
}

impl DispatchExecutor {
    /// An empty registry; register kinds with [`with_executor`].
    ///
    /// [`with_executor`]: DispatchExecutor::with_executor
    #[must_use]
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// The stock registry: `http` and `transform`.
    #[must_use]
    pub fn standard() -> Self {
        Self::new()
            .with_executor("http", Arc::new(HttpExecutor::new()))
            .with_executor("transform", Arc::new(TransformExecutor::new()))
    }

    #[must_use]
    pub fn with_executor(mut self, kind: impl Into<String>, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executors.insert(kind.into(), executor);
        self
    }
}

impl Default for DispatchExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskExecutor for DispatchExecutor {
    async fn execute(
        &self,
        definition: &TaskDefinition,
        input: &Value,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<TaskExecutionResult> {
        let Some(executor) = self.executors.get(&definition.kind) else {
            return Err(Error::UnknownKind {
                kind: definition.kind.clone(),
            });
        };
        executor.execute(definition, input, timeout, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use serde_json::json;

    fn definition(kind: &str) -> TaskDefinition {
        TaskDefinition {
            name: "probe".to_string(),
            kind: kind.to_string(),
            input_schema: IndexMap::new(),
            output_schema: IndexMap::new(),
            spec: json!({}),
        }
    }

    #[tokio::test]
    async fn unknown_kind_is_an_error() {
        let dispatch = DispatchExecutor::new();
        let err = dispatch
            .execute(
                &definition("mystery"),
                &json!({}),
                Duration::from_secs(1),
                &CancelToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownKind { ref kind } if kind == "mystery"));
    }

    #[tokio::test]
    async fn routes_to_registered_executor() {
        let mock = Arc::new(MockExecutor::new());
        mock.enqueue("probe", MockResponse::completed(json!({"ok": true})));
        let dispatch = DispatchExecutor::new().with_executor("custom", mock);
        let result = dispatch
            .execute(
                &definition("custom"),
                &json!({}),
                Duration::from_secs(1),
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output, Some(json!({"ok": true})));
    }
}
