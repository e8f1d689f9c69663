//! In-memory execution sink, for tests and ephemeral runs.

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::execution::ExecutionResult;
use crate::sink::{ExecutionSink, Result};

/// Stores every result it is handed, in arrival order.
#[derive(Debug, Default)]
pub struct InMemorySink {
    results: RwLock<Vec<ExecutionResult>>,
}

impl InMemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn results(&self) -> Vec<ExecutionResult> {
        self.results.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.results.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.results.read().await.is_empty()
    }
}

#[async_trait]
impl ExecutionSink for InMemorySink {
    async fn on_result(&self, result: &ExecutionResult) -> Result<()> {
        self.results.write().await.push(result.clone());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::execution::{OrchestrationCost, WorkflowStatus};
    use indexmap::IndexMap;

    fn sample_result(id: &str) -> ExecutionResult {
        ExecutionResult {
            execution_id: id.to_string(),
            workflow_name: "sample".to_string(),
            status: WorkflowStatus::Succeeded,
            output: IndexMap::new(),
            task_results: Vec::new(),
            parallel_groups: Vec::new(),
            failed_task: None,
            error: None,
            execution_time_ms: 0,
            graph_build_duration_micros: 0,
            orchestration_cost: OrchestrationCost {
                setup_duration_micros: 0,
                teardown_duration_micros: 0,
                scheduling_overhead_micros: 0,
                total_orchestration_cost_micros: 0,
                orchestration_cost_percentage: 0.0,
                execution_iterations: 0,
                waves: Vec::new(),
            },
            graph_diagnostics: Vec::new(),
            started_at: chrono::Utc::now(),
            completed_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn stores_results_in_order() {
        let sink = InMemorySink::new();
        sink.on_result(&sample_result("run-1")).await.unwrap();
        sink.on_result(&sample_result("run-2")).await.unwrap();
        let stored = sink.results().await;
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].execution_id, "run-1");
        assert_eq!(stored[1].execution_id, "run-2");
        assert!(!sink.is_empty().await);
    }
}
