//! Outbound execution result contract.
//!
//! Field names are what external consumers see (serde `camelCase`), so
//! renames here are breaking changes for anyone persisting results.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Completed,
    Failed,
    Skipped,
}

/// Why a task was skipped rather than executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    /// The step's `condition` evaluated falsy.
    ConditionFalse,
    /// The run was cancelled before or while the task ran.
    Cancelled,
    /// A failure upstream prevented the task from starting.
    UpstreamFailure,
}

/// Per-task record in an [`ExecutionResult`], in wave-plan order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: String,
    pub task_ref: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The input after template substitution, as handed to the executor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_input: Option<Value>,
    /// Wall time spent in the task, microseconds.
    pub duration: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
}

/// Orchestration overhead breakdown, all in microseconds: the wall time the
/// engine spends outside task execution itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationCost {
    /// `execute()` entry to first task dispatch.
    pub setup_duration_micros: u64,
    /// Last task completion to `execute()` return.
    pub teardown_duration_micros: u64,
    /// Sum over waves of the gap between a wave start and the previous
    /// wave's end.
    pub scheduling_overhead_micros: u64,
    pub total_orchestration_cost_micros: u64,
    /// Share of total execution wall time spent on orchestration, percent.
    pub orchestration_cost_percentage: f64,
    /// Number of waves driven.
    pub execution_iterations: usize,
    #[serde(default)]
    pub waves: Vec<WaveStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaveStats {
    pub iteration: usize,
    pub task_ids: Vec<String>,
    pub duration_micros: u64,
    pub scheduling_delay_micros: u64,
}

/// Explicit vs. inferred dependencies per task, for debugging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDiagnostics {
    pub task_id: String,
    pub explicit_dependencies: Vec<String>,
    pub implicit_dependencies: Vec<String>,
}

/// Immutable outcome of one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub execution_id: String,
    pub workflow_name: String,
    pub status: WorkflowStatus,
    /// Output mapping resolved against the final context; entries whose
    /// dependencies never completed resolve to null.
    pub output: IndexMap<String, Value>,
    pub task_results: Vec<TaskResult>,
    /// The realized waves; may differ from the planned waves under failure.
    pub parallel_groups: Vec<Vec<String>>,
    /// First failing task by completion time, id ascending on ties.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution_time_ms: u64,
    pub graph_build_duration_micros: u64,
    pub orchestration_cost: OrchestrationCost,
    pub graph_diagnostics: Vec<TaskDiagnostics>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl ExecutionResult {
    /// Look up one task's record by id.
    #[must_use]
    pub fn task(&self, task_id: &str) -> Option<&TaskResult> {
        self.task_results.iter().find(|t| t.task_id == task_id)
    }

    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == WorkflowStatus::Succeeded
    }
}
