//! The scheduler / orchestrator.
//!
//! [`Engine::execute`] drives a workflow through its topological waves:
//! tasks within a wave run concurrently under one semaphore, waves advance
//! strictly in order, and the context grows as outputs arrive. Failures
//! stop new waves by default (`fail_fast`); with `fail_fast` off only the
//! transitive dependents of a failure are skipped.

use indexmap::IndexMap;
use serde_json::Value;
use snafu::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::context::{ExecutionContext, TaskRecord};
use crate::execution::{
    ExecutionResult, SkipReason, TaskResult, TaskStatus, WorkflowStatus,
};
use crate::executor::{FailureKind, TaskExecutor, TaskFailure};
use crate::expressions;
use crate::ids::{IdGenerator, UuidGenerator};
use crate::sink::ExecutionSink;
use crate::workflow::{TaskDefinition, TaskStep, WorkflowDefinition};

// Submodules
mod cost;
mod foreach;
pub mod graph;

pub use graph::ExecutionGraph;

use cost::CostTracker;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Build error: {source}"))]
    Build { source: graph::Error },

    #[snafu(display("Validation error: {source}"))]
    Validation { source: crate::workflow::Error },

    #[snafu(display("Template error: {source}"))]
    Template { source: crate::expressions::Error },

    #[snafu(display("Context error: {source}"))]
    Context { source: crate::context::Error },

    #[snafu(display("Workflow execution error: {message}"))]
    WorkflowExecution { message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

// Manual From implementations for error conversions
impl From<graph::Error> for Error {
    fn from(source: graph::Error) -> Self {
        Error::Build { source }
    }
}

impl From<crate::workflow::Error> for Error {
    fn from(source: crate::workflow::Error) -> Self {
        Error::Validation { source }
    }
}

impl From<crate::expressions::Error> for Error {
    fn from(source: crate::expressions::Error) -> Self {
        Error::Template { source }
    }
}

impl From<crate::context::Error> for Error {
    fn from(source: crate::context::Error) -> Self {
        Error::Context { source }
    }
}

/// The workflow orchestrator. Cheap to clone; all ports are shared.
///
/// Everything the engine needs is injected (executor, sink, clock, id
/// generator), so runs are deterministic under test doubles.
#[derive(Clone)]
pub struct Engine {
    executor: Arc<dyn TaskExecutor>,
    sink: Option<Arc<dyn ExecutionSink>>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    config: EngineConfig,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Create an engine around a task executor, with default ports and
    /// configuration. Use [`EngineBuilder`](crate::builder::EngineBuilder)
    /// to customize.
    #[must_use]
    pub fn new(executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            executor,
            sink: None,
            clock: Arc::new(SystemClock::new()),
            ids: Arc::new(UuidGenerator),
            config: EngineConfig::default(),
        }
    }

    pub(crate) fn from_parts(
        executor: Arc<dyn TaskExecutor>,
        sink: Option<Arc<dyn ExecutionSink>>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        config: EngineConfig,
    ) -> Self {
        Self {
            executor,
            sink,
            clock,
            ids,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn clock_micros(&self) -> u64 {
        self.clock.now_micros()
    }

    /// Build the execution graph without executing: merged dependencies,
    /// planned waves, and diagnostics.
    ///
    /// # Errors
    /// Returns [`Error::Build`] for unknown dependencies or task refs,
    /// duplicate ids, cycles, and excessive forEach nesting.
    pub fn plan(
        &self,
        workflow: &WorkflowDefinition,
        definitions: &[TaskDefinition],
    ) -> Result<ExecutionGraph> {
        let definitions = index_definitions(definitions);
        Ok(graph::build(workflow, &definitions, &self.config)?)
    }

    /// Execute a workflow to completion and return its sealed result.
    ///
    /// Build and validation failures are reported as a `Failed` result with
    /// empty task results; no task runs in that case.
    pub async fn execute(
        &self,
        workflow: &WorkflowDefinition,
        definitions: &[TaskDefinition],
        input: Value,
    ) -> ExecutionResult {
        self.execute_with_cancel(workflow, definitions, input, CancelToken::new())
            .await
    }

    /// Execute with an externally controlled cancellation token. One token
    /// scopes the whole run: in-flight tasks are asked to stop and report
    /// as skipped, and no further waves start.
    pub async fn execute_with_cancel(
        &self,
        workflow: &WorkflowDefinition,
        definitions: &[TaskDefinition],
        input: Value,
        cancel: CancelToken,
    ) -> ExecutionResult {
        let mut tracker = CostTracker::new(Arc::clone(&self.clock));
        let execution_id = self.ids.next_id();
        let started_at = self.clock.wall_now();
        info!(
            workflow = %workflow.name,
            execution_id = %execution_id,
            "starting workflow execution"
        );

        let input = if input.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            input
        };

        if let Err(source) = workflow.validate_input(&input) {
            let message = Error::Validation { source }.to_string();
            warn!(workflow = %workflow.name, error = %message, "input validation failed");
            return self
                .seal(empty_failed_result(
                    execution_id,
                    workflow,
                    message,
                    started_at,
                    self.clock.wall_now(),
                    tracker,
                    0,
                ))
                .await;
        }

        let definitions = Arc::new(index_definitions(definitions));
        let build_started = tracker.now();
        let graph = match graph::build(workflow, &definitions, &self.config) {
            Ok(graph) => {
                tracker.record_graph_build(build_started);
                graph
            }
            Err(source) => {
                tracker.record_graph_build(build_started);
                let graph_build = tracker.graph_build_micros();
                let message = Error::Build { source }.to_string();
                warn!(workflow = %workflow.name, error = %message, "graph build failed");
                return self
                    .seal(empty_failed_result(
                        execution_id,
                        workflow,
                        message,
                        started_at,
                        self.clock.wall_now(),
                        tracker,
                        graph_build,
                    ))
                    .await;
            }
        };
        debug!(
            tasks = graph.task_count(),
            waves = graph.waves().len(),
            "execution graph built"
        );

        let steps: HashMap<String, TaskStep> = workflow
            .tasks
            .iter()
            .map(|step| (step.id.clone(), step.clone()))
            .collect();
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency_limit.max(1)));
        let mut ctx = ExecutionContext::new(input);
        let mut reports: HashMap<String, StepReport> = HashMap::new();
        let mut realized: Vec<Vec<String>> = Vec::new();
        let mut first_failure: Option<(u64, String)> = None;
        let mut run_cancelled = false;

        for (iteration, wave) in graph.waves().iter().enumerate() {
            if cancel.is_cancelled() {
                run_cancelled = true;
                break;
            }
            if first_failure.is_some() && self.config.fail_fast {
                debug!(iteration, "fail-fast: not starting further waves");
                break;
            }

            tracker.wave_started(iteration, wave.clone());
            debug!(iteration, tasks = ?wave, "starting wave");

            let mut join_set: JoinSet<StepReport> = JoinSet::new();
            let mut group: Vec<String> = Vec::new();

            for id in wave {
                let Some(step) = steps.get(id) else { continue };
                if !self.config.fail_fast
                    && upstream_blocked(graph.dependencies_of(id), &reports)
                {
                    let report = StepReport::skipped(
                        step,
                        SkipReason::UpstreamFailure,
                        tracker.now(),
                    );
                    store_report(&mut ctx, &mut reports, report);
                    group.push(id.clone());
                    continue;
                }
                group.push(id.clone());
                tracker.task_dispatched();
                join_set.spawn(self.clone().run_step(
                    step.clone(),
                    ctx.clone(),
                    Arc::clone(&definitions),
                    Arc::clone(&semaphore),
                    cancel.clone(),
                ));
            }

            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(report) => {
                        if report.status == TaskStatus::Failed {
                            let key = (report.finished_micros, report.id.clone());
                            if first_failure.as_ref().is_none_or(|held| key < *held) {
                                first_failure = Some(key);
                            }
                        }
                        store_report(&mut ctx, &mut reports, report);
                    }
                    Err(join_error) => {
                        warn!(error = %join_error, "task join failed");
                    }
                }
            }

            if !group.is_empty() {
                realized.push(group);
            }
            tracker.wave_finished();
        }

        // Anything without a report never started.
        let cancelled = run_cancelled || cancel.is_cancelled();
        let leftover_reason = if cancelled {
            SkipReason::Cancelled
        } else {
            SkipReason::UpstreamFailure
        };
        for wave in graph.waves() {
            for id in wave {
                if !reports.contains_key(id)
                    && let Some(step) = steps.get(id)
                {
                    let report = StepReport::skipped(step, leftover_reason, tracker.now());
                    store_report(&mut ctx, &mut reports, report);
                }
            }
        }

        let mut output = IndexMap::new();
        for (name, template) in &workflow.output_mapping {
            let value = match expressions::resolve_string(template, &ctx) {
                Ok(value) => value,
                Err(error) => {
                    warn!(output = %name, error = %error, "workflow output did not resolve");
                    Value::Null
                }
            };
            output.insert(name.clone(), value);
        }

        let failed_task = first_failure.map(|(_, id)| id);
        let status = if failed_task.is_some() || cancelled {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Succeeded
        };
        let error = failed_task
            .as_ref()
            .and_then(|id| reports.get(id).and_then(StepReport::error_message))
            .or_else(|| cancelled.then(|| "execution cancelled".to_string()));

        let mut task_results = Vec::new();
        for wave in graph.waves() {
            for id in wave {
                if let Some(report) = reports.remove(id) {
                    task_results.push(report.into_task_result());
                }
            }
        }

        let graph_build_duration_micros = tracker.graph_build_micros();
        let (orchestration_cost, execution_time_ms) = tracker.finish();
        let completed_at = self.clock.wall_now();
        info!(
            workflow = %workflow.name,
            execution_id = %execution_id,
            status = ?status,
            execution_time_ms,
            "workflow execution finished"
        );

        self.seal(ExecutionResult {
            execution_id,
            workflow_name: workflow.name.clone(),
            status,
            output,
            task_results,
            parallel_groups: realized,
            failed_task,
            error,
            execution_time_ms,
            graph_build_duration_micros,
            orchestration_cost,
            graph_diagnostics: graph.diagnostics().to_vec(),
            started_at,
            completed_at,
        })
        .await
    }

    /// Drive one step to a terminal state: condition, forEach expansion, or
    /// a plain executor dispatch under the semaphore.
    pub(crate) async fn run_step(
        self,
        step: TaskStep,
        ctx: ExecutionContext,
        definitions: Arc<IndexMap<String, TaskDefinition>>,
        semaphore: Arc<Semaphore>,
        cancel: CancelToken,
    ) -> StepReport {
        if cancel.is_cancelled() {
            return StepReport::skipped(&step, SkipReason::Cancelled, self.clock_micros());
        }

        if let Some(condition) = &step.condition {
            match expressions::resolve_string(condition, &ctx) {
                Ok(value) => {
                    if !expressions::truthy(&value) {
                        debug!(task = %step.id, "condition evaluated falsy, skipping");
                        return StepReport::skipped(
                            &step,
                            SkipReason::ConditionFalse,
                            self.clock_micros(),
                        );
                    }
                }
                Err(error) => {
                    return StepReport::failed(
                        &step,
                        TaskFailure::new(FailureKind::Template, error.to_string()),
                        None,
                        0,
                        self.clock_micros(),
                    );
                }
            }
        }

        if step.for_each.is_some() {
            return foreach::run_for_each(self, step, ctx, definitions, semaphore, cancel).await;
        }

        let resolved = match resolve_step_input(&step, &ctx) {
            Ok(resolved) => resolved,
            Err(error) => {
                return StepReport::failed(
                    &step,
                    TaskFailure::new(FailureKind::Template, error.to_string()),
                    None,
                    0,
                    self.clock_micros(),
                );
            }
        };

        let Some(definition) = definitions.get(&step.task_ref) else {
            // Build validation makes this unreachable; stay defensive.
            return StepReport::failed(
                &step,
                TaskFailure::new(
                    FailureKind::Execution,
                    format!("unknown task definition '{}'", step.task_ref),
                ),
                Some(resolved),
                0,
                self.clock_micros(),
            );
        };

        let timeout = step
            .timeout
            .map_or_else(|| self.config.default_task_timeout(), Duration::from_millis);

        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_closed) => {
                return StepReport::failed(
                    &step,
                    TaskFailure::new(FailureKind::Execution, "concurrency semaphore closed"),
                    Some(resolved),
                    0,
                    self.clock_micros(),
                );
            }
        };

        let started = self.clock_micros();
        debug!(task = %step.id, task_ref = %step.task_ref, "dispatching task");
        let outcome = tokio::select! {
            () = cancel.cancelled() => None,
            result = tokio::time::timeout(
                timeout,
                self.executor.execute(definition, &resolved, timeout, &cancel),
            ) => Some(result),
        };
        drop(permit);

        let finished = self.clock_micros();
        let duration = finished.saturating_sub(started);
        match outcome {
            None => {
                debug!(task = %step.id, "task cancelled in flight");
                StepReport::skipped(&step, SkipReason::Cancelled, finished)
            }
            Some(Err(_elapsed)) => StepReport::failed(
                &step,
                TaskFailure::new(
                    FailureKind::Timeout,
                    format!("task '{}' exceeded its timeout of {timeout:?}", step.id),
                ),
                Some(resolved),
                duration,
                finished,
            ),
            Some(Ok(Err(error))) => StepReport::failed(
                &step,
                TaskFailure::new(FailureKind::Execution, error.to_string()),
                Some(resolved),
                duration,
                finished,
            ),
            Some(Ok(Ok(execution))) => {
                if execution.success {
                    let output = execution
                        .output
                        .unwrap_or(Value::Object(serde_json::Map::new()));
                    debug!(task = %step.id, duration, "task completed");
                    StepReport::completed(&step, output, resolved, duration, finished)
                } else {
                    let failure = execution.error.unwrap_or_else(|| {
                        TaskFailure::new(
                            FailureKind::Execution,
                            "task failed without error detail",
                        )
                    });
                    debug!(task = %step.id, error = %failure.message, "task failed");
                    StepReport::failed(&step, failure, Some(resolved), duration, finished)
                }
            }
        }
    }

    async fn seal(&self, result: ExecutionResult) -> ExecutionResult {
        if let Some(sink) = &self.sink
            && let Err(error) = sink.on_result(&result).await
        {
            warn!(error = %error, "execution sink rejected result");
        }
        result
    }
}

/// Terminal outcome of one step, as produced by [`Engine::run_step`].
#[derive(Debug, Clone)]
pub(crate) struct StepReport {
    pub id: String,
    pub task_ref: String,
    pub status: TaskStatus,
    pub output: Value,
    pub failure: Option<TaskFailure>,
    pub resolved_input: Option<Value>,
    pub duration: u64,
    pub skip_reason: Option<SkipReason>,
    pub finished_micros: u64,
}

impl StepReport {
    pub fn completed(
        step: &TaskStep,
        output: Value,
        resolved_input: Value,
        duration: u64,
        finished_micros: u64,
    ) -> Self {
        Self {
            id: step.id.clone(),
            task_ref: step.task_ref.clone(),
            status: TaskStatus::Completed,
            output,
            failure: None,
            resolved_input: Some(resolved_input),
            duration,
            skip_reason: None,
            finished_micros,
        }
    }

    pub fn failed(
        step: &TaskStep,
        failure: TaskFailure,
        resolved_input: Option<Value>,
        duration: u64,
        finished_micros: u64,
    ) -> Self {
        Self {
            id: step.id.clone(),
            task_ref: step.task_ref.clone(),
            status: TaskStatus::Failed,
            output: Value::Null,
            failure: Some(failure),
            resolved_input,
            duration,
            skip_reason: None,
            finished_micros,
        }
    }

    pub fn skipped(step: &TaskStep, reason: SkipReason, finished_micros: u64) -> Self {
        Self {
            id: step.id.clone(),
            task_ref: step.task_ref.clone(),
            status: TaskStatus::Skipped,
            output: Value::Object(serde_json::Map::new()),
            failure: None,
            resolved_input: None,
            duration: 0,
            skip_reason: Some(reason),
            finished_micros,
        }
    }

    pub fn error_message(&self) -> Option<String> {
        self.failure.as_ref().map(|failure| {
            let mut message = format!("{}: {}", failure.kind, failure.message);
            if let Some(status) = failure.status_code {
                message.push_str(&format!(" (status {status})"));
            }
            message
        })
    }

    pub fn into_task_result(self) -> TaskResult {
        let error = self.error_message();
        let output = match self.status {
            TaskStatus::Completed => Some(self.output),
            TaskStatus::Failed | TaskStatus::Skipped => None,
        };
        TaskResult {
            task_id: self.id,
            task_ref: self.task_ref,
            status: self.status,
            output,
            error,
            resolved_input: self.resolved_input,
            duration: self.duration,
            skip_reason: self.skip_reason,
        }
    }

    fn into_record(self) -> TaskRecord {
        match self.status {
            TaskStatus::Completed => TaskRecord::completed(self.output, self.duration),
            TaskStatus::Failed => TaskRecord::failed(
                self.error_message()
                    .unwrap_or_else(|| "task failed".to_string()),
                self.duration,
            ),
            TaskStatus::Skipped => TaskRecord::skipped(),
        }
    }
}

fn store_report(
    ctx: &mut ExecutionContext,
    reports: &mut HashMap<String, StepReport>,
    report: StepReport,
) {
    if let Err(error) = ctx.insert_record(&report.id, report.clone().into_record()) {
        warn!(task = %report.id, error = %error, "dropping duplicate task record");
        return;
    }
    reports.insert(report.id.clone(), report);
}

/// With `fail_fast` off, a task only runs if none of its dependencies
/// failed or were skipped for anything other than their own condition.
/// Shared by the top-level scheduler and forEach body sub-plans.
pub(crate) fn upstream_blocked(
    deps: Option<&BTreeSet<String>>,
    reports: &HashMap<String, StepReport>,
) -> bool {
    deps.is_some_and(|deps| {
        deps.iter().any(|dep| {
            reports.get(dep).is_some_and(|report| match report.status {
                TaskStatus::Failed => true,
                TaskStatus::Skipped => {
                    report.skip_reason != Some(SkipReason::ConditionFalse)
                }
                TaskStatus::Completed => false,
            })
        })
    })
}

pub(crate) fn resolve_step_input(
    step: &TaskStep,
    ctx: &ExecutionContext,
) -> crate::expressions::Result<Value> {
    let mut resolved = serde_json::Map::new();
    for (field, value) in &step.input {
        resolved.insert(field.clone(), expressions::resolve(value, ctx)?);
    }
    Ok(Value::Object(resolved))
}

fn index_definitions(definitions: &[TaskDefinition]) -> IndexMap<String, TaskDefinition> {
    definitions
        .iter()
        .map(|definition| (definition.name.clone(), definition.clone()))
        .collect()
}

fn empty_failed_result(
    execution_id: String,
    workflow: &WorkflowDefinition,
    error: String,
    started_at: chrono::DateTime<chrono::Utc>,
    completed_at: chrono::DateTime<chrono::Utc>,
    tracker: CostTracker,
    graph_build_duration_micros: u64,
) -> ExecutionResult {
    let (orchestration_cost, execution_time_ms) = tracker.finish();
    ExecutionResult {
        execution_id,
        workflow_name: workflow.name.clone(),
        status: WorkflowStatus::Failed,
        output: IndexMap::new(),
        task_results: Vec::new(),
        parallel_groups: Vec::new(),
        failed_task: None,
        error: Some(error),
        execution_time_ms,
        graph_build_duration_micros,
        orchestration_cost,
        graph_diagnostics: Vec::new(),
        started_at,
        completed_at,
    }
}
