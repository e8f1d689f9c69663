//! forEach expansion: fan a body sub-plan out over a resolved sequence.
//!
//! Each element gets a fresh frame pushed onto an iteration-scoped context
//! clone; iterations run concurrently under the run's semaphore unless the
//! spec says `sequential`. The step's aggregated output is the ordered
//! sequence of per-iteration outputs, where an iteration's output is its
//! last body step's output.

use async_recursion::async_recursion;
use futures::future::join_all;
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::context::ExecutionContext;
use crate::execution::{SkipReason, TaskStatus};
use crate::executor::{FailureKind, TaskFailure};
use crate::expressions;
use crate::workflow::{TaskDefinition, TaskStep};

use super::{Engine, StepReport, graph};

pub(super) async fn run_for_each(
    engine: Engine,
    step: TaskStep,
    ctx: ExecutionContext,
    definitions: Arc<IndexMap<String, TaskDefinition>>,
    semaphore: Arc<Semaphore>,
    cancel: CancelToken,
) -> StepReport {
    let started = engine.clock_micros();
    let Some(spec) = step.for_each.clone() else {
        // run_step only routes here when forEach is present.
        return StepReport::failed(
            &step,
            TaskFailure::new(FailureKind::Execution, "step has no forEach spec"),
            None,
            0,
            engine.clock_micros(),
        );
    };

    let items_value = match expressions::resolve_string(&spec.in_, &ctx) {
        Ok(value) => value,
        Err(error) => {
            return StepReport::failed(
                &step,
                TaskFailure::new(FailureKind::Template, error.to_string()),
                None,
                0,
                engine.clock_micros(),
            );
        }
    };
    let Some(items) = items_value.as_array().cloned() else {
        return StepReport::failed(
            &step,
            TaskFailure::new(
                FailureKind::Execution,
                format!(
                    "forEach 'in' expression for task '{}' must yield a sequence, got: {items_value}",
                    step.id
                ),
            ),
            None,
            0,
            engine.clock_micros(),
        );
    };
    debug!(
        task = %step.id,
        iterations = items.len(),
        sequential = spec.sequential,
        "expanding forEach"
    );

    let mut outputs: Vec<Value> = Vec::with_capacity(items.len());
    let mut failure: Option<TaskFailure> = None;

    if spec.sequential {
        for (index, item) in items.into_iter().enumerate() {
            if cancel.is_cancelled() {
                failure = Some(TaskFailure::new(
                    FailureKind::Cancelled,
                    "execution cancelled",
                ));
                break;
            }
            let iteration_ctx = ctx.child_for_iteration(item, index);
            match run_subplan(
                engine.clone(),
                spec.body.clone(),
                iteration_ctx,
                Arc::clone(&definitions),
                Arc::clone(&semaphore),
                cancel.clone(),
            )
            .await
            {
                Ok(output) => outputs.push(output),
                Err(iteration_failure) => {
                    failure = Some(iteration_failure);
                    break;
                }
            }
        }
    } else {
        let iterations: Vec<_> = items
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                run_subplan(
                    engine.clone(),
                    spec.body.clone(),
                    ctx.child_for_iteration(item, index),
                    Arc::clone(&definitions),
                    Arc::clone(&semaphore),
                    cancel.clone(),
                )
            })
            .collect();
        // join_all preserves input order, so the aggregate stays ordered and
        // failure attribution is by lowest iteration index.
        for outcome in join_all(iterations).await {
            match outcome {
                Ok(output) => outputs.push(output),
                Err(iteration_failure) => {
                    if failure.is_none() {
                        failure = Some(iteration_failure);
                    }
                }
            }
        }
    }

    let finished = engine.clock_micros();
    let duration = finished.saturating_sub(started);
    match failure {
        Some(failure) => {
            StepReport::failed(&step, failure, Some(items_value), duration, finished)
        }
        None => StepReport::completed(
            &step,
            Value::Array(outputs),
            items_value,
            duration,
            finished,
        ),
    }
}

/// Run one iteration's body sub-plan to completion inside its scope.
/// Returns the last body step's output. The body honors the engine's
/// failure policy the same way the top-level scheduler does: fail-fast
/// stops after the first failing wave, while continue-on-failure keeps
/// driving independent branches and skips only transitive dependents. A
/// failed step still fails the iteration once it has run out.
#[async_recursion]
async fn run_subplan(
    engine: Engine,
    steps: Vec<TaskStep>,
    mut ctx: ExecutionContext,
    definitions: Arc<IndexMap<String, TaskDefinition>>,
    semaphore: Arc<Semaphore>,
    cancel: CancelToken,
) -> std::result::Result<Value, TaskFailure> {
    let external = ctx.recorded_ids();
    let plan = graph::plan_scope(&steps, &external, engine.config().deterministic_tiebreak)
        .map_err(|error| TaskFailure::new(FailureKind::Execution, error.to_string()))?;

    let fail_fast = engine.config().fail_fast;
    let last_id = steps.last().map(|step| step.id.clone());
    let mut last_output = Value::Null;
    let mut reports: HashMap<String, StepReport> = HashMap::new();
    let mut first_failure: Option<(u64, String, TaskFailure)> = None;

    for wave in &plan.waves {
        if cancel.is_cancelled() {
            return Err(TaskFailure::new(
                FailureKind::Cancelled,
                "execution cancelled",
            ));
        }
        if first_failure.is_some() && fail_fast {
            break;
        }

        let mut wave_reports: Vec<StepReport> = Vec::new();
        let mut running = Vec::new();
        for id in wave {
            let Some(step) = steps.iter().find(|step| step.id == *id) else {
                continue;
            };
            if !fail_fast && super::upstream_blocked(plan.deps.get(id), &reports) {
                wave_reports.push(StepReport::skipped(
                    step,
                    SkipReason::UpstreamFailure,
                    engine.clock_micros(),
                ));
                continue;
            }
            running.push(engine.clone().run_step(
                step.clone(),
                ctx.clone(),
                Arc::clone(&definitions),
                Arc::clone(&semaphore),
                cancel.clone(),
            ));
        }
        wave_reports.extend(join_all(running).await);

        for report in wave_reports {
            if report.status == TaskStatus::Failed
                && let Some(step_failure) = report.failure.clone()
            {
                let key = (report.finished_micros, report.id.clone(), step_failure);
                let earlier = first_failure
                    .as_ref()
                    .is_none_or(|held| (key.0, &key.1) < (held.0, &held.1));
                if earlier {
                    first_failure = Some(key);
                }
            }
            if last_id.as_deref() == Some(report.id.as_str()) {
                last_output = report.output.clone();
            }
            let record = report.clone().into_record();
            if ctx.insert_record(&report.id, record).is_err() {
                debug!(task = %report.id, "duplicate body record ignored");
            }
            reports.insert(report.id.clone(), report);
        }
    }

    match first_failure {
        Some((_, _, failure)) => Err(failure),
        None => Ok(last_output),
    }
}
