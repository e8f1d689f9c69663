//! Execution context: the state templates resolve against.
//!
//! The coordinator owns one context per run and writes task records only
//! between waves, so snapshots handed to concurrently running tasks are
//! consistent without locking. ForEach iterations get a cloned child scope
//! with their frame pushed; writes inside the child never leak back.

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use snafu::prelude::*;

use crate::execution::TaskStatus;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Task '{id}' already has a recorded result"))]
    DuplicateRecord { id: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Terminal record for one task, immutable once written.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub output: Value,
    pub status: TaskStatus,
    /// Microseconds.
    pub duration: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskRecord {
    #[must_use]
    pub fn completed(output: Value, duration: u64) -> Self {
        Self {
            output,
            status: TaskStatus::Completed,
            duration,
            error: None,
        }
    }

    /// Sentinel for skipped tasks: an empty mapping, so dependents can still
    /// navigate into it and resolve every field to undefined.
    #[must_use]
    pub fn skipped() -> Self {
        Self {
            output: Value::Object(serde_json::Map::new()),
            status: TaskStatus::Skipped,
            duration: 0,
            error: None,
        }
    }

    #[must_use]
    pub fn failed(error: String, duration: u64) -> Self {
        Self {
            output: Value::Null,
            status: TaskStatus::Failed,
            duration,
            error: Some(error),
        }
    }
}

/// One forEach iteration frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub item: Value,
    pub index: usize,
}

/// Input, per-task records, and the forEach frame stack for one run scope.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    input: Value,
    tasks: IndexMap<String, TaskRecord>,
    frames: Vec<Frame>,
}

impl ExecutionContext {
    #[must_use]
    pub fn new(input: Value) -> Self {
        Self {
            input,
            tasks: IndexMap::new(),
            frames: Vec::new(),
        }
    }

    #[must_use]
    pub fn input(&self) -> &Value {
        &self.input
    }

    #[must_use]
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// ForEach nesting depth of this scope.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Record a task's terminal state. Records are write-once.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateRecord`] if the id already has a record.
    pub fn insert_record(&mut self, id: &str, record: TaskRecord) -> Result<()> {
        ensure!(
            !self.tasks.contains_key(id),
            DuplicateRecordSnafu { id: id.to_string() }
        );
        self.tasks.insert(id.to_string(), record);
        Ok(())
    }

    #[must_use]
    pub fn record(&self, id: &str) -> Option<&TaskRecord> {
        self.tasks.get(id)
    }

    /// JSON view of a task record, as navigated by `tasks.<id>.…` templates.
    #[must_use]
    pub fn task_value(&self, id: &str) -> Option<Value> {
        self.tasks
            .get(id)
            .and_then(|record| serde_json::to_value(record).ok())
    }

    /// Ids of every task with a recorded terminal state in this scope.
    #[must_use]
    pub fn recorded_ids(&self) -> std::collections::BTreeSet<String> {
        self.tasks.keys().cloned().collect()
    }

    /// Child scope for one forEach iteration: same input, a snapshot of the
    /// records written so far, and the iteration frame on top of the stack.
    #[must_use]
    pub fn child_for_iteration(&self, item: Value, index: usize) -> Self {
        let mut child = self.clone();
        child.frames.push(Frame { item, index });
        child
    }
}

#[cfg(test)]
#[allow(clippy::indexing_slicing)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn records_are_write_once() {
        let mut ctx = ExecutionContext::new(json!({}));
        ctx.insert_record("a", TaskRecord::completed(json!({"x": 1}), 10))
            .unwrap();
        let err = ctx
            .insert_record("a", TaskRecord::completed(json!({"x": 2}), 10))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateRecord { .. }));
        assert_eq!(ctx.record("a").unwrap().output, json!({"x": 1}));
    }

    #[test]
    fn task_value_exposes_output_and_status() {
        let mut ctx = ExecutionContext::new(json!({}));
        ctx.insert_record("a", TaskRecord::completed(json!({"id": "42"}), 7))
            .unwrap();
        let view = ctx.task_value("a").unwrap();
        assert_eq!(view["output"]["id"], json!("42"));
        assert_eq!(view["status"], json!("completed"));
    }

    #[test]
    fn child_scope_does_not_leak_back() {
        let mut ctx = ExecutionContext::new(json!({}));
        ctx.insert_record("outer", TaskRecord::completed(json!({}), 1))
            .unwrap();
        let mut child = ctx.child_for_iteration(json!("item-0"), 0);
        child
            .insert_record("inner", TaskRecord::completed(json!({}), 1))
            .unwrap();
        assert_eq!(child.depth(), 1);
        assert!(child.record("outer").is_some());
        assert!(ctx.record("inner").is_none());
        assert_eq!(ctx.depth(), 0);
    }

    #[test]
    fn skipped_sentinel_is_empty_object() {
        let record = TaskRecord::skipped();
        assert_eq!(record.output, json!({}));
        assert_eq!(record.status, TaskStatus::Skipped);
    }
}
