//! # Starling - Wave-Scheduled Workflow Orchestration Engine
//!
//! Starling executes declarative workflows as directed acyclic graphs:
//! dependencies are merged from explicit `dependsOn` edges and implicit
//! `{{tasks.…}}` template references, then scheduled in topological *waves*
//! of concurrently-runnable tasks.
//!
//! ## Features
//!
//! - **Graph-Based Scheduling**: explicit and template-inferred dependencies
//!   combined into deterministic parallel waves
//! - **Template Resolution**: `{{…}}` expressions over workflow input, task
//!   outputs, and forEach frames, with type-preserving full-expression mode
//! - **Bounded Concurrency**: one semaphore caps in-flight tasks across a run
//! - **Control Flow**: `condition` short-circuits and `forEach` fan-out with
//!   nested frames (`$parent`/`$root`)
//! - **Failure Policies**: fail-fast at wave boundaries, or continue
//!   independent branches
//! - **Cost Accounting**: microsecond-level setup, scheduling, and teardown
//!   overhead per run
//!
//! ## Core Modules
//!
//! - [`engine`] - the scheduler: waves, dispatch, failure policy
//! - [`engine::graph`] - dependency merge, cycle detection, wave planning
//! - [`expressions`] - template parsing, resolution, dependency extraction
//! - [`context`] - per-run execution context and forEach frames
//! - [`executor`] - the task executor port
//! - [`providers`] - stock executors (http, transform, dispatch, mock) and
//!   sinks
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use starling::EngineBuilder;
//! use starling::providers::executors::{MockExecutor, MockResponse};
//! use starling::workflow::{TaskDefinition, WorkflowDefinition};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let workflow: WorkflowDefinition = serde_yaml::from_str(
//!     r#"
//! name: greet
//! namespace: examples
//! tasks:
//!   - id: hello
//!     taskRef: say-hello
//!     input:
//!       name: "{{input.name}}"
//! outputMapping:
//!   greeting: "{{tasks.hello.output.message}}"
//! "#,
//! )?;
//!
//! let tasks: Vec<TaskDefinition> = serde_yaml::from_str(
//!     r#"
//! - name: say-hello
//!   kind: http
//!   spec:
//!     url: https://greeter.example/hello
//!     method: post
//! "#,
//! )?;
//!
//! let executor = Arc::new(MockExecutor::new());
//! executor.enqueue("say-hello", MockResponse::completed(json!({"message": "hi"})));
//!
//! let engine = EngineBuilder::new().with_executor(executor).build();
//! let result = engine.execute(&workflow, &tasks, json!({"name": "ada"})).await;
//! println!("{}: {:?}", result.execution_id, result.output);
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! Engines are configured via [`config::EngineConfig`], loadable from
//! `starling.yaml` and `STARLING__*` environment variables.

pub mod builder;
pub mod cancel;
pub mod clock;
pub mod config;
pub mod context;
pub mod engine;
pub mod execution;
pub mod executor;
pub mod expressions;
pub mod ids;
pub mod providers;
pub mod sink;
pub mod workflow;

pub use builder::EngineBuilder;
pub use cancel::CancelToken;
pub use config::EngineConfig;
pub use engine::Engine;
pub use execution::{ExecutionResult, TaskStatus, WorkflowStatus};
