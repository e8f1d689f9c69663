#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::indexing_slicing)]

use serde_json::{Value, json};
use starling::clock::ManualClock;
use starling::ids::PrefixedGenerator;
use starling::providers::executors::{MockExecutor, MockResponse};
use starling::providers::sinks::InMemorySink;
use starling::workflow::{TaskDefinition, WorkflowDefinition};
use starling::{EngineBuilder, TaskStatus, WorkflowStatus};
use std::sync::Arc;

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn workflow(yaml: &str) -> WorkflowDefinition {
    serde_yaml::from_str(yaml).expect("workflow yaml should parse")
}

fn definitions(names: &[&str]) -> Vec<TaskDefinition> {
    names
        .iter()
        .map(|name| {
            serde_yaml::from_str(&format!(
                r"
                name: {name}
                kind: http
                spec:
                  url: https://example.test/{name}
                  method: post
                "
            ))
            .expect("definition yaml should parse")
        })
        .collect()
}

/// A → B where B maps A's output id into its input.
#[tokio::test]
async fn sequential_workflow_passes_outputs_downstream() {
    init_tracing();
    let wf = workflow(
        r#"
        name: simple-sequential
        namespace: test
        tasks:
          - id: a
            taskRef: fetch
          - id: b
            taskRef: store
            input:
              userId: "{{tasks.a.output.id}}"
            dependsOn: [a]
        outputMapping:
          stored: "{{tasks.b.output.ok}}"
        "#,
    );
    let mock = Arc::new(MockExecutor::new());
    mock.enqueue("fetch", MockResponse::completed(json!({"id": "123"})));
    mock.enqueue("store", MockResponse::completed(json!({"ok": true})));
    let engine = EngineBuilder::new().with_executor(Arc::clone(&mock) as Arc<dyn starling::executor::TaskExecutor>).build();

    let result = engine
        .execute(&wf, &definitions(&["fetch", "store"]), json!({}))
        .await;

    assert_eq!(result.status, WorkflowStatus::Succeeded);
    assert_eq!(
        result.parallel_groups,
        vec![vec!["a".to_string()], vec!["b".to_string()]]
    );
    let b = result.task("b").unwrap();
    assert_eq!(b.status, TaskStatus::Completed);
    assert_eq!(b.resolved_input, Some(json!({"userId": "123"})));
    assert_eq!(result.output.get("stored"), Some(&json!(true)));
}

/// A and B independent, C depends on both.
#[tokio::test]
async fn independent_tasks_share_a_wave() {
    let wf = workflow(
        r"
        name: parallel-independent
        namespace: test
        tasks:
          - id: a
            taskRef: fetch
          - id: b
            taskRef: fetch
          - id: c
            taskRef: fetch
            dependsOn: [a, b]
        ",
    );
    let engine = EngineBuilder::new()
        .with_executor(Arc::new(MockExecutor::new()))
        .build();

    let result = engine.execute(&wf, &definitions(&["fetch"]), json!({})).await;

    assert_eq!(result.status, WorkflowStatus::Succeeded);
    assert_eq!(
        result.parallel_groups,
        vec![
            vec!["a".to_string(), "b".to_string()],
            vec!["c".to_string()]
        ]
    );
}

/// No dependsOn anywhere: B's template reference alone orders it after A.
#[tokio::test]
async fn implicit_dependency_orders_waves() {
    let wf = workflow(
        r#"
        name: implicit-dependency
        namespace: test
        tasks:
          - id: a
            taskRef: fetch
          - id: b
            taskRef: store
            input:
              value: "{{tasks.a.output.x}}"
        "#,
    );
    let engine = EngineBuilder::new()
        .with_executor(Arc::new(MockExecutor::new()))
        .build();

    let result = engine
        .execute(&wf, &definitions(&["fetch", "store"]), json!({}))
        .await;

    assert_eq!(
        result.parallel_groups,
        vec![vec!["a".to_string()], vec!["b".to_string()]]
    );
    let diag = result
        .graph_diagnostics
        .iter()
        .find(|d| d.task_id == "b")
        .unwrap();
    assert!(diag.explicit_dependencies.is_empty());
    assert_eq!(diag.implicit_dependencies, vec!["a".to_string()]);
}

/// The planned waves are a function of the workflow alone.
#[tokio::test]
async fn plan_is_deterministic_across_runs_and_inputs() {
    let wf = workflow(
        r#"
        name: deterministic
        namespace: test
        tasks:
          - id: zeta
            taskRef: fetch
          - id: alpha
            taskRef: fetch
          - id: omega
            taskRef: fetch
            input:
              left: "{{tasks.alpha.output.v}}"
              right: "{{tasks.zeta.output.v}}"
        "#,
    );
    let defs = definitions(&["fetch"]);
    let engine = EngineBuilder::new()
        .with_executor(Arc::new(MockExecutor::new()))
        .build();

    let planned = engine.plan(&wf, &defs).unwrap().waves().to_vec();
    assert_eq!(
        planned,
        vec![
            vec!["alpha".to_string(), "zeta".to_string()],
            vec!["omega".to_string()]
        ]
    );

    for input in [json!({}), json!({"seed": 1}), json!({"seed": 2})] {
        let result = engine.execute(&wf, &defs, input).await;
        assert_eq!(result.parallel_groups, planned);
    }
}

/// Literal inputs without templates reach the executor untouched.
#[tokio::test]
async fn literal_inputs_round_trip() {
    let wf = workflow(
        r"
        name: literals
        namespace: test
        tasks:
          - id: a
            taskRef: fetch
            input:
              count: 3
              nested:
                flag: true
                items: [1, 2, 3]
        ",
    );
    let mock = Arc::new(MockExecutor::new());
    let engine = EngineBuilder::new().with_executor(Arc::clone(&mock) as Arc<dyn starling::executor::TaskExecutor>).build();

    engine.execute(&wf, &definitions(&["fetch"]), json!({})).await;

    let calls = mock.calls_for("fetch");
    assert_eq!(calls.len(), 1);
    assert_eq!(
        calls[0].input,
        json!({"count": 3, "nested": {"flag": true, "items": [1, 2, 3]}})
    );
}

/// S6: nested forEach with a `$parent` reference, sequential for a
/// deterministic call order.
#[tokio::test]
async fn nested_foreach_resolves_parent_frames() {
    init_tracing();
    let wf = workflow(
        r#"
        name: nested-foreach
        namespace: test
        tasks:
          - id: departments
            taskRef: fanout
            forEach:
              in: "{{input.departments}}"
              sequential: true
              body:
                - id: numbers
                  taskRef: fanout
                  forEach:
                    in: "{{input.nums}}"
                    sequential: true
                    body:
                      - id: emit
                        taskRef: emit-task
                        input:
                          dept: "{{forEach.$parent.item.dept}}"
                          n: "{{forEach.item}}"
        "#,
    );
    let mock = Arc::new(MockExecutor::new());
    let engine = EngineBuilder::new().with_executor(Arc::clone(&mock) as Arc<dyn starling::executor::TaskExecutor>).build();

    let input = json!({
        "departments": [{"dept": "Eng"}, {"dept": "Ops"}],
        "nums": [1, 2],
    });
    let result = engine.execute(&wf, &definitions(&["emit-task"]), input).await;

    assert_eq!(result.status, WorkflowStatus::Succeeded);
    let calls = mock.calls_for("emit-task");
    assert_eq!(calls.len(), 4);
    let depts: Vec<Value> = calls.iter().map(|c| c.input["dept"].clone()).collect();
    assert_eq!(depts, vec![json!("Eng"), json!("Eng"), json!("Ops"), json!("Ops")]);
    let nums: Vec<Value> = calls.iter().map(|c| c.input["n"].clone()).collect();
    assert_eq!(nums, vec![json!(1), json!(2), json!(1), json!(2)]);

    // Aggregate: one entry per outer item, each the inner aggregate.
    let outer = result.task("departments").unwrap();
    assert_eq!(outer.status, TaskStatus::Completed);
    assert_eq!(outer.output, Some(json!([[{}, {}], [{}, {}]])));
}

/// I7: the aggregate has one entry per element, in input order.
#[tokio::test]
async fn foreach_aggregates_in_input_order() {
    let wf = workflow(
        r#"
        name: foreach-aggregation
        namespace: test
        tasks:
          - id: scan
            taskRef: probe
            forEach:
              in: "{{input.targets}}"
              body:
                - id: probe-one
                  taskRef: probe
                  input:
                    target: "{{forEach.item}}"
                    position: "{{forEach.index}}"
        outputMapping:
          all: "{{tasks.scan.output}}"
        "#,
    );
    let mock = Arc::new(MockExecutor::new());
    for n in 0..3 {
        mock.enqueue("probe", MockResponse::completed(json!({"n": n})));
    }
    let engine = EngineBuilder::new().with_executor(Arc::clone(&mock) as Arc<dyn starling::executor::TaskExecutor>).build();

    let result = engine
        .execute(
            &wf,
            &definitions(&["probe"]),
            json!({"targets": ["x", "y", "z"]}),
        )
        .await;

    assert_eq!(result.status, WorkflowStatus::Succeeded);
    let aggregate = result.task("scan").unwrap().output.clone().unwrap();
    let entries = aggregate.as_array().unwrap();
    assert_eq!(entries.len(), 3);
    // Concurrent iterations may consume the queue in any order, but the
    // aggregate stays in input order: entry i came from iteration i.
    let positions: Vec<Value> = mock
        .calls_for("probe")
        .iter()
        .map(|c| c.input["position"].clone())
        .collect();
    assert_eq!(positions.len(), 3);
    for n in 0..3 {
        assert!(positions.contains(&json!(n)));
    }
}

/// Condition-skipped tasks leave a sentinel their dependents can navigate.
#[tokio::test]
async fn condition_skip_writes_sentinel_for_dependents() {
    let wf = workflow(
        r#"
        name: condition-skip
        namespace: test
        tasks:
          - id: gate
            taskRef: fetch
            condition: "{{input.enabled}}"
          - id: reader
            taskRef: store
            input:
              upstream: "{{tasks.gate.output.anything}}"
            dependsOn: [gate]
        "#,
    );
    let mock = Arc::new(MockExecutor::new());
    let engine = EngineBuilder::new().with_executor(Arc::clone(&mock) as Arc<dyn starling::executor::TaskExecutor>).build();

    let result = engine
        .execute(&wf, &definitions(&["fetch", "store"]), json!({"enabled": false}))
        .await;

    assert_eq!(result.status, WorkflowStatus::Succeeded);
    let gate = result.task("gate").unwrap();
    assert_eq!(gate.status, TaskStatus::Skipped);
    let reader = result.task("reader").unwrap();
    assert_eq!(reader.status, TaskStatus::Completed);
    assert_eq!(reader.resolved_input, Some(json!({"upstream": null})));
    // Only the reader reached the executor.
    assert_eq!(mock.calls().len(), 1);
}

#[tokio::test]
async fn truthy_condition_runs_the_task() {
    let wf = workflow(
        r#"
        name: condition-pass
        namespace: test
        tasks:
          - id: gate
            taskRef: fetch
            condition: "{{input.enabled}}"
        "#,
    );
    let mock = Arc::new(MockExecutor::new());
    let engine = EngineBuilder::new().with_executor(Arc::clone(&mock) as Arc<dyn starling::executor::TaskExecutor>).build();

    let result = engine
        .execute(&wf, &definitions(&["fetch"]), json!({"enabled": true}))
        .await;

    assert_eq!(result.task("gate").unwrap().status, TaskStatus::Completed);
    assert_eq!(mock.calls().len(), 1);
}

/// Results arrive in wave-plan order regardless of completion order.
#[tokio::test]
async fn task_results_follow_wave_plan_order() {
    let wf = workflow(
        r"
        name: report-order
        namespace: test
        tasks:
          - id: slow
            taskRef: slow-fetch
          - id: quick
            taskRef: quick-fetch
          - id: last
            taskRef: quick-fetch
            dependsOn: [slow, quick]
        ",
    );
    let mock = Arc::new(MockExecutor::new());
    mock.enqueue(
        "slow-fetch",
        MockResponse::completed(json!({})).with_delay(std::time::Duration::from_millis(30)),
    );
    let engine = EngineBuilder::new().with_executor(Arc::clone(&mock) as Arc<dyn starling::executor::TaskExecutor>).build();

    let result = engine
        .execute(&wf, &definitions(&["slow-fetch", "quick-fetch"]), json!({}))
        .await;

    let ids: Vec<&str> = result
        .task_results
        .iter()
        .map(|t| t.task_id.as_str())
        .collect();
    assert_eq!(ids, vec!["quick", "slow", "last"]);
}

#[tokio::test]
async fn sink_receives_the_sealed_result() {
    let wf = workflow(
        r"
        name: sink-notify
        namespace: test
        tasks:
          - id: a
            taskRef: fetch
        ",
    );
    let sink = Arc::new(InMemorySink::new());
    let engine = EngineBuilder::new()
        .with_executor(Arc::new(MockExecutor::new()))
        .with_sink(Arc::clone(&sink) as Arc<dyn starling::sink::ExecutionSink>)
        .with_id_generator(Arc::new(PrefixedGenerator::new("mock")))
        .build();

    let result = engine.execute(&wf, &definitions(&["fetch"]), json!({})).await;

    assert_eq!(result.execution_id, "mock-1");
    let stored = sink.results().await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].execution_id, "mock-1");
    assert_eq!(stored[0].status, WorkflowStatus::Succeeded);
}

/// Orchestration cost accounting is present, non-negative, and counts waves.
#[tokio::test]
async fn cost_accounting_tracks_waves() {
    let wf = workflow(
        r"
        name: cost
        namespace: test
        tasks:
          - id: a
            taskRef: fetch
          - id: b
            taskRef: fetch
            dependsOn: [a]
        ",
    );
    let engine = EngineBuilder::new()
        .with_executor(Arc::new(MockExecutor::new()))
        .build();

    let result = engine.execute(&wf, &definitions(&["fetch"]), json!({})).await;

    let cost = &result.orchestration_cost;
    assert_eq!(cost.execution_iterations, 2);
    assert_eq!(cost.waves.len(), 2);
    assert_eq!(cost.waves[0].task_ids, vec!["a".to_string()]);
    assert_eq!(cost.waves[1].task_ids, vec!["b".to_string()]);
    assert!(cost.orchestration_cost_percentage >= 0.0);
    assert_eq!(
        cost.total_orchestration_cost_micros,
        cost.setup_duration_micros + cost.teardown_duration_micros
            + cost.scheduling_overhead_micros
    );
}

/// Under a manual clock nothing advances, so every measure is exactly zero.
#[tokio::test]
async fn manual_clock_pins_measures_to_zero() {
    let wf = workflow(
        r"
        name: frozen
        namespace: test
        tasks:
          - id: a
            taskRef: fetch
        ",
    );
    let engine = EngineBuilder::new()
        .with_executor(Arc::new(MockExecutor::new()))
        .with_clock(Arc::new(ManualClock::new()))
        .build();

    let result = engine.execute(&wf, &definitions(&["fetch"]), json!({})).await;

    assert_eq!(result.execution_time_ms, 0);
    assert_eq!(result.orchestration_cost.total_orchestration_cost_micros, 0);
    assert_eq!(result.task("a").unwrap().duration, 0);
}

#[tokio::test]
async fn empty_workflow_succeeds_with_no_waves() {
    let wf = workflow(
        r"
        name: empty
        namespace: test
        ",
    );
    let engine = EngineBuilder::new()
        .with_executor(Arc::new(MockExecutor::new()))
        .build();

    let result = engine.execute(&wf, &[], json!({})).await;

    assert_eq!(result.status, WorkflowStatus::Succeeded);
    assert!(result.task_results.is_empty());
    assert!(result.parallel_groups.is_empty());
    assert_eq!(result.orchestration_cost.execution_iterations, 0);
}

#[tokio::test]
async fn output_mapping_interpolates_strings() {
    let wf = workflow(
        r#"
        name: interpolated-output
        namespace: test
        tasks:
          - id: a
            taskRef: fetch
        outputMapping:
          summary: "user {{tasks.a.output.name}} has {{tasks.a.output.count}} items"
          raw: "{{tasks.a.output}}"
        "#,
    );
    let mock = Arc::new(MockExecutor::new());
    mock.enqueue("fetch", MockResponse::completed(json!({"name": "ada", "count": 2})));
    let engine = EngineBuilder::new().with_executor(Arc::clone(&mock) as Arc<dyn starling::executor::TaskExecutor>).build();

    let result = engine.execute(&wf, &definitions(&["fetch"]), json!({})).await;

    assert_eq!(
        result.output.get("summary"),
        Some(&json!("user ada has 2 items"))
    );
    assert_eq!(
        result.output.get("raw"),
        Some(&json!({"name": "ada", "count": 2}))
    );
}
