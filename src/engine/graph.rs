//! Execution graph construction: dependency merge, cycle detection, waves.

use indexmap::IndexMap;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use serde_json::Value;
use snafu::prelude::*;
use std::collections::{BTreeSet, HashMap};

use crate::config::EngineConfig;
use crate::execution::TaskDiagnostics;
use crate::expressions;
use crate::workflow::{TaskDefinition, TaskStep, WorkflowDefinition};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Task '{task_id}' depends on unknown task '{dependency}'"))]
    UnknownDependency { task_id: String, dependency: String },

    #[snafu(display("Task '{task_id}' references unknown task definition '{task_ref}'"))]
    UnknownTaskRef { task_id: String, task_ref: String },

    #[snafu(display("Duplicate task id '{task_id}'"))]
    DuplicateTaskId { task_id: String },

    #[snafu(display("Dependency cycle detected: {}", involved.join(" -> ")))]
    Cycle { involved: Vec<String> },

    #[snafu(display(
        "forEach nesting at task '{task_id}' exceeds the maximum depth of {max_depth}"
    ))]
    NestingTooDeep { task_id: String, max_depth: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

/// The derived graph for a workflow's top-level scope: merged dependencies,
/// the planned waves, and per-task diagnostics.
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    graph: DiGraph<String, ()>,
    nodes: HashMap<String, NodeIndex>,
    deps: HashMap<String, BTreeSet<String>>,
    waves: Vec<Vec<String>>,
    diagnostics: Vec<TaskDiagnostics>,
}

impl ExecutionGraph {
    /// Wave *k* holds every task whose dependencies all lie in waves
    /// `0..k-1`; ties are id-sorted when the deterministic tiebreak is on.
    #[must_use]
    pub fn waves(&self) -> &[Vec<String>] {
        &self.waves
    }

    #[must_use]
    pub fn diagnostics(&self) -> &[TaskDiagnostics] {
        &self.diagnostics
    }

    /// Merged explicit+implicit dependencies of one task.
    #[must_use]
    pub fn dependencies_of(&self, id: &str) -> Option<&BTreeSet<String>> {
        self.deps.get(id)
    }

    #[must_use]
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Every task reachable from `id` along dependency edges, i.e. all
    /// transitive dependents.
    #[must_use]
    pub fn transitive_dependents(&self, id: &str) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let Some(&start) = self.nodes.get(id) else {
            return out;
        };
        let mut dfs = Dfs::new(&self.graph, start);
        while let Some(node) = dfs.next(&self.graph) {
            if node != start
                && let Some(name) = self.graph.node_weight(node)
            {
                out.insert(name.clone());
            }
        }
        out
    }
}

/// Waves and dependencies for one scope (top level or a forEach body).
#[derive(Debug, Clone)]
pub(crate) struct ScopePlan {
    pub waves: Vec<Vec<String>>,
    pub deps: HashMap<String, BTreeSet<String>>,
    pub explicit: HashMap<String, Vec<String>>,
    pub implicit: HashMap<String, Vec<String>>,
}

/// Build the execution graph for a workflow.
///
/// Validates id uniqueness (forEach bodies included), task references,
/// dependency targets, forEach nesting depth, and acyclicity for every
/// scope, so that no error can surface once tasks have started.
///
/// # Errors
/// Returns the first [`Error`] encountered, before any task runs.
pub(crate) fn build(
    workflow: &WorkflowDefinition,
    definitions: &IndexMap<String, TaskDefinition>,
    config: &EngineConfig,
) -> Result<ExecutionGraph> {
    let mut all_ids = BTreeSet::new();
    validate_steps(
        &workflow.tasks,
        definitions,
        1,
        config.foreach_max_depth,
        &mut all_ids,
    )?;
    validate_body_scopes(&workflow.tasks, &all_ids, config)?;

    let plan = plan_scope(
        &workflow.tasks,
        &BTreeSet::new(),
        config.deterministic_tiebreak,
    )?;

    let mut graph = DiGraph::new();
    let mut nodes = HashMap::new();
    for step in &workflow.tasks {
        let node = graph.add_node(step.id.clone());
        nodes.insert(step.id.clone(), node);
    }
    for (id, deps) in &plan.deps {
        let Some(&target) = nodes.get(id) else { continue };
        for dep in deps {
            if let Some(&source) = nodes.get(dep) {
                graph.add_edge(source, target, ());
            }
        }
    }

    let diagnostics = workflow
        .tasks
        .iter()
        .map(|step| TaskDiagnostics {
            task_id: step.id.clone(),
            explicit_dependencies: plan.explicit.get(&step.id).cloned().unwrap_or_default(),
            implicit_dependencies: plan.implicit.get(&step.id).cloned().unwrap_or_default(),
        })
        .collect();

    Ok(ExecutionGraph {
        graph,
        nodes,
        deps: plan.deps.clone(),
        waves: plan.waves.clone(),
        diagnostics,
    })
}

/// Plan one scope: merge explicit and implicit dependencies, reject unknown
/// targets, detect cycles, and compute waves. Dependencies satisfied by
/// `external_ids` (an enclosing scope) are dropped from the local ordering.
pub(crate) fn plan_scope(
    steps: &[TaskStep],
    external_ids: &BTreeSet<String>,
    deterministic: bool,
) -> Result<ScopePlan> {
    let scope_ids: BTreeSet<String> = steps.iter().map(|s| s.id.clone()).collect();
    let order: Vec<String> = steps.iter().map(|s| s.id.clone()).collect();

    let mut deps: HashMap<String, BTreeSet<String>> = HashMap::new();
    let mut explicit_map = HashMap::new();
    let mut implicit_map = HashMap::new();

    for step in steps {
        let mut merged = BTreeSet::new();

        let explicit: BTreeSet<String> = step.depends_on.iter().cloned().collect();
        for dep in &explicit {
            if scope_ids.contains(dep) {
                merged.insert(dep.clone());
            } else if !external_ids.contains(dep) {
                return Err(Error::UnknownDependency {
                    task_id: step.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        let implicit = implicit_references(step);
        for dep in &implicit {
            if scope_ids.contains(dep) {
                merged.insert(dep.clone());
            } else if !external_ids.contains(dep) {
                return Err(Error::UnknownDependency {
                    task_id: step.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        // Self-references would deadlock the wave computation.
        if merged.remove(&step.id) {
            return Err(Error::Cycle {
                involved: vec![step.id.clone(), step.id.clone()],
            });
        }

        explicit_map.insert(step.id.clone(), explicit.into_iter().collect::<Vec<_>>());
        implicit_map.insert(
            step.id.clone(),
            implicit
                .into_iter()
                .filter(|d| scope_ids.contains(d))
                .collect::<Vec<_>>(),
        );
        deps.insert(step.id.clone(), merged);
    }

    if let Some(involved) = find_cycle(&order, &deps) {
        return Err(Error::Cycle { involved });
    }

    let waves = compute_waves(&order, &deps, deterministic)?;
    Ok(ScopePlan {
        waves,
        deps,
        explicit: explicit_map,
        implicit: implicit_map,
    })
}

/// Task ids a step's templates reference: its input, condition, and forEach
/// iterable, plus references escaping from forEach bodies (body-local ids
/// stay inside their scope).
fn implicit_references(step: &TaskStep) -> BTreeSet<String> {
    let mut refs = BTreeSet::new();
    for value in step.input.values() {
        refs.extend(expressions::referenced_tasks(value));
    }
    if let Some(condition) = &step.condition {
        refs.extend(expressions::referenced_tasks(&Value::String(condition.clone())));
    }
    if let Some(for_each) = &step.for_each {
        refs.extend(expressions::referenced_tasks(&Value::String(
            for_each.in_.clone(),
        )));
        let mut body_ids = BTreeSet::new();
        collect_ids(&for_each.body, &mut body_ids);
        for body_step in &for_each.body {
            // Explicit body dependencies on outer tasks escape too, so the
            // forEach step waits for them before expanding.
            let mut escaped = implicit_references(body_step);
            escaped.extend(body_step.depends_on.iter().cloned());
            for reference in escaped {
                if !body_ids.contains(&reference) {
                    refs.insert(reference);
                }
            }
        }
    }
    refs
}

fn collect_ids(steps: &[TaskStep], out: &mut BTreeSet<String>) {
    for step in steps {
        out.insert(step.id.clone());
        if let Some(for_each) = &step.for_each {
            collect_ids(&for_each.body, out);
        }
    }
}

fn validate_steps(
    steps: &[TaskStep],
    definitions: &IndexMap<String, TaskDefinition>,
    depth: usize,
    max_depth: usize,
    seen: &mut BTreeSet<String>,
) -> Result<()> {
    for step in steps {
        ensure!(
            seen.insert(step.id.clone()),
            DuplicateTaskIdSnafu {
                task_id: step.id.clone(),
            }
        );
        if step.for_each.is_none() {
            ensure!(
                definitions.contains_key(&step.task_ref),
                UnknownTaskRefSnafu {
                    task_id: step.id.clone(),
                    task_ref: step.task_ref.clone(),
                }
            );
        }
        if let Some(for_each) = &step.for_each {
            ensure!(
                depth <= max_depth,
                NestingTooDeepSnafu {
                    task_id: step.id.clone(),
                    max_depth,
                }
            );
            validate_steps(&for_each.body, definitions, depth + 1, max_depth, seen)?;
        }
    }
    Ok(())
}

/// Plan every forEach body once at build time so cycles and unknown
/// dependencies inside bodies surface before execution.
fn validate_body_scopes(
    steps: &[TaskStep],
    all_ids: &BTreeSet<String>,
    config: &EngineConfig,
) -> Result<()> {
    for step in steps {
        if let Some(for_each) = &step.for_each {
            let mut body_ids = BTreeSet::new();
            collect_ids(&for_each.body, &mut body_ids);
            let external: BTreeSet<String> =
                all_ids.difference(&body_ids).cloned().collect();
            plan_scope(&for_each.body, &external, config.deterministic_tiebreak)?;
            validate_body_scopes(&for_each.body, all_ids, config)?;
        }
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Classic colored DFS over dependency edges. The reported cycle lists the
/// recursion stack from the first re-visited node to the top, closed by the
/// re-visited node.
fn find_cycle(
    order: &[String],
    deps: &HashMap<String, BTreeSet<String>>,
) -> Option<Vec<String>> {
    let mut colors: HashMap<&str, Color> =
        order.iter().map(|id| (id.as_str(), Color::White)).collect();
    let mut stack: Vec<&str> = Vec::new();
    for id in order {
        if colors.get(id.as_str()) == Some(&Color::White)
            && let Some(cycle) = visit(id, deps, &mut colors, &mut stack)
        {
            return Some(cycle);
        }
    }
    None
}

fn visit<'a>(
    id: &'a str,
    deps: &'a HashMap<String, BTreeSet<String>>,
    colors: &mut HashMap<&'a str, Color>,
    stack: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    colors.insert(id, Color::Gray);
    stack.push(id);
    if let Some(targets) = deps.get(id) {
        for dep in targets {
            match colors.get(dep.as_str()) {
                Some(Color::Gray) => {
                    let from = stack.iter().position(|s| *s == dep.as_str()).unwrap_or(0);
                    let mut involved: Vec<String> = stack
                        .iter()
                        .skip(from)
                        .map(|s| (*s).to_string())
                        .collect();
                    involved.push(dep.clone());
                    return Some(involved);
                }
                Some(Color::White) => {
                    if let Some(cycle) = visit(dep, deps, colors, stack) {
                        return Some(cycle);
                    }
                }
                Some(Color::Black) | None => {}
            }
        }
    }
    stack.pop();
    colors.insert(id, Color::Black);
    None
}

fn compute_waves(
    order: &[String],
    deps: &HashMap<String, BTreeSet<String>>,
    deterministic: bool,
) -> Result<Vec<Vec<String>>> {
    let mut completed: BTreeSet<String> = BTreeSet::new();
    let mut remaining: Vec<String> = order.to_vec();
    let mut waves = Vec::new();
    while !remaining.is_empty() {
        let mut ready: Vec<String> = remaining
            .iter()
            .filter(|id| {
                deps.get(id.as_str())
                    .is_none_or(|d| d.iter().all(|dep| completed.contains(dep)))
            })
            .cloned()
            .collect();
        // The DFS above already rejected cycles; this guards wave progress.
        ensure!(
            !ready.is_empty(),
            CycleSnafu {
                involved: remaining.clone(),
            }
        );
        if deterministic {
            ready.sort();
        }
        completed.extend(ready.iter().cloned());
        remaining.retain(|id| !ready.contains(id));
        waves.push(ready);
    }
    Ok(waves)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition(name: &str) -> TaskDefinition {
        TaskDefinition {
            name: name.to_string(),
            kind: "http".to_string(),
            input_schema: IndexMap::new(),
            output_schema: IndexMap::new(),
            spec: json!({}),
        }
    }

    fn definitions() -> IndexMap<String, TaskDefinition> {
        let mut map = IndexMap::new();
        map.insert("noop".to_string(), definition("noop"));
        map
    }

    fn step(id: &str, depends_on: &[&str]) -> TaskStep {
        TaskStep {
            id: id.to_string(),
            task_ref: "noop".to_string(),
            input: IndexMap::new(),
            depends_on: depends_on.iter().map(|s| (*s).to_string()).collect(),
            condition: None,
            for_each: None,
            timeout: None,
            retry: None,
        }
    }

    fn workflow(tasks: Vec<TaskStep>) -> WorkflowDefinition {
        WorkflowDefinition {
            name: "test".to_string(),
            namespace: "test".to_string(),
            input_schema: IndexMap::new(),
            tasks,
            output_mapping: IndexMap::new(),
        }
    }

    #[test]
    fn diamond_produces_three_waves() {
        let wf = workflow(vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["a"]),
            step("d", &["b", "c"]),
        ]);
        let graph = build(&wf, &definitions(), &EngineConfig::default()).unwrap();
        assert_eq!(
            graph.waves(),
            &[
                vec!["a".to_string()],
                vec!["b".to_string(), "c".to_string()],
                vec!["d".to_string()],
            ]
        );
    }

    #[test]
    fn waves_are_id_sorted() {
        let wf = workflow(vec![step("zeta", &[]), step("alpha", &[])]);
        let graph = build(&wf, &definitions(), &EngineConfig::default()).unwrap();
        assert_eq!(
            graph.waves(),
            &[vec!["alpha".to_string(), "zeta".to_string()]]
        );
    }

    #[test]
    fn template_reference_becomes_implicit_dependency() {
        let mut fetch = step("fetch", &[]);
        fetch
            .input
            .insert("userId".to_string(), json!("{{tasks.login.output.id}}"));
        let wf = workflow(vec![step("login", &[]), fetch]);
        let graph = build(&wf, &definitions(), &EngineConfig::default()).unwrap();
        assert_eq!(
            graph.waves(),
            &[vec!["login".to_string()], vec!["fetch".to_string()]]
        );
        let diag = graph
            .diagnostics()
            .iter()
            .find(|d| d.task_id == "fetch")
            .unwrap();
        assert!(diag.explicit_dependencies.is_empty());
        assert_eq!(diag.implicit_dependencies, vec!["login".to_string()]);
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let wf = workflow(vec![step("a", &["ghost"])]);
        let err = build(&wf, &definitions(), &EngineConfig::default()).unwrap_err();
        assert!(matches!(err, Error::UnknownDependency { .. }));
    }

    #[test]
    fn unknown_task_ref_is_rejected() {
        let mut lone = step("a", &[]);
        lone.task_ref = "missing".to_string();
        let wf = workflow(vec![lone]);
        let err = build(&wf, &definitions(), &EngineConfig::default()).unwrap_err();
        assert!(matches!(err, Error::UnknownTaskRef { .. }));
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let wf = workflow(vec![step("a", &[]), step("a", &[])]);
        let err = build(&wf, &definitions(), &EngineConfig::default()).unwrap_err();
        assert!(matches!(err, Error::DuplicateTaskId { .. }));
    }

    #[test]
    fn cycle_is_reported_with_involved_ids() {
        let wf = workflow(vec![step("a", &["c"]), step("b", &["a"]), step("c", &["b"])]);
        let err = build(&wf, &definitions(), &EngineConfig::default()).unwrap_err();
        let Error::Cycle { involved } = err else {
            panic!("expected cycle, got {err:?}");
        };
        assert!(involved.len() >= 3);
        assert_eq!(involved.first(), involved.last());
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let wf = workflow(vec![step("a", &["a"])]);
        let err = build(&wf, &definitions(), &EngineConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Cycle { .. }));
    }

    #[test]
    fn transitive_dependents_follow_edges() {
        let wf = workflow(vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["b"]),
            step("d", &[]),
        ]);
        let graph = build(&wf, &definitions(), &EngineConfig::default()).unwrap();
        let dependents = graph.transitive_dependents("a");
        assert_eq!(
            dependents.into_iter().collect::<Vec<_>>(),
            vec!["b".to_string(), "c".to_string()]
        );
        assert!(graph.transitive_dependents("d").is_empty());
    }

    fn nested_foreach(levels: usize) -> TaskStep {
        let mut inner = step("leaf", &[]);
        for level in (0..levels).rev() {
            let mut wrapper = step(&format!("loop-{level}"), &[]);
            wrapper.for_each = Some(crate::workflow::ForEachSpec {
                in_: "{{input.items}}".to_string(),
                sequential: false,
                body: vec![inner],
            });
            inner = wrapper;
        }
        inner
    }

    #[test]
    fn three_deep_nesting_is_accepted() {
        let wf = workflow(vec![nested_foreach(3)]);
        assert!(build(&wf, &definitions(), &EngineConfig::default()).is_ok());
    }

    #[test]
    fn four_deep_nesting_is_rejected() {
        let wf = workflow(vec![nested_foreach(4)]);
        let err = build(&wf, &definitions(), &EngineConfig::default()).unwrap_err();
        assert!(matches!(err, Error::NestingTooDeep { max_depth: 3, .. }));
    }

    #[test]
    fn body_reference_to_outer_task_bubbles_up() {
        let mut body_step = step("body", &[]);
        body_step
            .input
            .insert("dept".to_string(), json!("{{tasks.seed.output.dept}}"));
        let mut fanout = step("fanout", &[]);
        fanout.for_each = Some(crate::workflow::ForEachSpec {
            in_: "{{input.items}}".to_string(),
            sequential: false,
            body: vec![body_step],
        });
        let wf = workflow(vec![step("seed", &[]), fanout]);
        let graph = build(&wf, &definitions(), &EngineConfig::default()).unwrap();
        assert_eq!(
            graph.waves(),
            &[vec!["seed".to_string()], vec!["fanout".to_string()]]
        );
    }
}
