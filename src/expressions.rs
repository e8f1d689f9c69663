//! Template expression resolution and dependency extraction.
//!
//! Expressions are dot-separated paths with optional `[n]` indexing,
//! wrapped in `{{ … }}`:
//!
//! - `input.<field>…` — workflow input
//! - `tasks.<taskId>.output.<field>…` — a completed task's record
//! - `forEach.item`, `forEach.index`, `forEach.$parent.<…>`, `forEach.$root.<…>`
//!
//! A string that is exactly one `{{ expr }}` resolves to the raw value,
//! preserving its type; any other string has each occurrence replaced by its
//! stringified value. The resolver is permissive: missing lookups yield
//! undefined (null / empty string) and only malformed syntax or a frame walk
//! without a frame is an error. Strict checking belongs to validators
//! outside this crate.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use snafu::prelude::*;
use std::collections::BTreeSet;
use tracing::trace;

use crate::context::ExecutionContext;

lazy_static! {
    static ref TEMPLATE_RE: Regex =
        Regex::new(r"\{\{([^{}]*)\}\}").expect("template regex is valid");
    static ref FULL_RE: Regex =
        Regex::new(r"^\s*\{\{([^{}]*)\}\}\s*$").expect("template regex is valid");
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Malformed template expression '{expression}': {message}"))]
    Malformed { expression: String, message: String },

    #[snafu(display("'{reference}' used outside of a forEach scope"))]
    NoFrame { reference: String },

    #[snafu(display("'forEach.$parent' walks past the outermost frame"))]
    NoParentFrame,
}

pub type Result<T> = std::result::Result<T, Error>;

/// One dot-separated path component: a name plus trailing `[n]` indexes.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Component {
    name: String,
    indexes: Vec<usize>,
}

/// Resolve any value against the context: strings go through template
/// resolution, mappings and sequences recurse, everything else is returned
/// unchanged.
///
/// # Errors
/// Propagates [`Error`] from any embedded template.
pub fn resolve(value: &Value, ctx: &ExecutionContext) -> Result<Value> {
    match value {
        Value::String(s) => resolve_string(s, ctx),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, field) in map {
                out.insert(key.clone(), resolve(field, ctx)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(resolve(item, ctx)?);
            }
            Ok(Value::Array(out))
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => Ok(value.clone()),
    }
}

/// Resolve one string. A full `{{ expr }}` match returns the raw value
/// (undefined becomes null); otherwise every occurrence is interpolated,
/// with undefined stringifying to the empty string.
///
/// # Errors
/// Returns [`Error`] for malformed expressions or frame walks without a
/// frame.
pub fn resolve_string(s: &str, ctx: &ExecutionContext) -> Result<Value> {
    if let Some(caps) = FULL_RE.captures(s) {
        let expr = caps.get(1).map_or("", |g| g.as_str());
        let components = parse_expression(expr)?;
        trace!(expression = expr, "resolving full template expression");
        return Ok(resolve_components(&components, ctx)?.unwrap_or(Value::Null));
    }
    if !s.contains("{{") {
        return Ok(Value::String(s.to_string()));
    }
    let mut out = String::new();
    let mut last = 0;
    for caps in TEMPLATE_RE.captures_iter(s) {
        let Some(whole) = caps.get(0) else { continue };
        let expr = caps.get(1).map_or("", |g| g.as_str());
        out.push_str(s.get(last..whole.start()).unwrap_or(""));
        let components = parse_expression(expr)?;
        let value = resolve_components(&components, ctx)?;
        out.push_str(&stringify(value.as_ref()));
        last = whole.end();
    }
    out.push_str(s.get(last..).unwrap_or(""));
    Ok(Value::String(out))
}

/// Boolean coercion for `condition` results: null, false, 0, and the empty
/// string are falsy; everything else is truthy.
#[must_use]
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Collect the task ids referenced by `tasks.<id>…` templates anywhere in a
/// value. Pure; malformed expressions and other roots are ignored.
#[must_use]
pub fn referenced_tasks(value: &Value) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    collect_references(value, &mut out);
    out
}

fn collect_references(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => {
            for caps in TEMPLATE_RE.captures_iter(s) {
                let expr = caps.get(1).map_or("", |g| g.as_str());
                let Ok(components) = parse_expression(expr) else {
                    continue;
                };
                let is_task_root = components.first().is_some_and(|c| c.name == "tasks");
                if !is_task_root {
                    continue;
                }
                if let Some(id) = components.get(1)
                    && !id.name.starts_with('$')
                {
                    out.insert(id.name.clone());
                }
            }
        }
        Value::Object(map) => {
            for field in map.values() {
                collect_references(field, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_references(item, out);
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

fn stringify(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(composite) => serde_json::to_string(composite).unwrap_or_default(),
    }
}

fn parse_expression(text: &str) -> Result<Vec<Component>> {
    let trimmed = text.trim();
    ensure!(
        !trimmed.is_empty(),
        MalformedSnafu {
            expression: text.to_string(),
            message: "empty expression".to_string(),
        }
    );
    let mut components = Vec::new();
    for piece in trimmed.split('.') {
        components.push(parse_component(piece, trimmed)?);
    }
    Ok(components)
}

fn parse_component(piece: &str, whole: &str) -> Result<Component> {
    let malformed = |message: &str| Error::Malformed {
        expression: whole.to_string(),
        message: message.to_string(),
    };
    let (name, mut rest) = match piece.find('[') {
        Some(at) => piece.split_at(at),
        None => (piece, ""),
    };
    if name.is_empty() {
        return Err(malformed("empty path component"));
    }
    if let Some(token) = name.strip_prefix('$') {
        if token != "parent" && token != "root" {
            return Err(malformed("only $parent and $root are recognized"));
        }
    } else {
        let mut chars = name.chars();
        let leading_ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        let tail_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !leading_ok || !tail_ok {
            return Err(malformed("invalid identifier"));
        }
    }
    let mut indexes = Vec::new();
    while !rest.is_empty() {
        let Some(body) = rest.strip_prefix('[') else {
            return Err(malformed("expected '[' in index"));
        };
        let Some(close) = body.find(']') else {
            return Err(malformed("unclosed index"));
        };
        let (digits, tail) = body.split_at(close);
        let index = digits
            .parse::<usize>()
            .map_err(|_| malformed("index must be a non-negative integer"))?;
        indexes.push(index);
        rest = tail.get(1..).unwrap_or("");
    }
    Ok(Component {
        name: name.to_string(),
        indexes,
    })
}

/// Walk a parsed path against the context. `Ok(None)` is undefined.
fn resolve_components(components: &[Component], ctx: &ExecutionContext) -> Result<Option<Value>> {
    let Some((root, rest)) = components.split_first() else {
        return Ok(None);
    };
    match root.name.as_str() {
        "input" => {
            let mut current = apply_indexes(Some(ctx.input().clone()), &root.indexes);
            current = walk(current, rest);
            Ok(current)
        }
        "tasks" => {
            let Some((id, tail)) = rest.split_first() else {
                return Ok(None);
            };
            if id.name.starts_with('$') {
                return Ok(None);
            }
            let mut current = apply_indexes(ctx.task_value(&id.name), &id.indexes);
            current = walk(current, tail);
            Ok(current)
        }
        "forEach" => resolve_frame_path(rest, ctx),
        _ => Ok(None),
    }
}

fn resolve_frame_path(rest: &[Component], ctx: &ExecutionContext) -> Result<Option<Value>> {
    let frames = ctx.frames();
    let mut hops = 0usize;
    let mut at = 0usize;
    match rest.first().map(|c| c.name.as_str()) {
        Some("$root") => {
            ensure!(
                !frames.is_empty(),
                NoFrameSnafu {
                    reference: "forEach.$root".to_string(),
                }
            );
            at = 1;
            hops = frames.len() - 1;
        }
        Some("$parent") => {
            ensure!(
                !frames.is_empty(),
                NoFrameSnafu {
                    reference: "forEach.$parent".to_string(),
                }
            );
            while rest.get(at).is_some_and(|c| c.name == "$parent") {
                hops += 1;
                at += 1;
            }
            ensure!(frames.len() > hops, NoParentFrameSnafu);
        }
        Some(_) | None => {
            // Plain forEach.* outside a frame degrades to undefined.
            if frames.is_empty() {
                return Ok(None);
            }
        }
    }
    let Some(frame) = frames.len().checked_sub(1 + hops).and_then(|i| frames.get(i)) else {
        return Ok(None);
    };
    let Some(field) = rest.get(at) else {
        return Ok(None);
    };
    let base = match field.name.as_str() {
        "item" => Some(frame.item.clone()),
        "index" => serde_json::to_value(frame.index).ok(),
        _ => None,
    };
    let current = apply_indexes(base, &field.indexes);
    Ok(walk(current, rest.get(at + 1..).unwrap_or(&[])))
}

fn walk(mut current: Option<Value>, components: &[Component]) -> Option<Value> {
    for component in components {
        current = current
            .as_ref()
            .and_then(Value::as_object)
            .and_then(|map| map.get(&component.name))
            .cloned();
        current = apply_indexes(current, &component.indexes);
    }
    current
}

fn apply_indexes(mut current: Option<Value>, indexes: &[usize]) -> Option<Value> {
    for index in indexes {
        current = current
            .as_ref()
            .and_then(Value::as_array)
            .and_then(|items| items.get(*index))
            .cloned();
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TaskRecord;
    use serde_json::json;

    fn ctx() -> ExecutionContext {
        let mut ctx = ExecutionContext::new(json!({
            "userId": "u-7",
            "flags": {"beta": true},
            "items": [{"sku": "a"}, {"sku": "b"}],
        }));
        ctx.insert_record(
            "fetch-user",
            TaskRecord::completed(json!({"id": "123", "tags": ["x", "y"]}), 10),
        )
        .unwrap();
        ctx
    }

    #[test]
    fn full_expression_preserves_type() {
        let value = resolve_string("{{input.flags.beta}}", &ctx()).unwrap();
        assert_eq!(value, json!(true));
    }

    #[test]
    fn full_expression_tolerates_whitespace() {
        let value = resolve_string("  {{ input.userId }}  ", &ctx()).unwrap();
        assert_eq!(value, json!("u-7"));
    }

    #[test]
    fn interpolation_stringifies() {
        let value =
            resolve_string("user={{input.userId}} beta={{input.flags.beta}}", &ctx()).unwrap();
        assert_eq!(value, json!("user=u-7 beta=true"));
    }

    #[test]
    fn task_output_navigation() {
        let value = resolve_string("{{tasks.fetch-user.output.id}}", &ctx()).unwrap();
        assert_eq!(value, json!("123"));
    }

    #[test]
    fn array_indexing() {
        let value = resolve_string("{{input.items[1].sku}}", &ctx()).unwrap();
        assert_eq!(value, json!("b"));
        let value = resolve_string("{{tasks.fetch-user.output.tags[0]}}", &ctx()).unwrap();
        assert_eq!(value, json!("x"));
    }

    #[test]
    fn missing_paths_are_undefined() {
        assert_eq!(resolve_string("{{input.nope.deep}}", &ctx()).unwrap(), Value::Null);
        assert_eq!(resolve_string("{{tasks.ghost.output}}", &ctx()).unwrap(), Value::Null);
        assert_eq!(resolve_string("{{mystery.root}}", &ctx()).unwrap(), Value::Null);
        assert_eq!(
            resolve_string("id: {{tasks.ghost.output.id}}!", &ctx()).unwrap(),
            json!("id: !")
        );
    }

    #[test]
    fn literal_values_round_trip() {
        let literal = json!({"n": 3, "s": "plain", "nested": [1, 2, {"ok": true}]});
        assert_eq!(resolve(&literal, &ctx()).unwrap(), literal);
    }

    #[test]
    fn malformed_expressions_error() {
        assert!(resolve_string("{{}}", &ctx()).is_err());
        assert!(resolve_string("{{input..x}}", &ctx()).is_err());
        assert!(resolve_string("{{input.items[x]}}", &ctx()).is_err());
        assert!(resolve_string("{{input.items[0}}", &ctx()).is_err());
        assert!(resolve_string("{{forEach.$self.item}}", &ctx()).is_err());
    }

    #[test]
    fn foreach_frames_resolve() {
        let base = ctx();
        let outer = base.child_for_iteration(json!({"dept": "Eng"}), 0);
        let inner = outer.child_for_iteration(json!(41), 1);
        assert_eq!(resolve_string("{{forEach.item}}", &inner).unwrap(), json!(41));
        assert_eq!(resolve_string("{{forEach.index}}", &inner).unwrap(), json!(1));
        assert_eq!(
            resolve_string("{{forEach.$parent.item.dept}}", &inner).unwrap(),
            json!("Eng")
        );
        assert_eq!(
            resolve_string("{{forEach.$root.item.dept}}", &inner).unwrap(),
            json!("Eng")
        );
    }

    #[test]
    fn foreach_outside_frame_is_undefined() {
        assert_eq!(resolve_string("{{forEach.item}}", &ctx()).unwrap(), Value::Null);
    }

    #[test]
    fn parent_without_frame_fails_loudly() {
        let err = resolve_string("{{forEach.$parent.item}}", &ctx()).unwrap_err();
        assert!(matches!(err, Error::NoFrame { .. }));

        let one_deep = ctx().child_for_iteration(json!(1), 0);
        let err = resolve_string("{{forEach.$parent.item}}", &one_deep).unwrap_err();
        assert!(matches!(err, Error::NoParentFrame));

        let err = resolve_string("{{forEach.$root.item}}", &ctx()).unwrap_err();
        assert!(matches!(err, Error::NoFrame { .. }));
    }

    #[test]
    fn extracts_referenced_tasks() {
        let input = json!({
            "a": "{{tasks.first.output.id}}",
            "b": ["{{tasks.second.output.x}} and {{input.userId}}"],
            "c": {"d": "{{forEach.item}} {{tasks.first.output.y}}"},
            "e": "no templates here",
        });
        let refs = referenced_tasks(&input);
        assert_eq!(
            refs.into_iter().collect::<Vec<_>>(),
            vec!["first".to_string(), "second".to_string()]
        );
    }

    #[test]
    fn extraction_ignores_other_roots_and_malformed() {
        let input = json!({
            "a": "{{input.x}}",
            "b": "{{forEach.item}}",
            "c": "{{tasks..broken}}",
            "d": "{{tasks}}",
        });
        assert!(referenced_tasks(&input).is_empty());
    }
}
