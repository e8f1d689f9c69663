//! Workflow and task definition model.
//!
//! These types are the in-memory representation the engine consumes; any
//! YAML/JSON loading surface lives outside this crate. All maps preserve
//! authoring order.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::prelude::*;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Workflow input must be an object"))]
    InputNotObject,

    #[snafu(display("Missing required input '{name}'"))]
    MissingInput { name: String },

    #[snafu(display("Input '{name}' has the wrong type, expected {expected}"))]
    InputType { name: String, expected: FieldType },
}

pub type Result<T> = std::result::Result<T, Error>;

/// A declarative workflow: named steps wired together by explicit
/// `dependsOn` edges and implicit template references.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub name: String,
    pub namespace: String,
    /// Parameter name to field spec; validated against the run input.
    #[serde(default)]
    pub input_schema: IndexMap<String, InputField>,
    /// Authorial order only; execution order comes from the graph.
    #[serde(default)]
    pub tasks: Vec<TaskStep>,
    /// Output name to template string, resolved against the final context.
    #[serde(default)]
    pub output_mapping: IndexMap<String, String>,
}

impl WorkflowDefinition {
    /// Validate a run input against `input_schema`.
    ///
    /// # Errors
    /// Returns the first missing required parameter or type mismatch.
    pub fn validate_input(&self, input: &Value) -> Result<()> {
        if self.input_schema.is_empty() {
            return Ok(());
        }
        let Some(fields) = input.as_object() else {
            return Err(Error::InputNotObject);
        };
        for (name, field) in &self.input_schema {
            match fields.get(name) {
                None | Some(Value::Null) => {
                    if field.required {
                        return Err(Error::MissingInput { name: name.clone() });
                    }
                }
                Some(value) => {
                    ensure!(
                        field.field_type.matches(value),
                        InputTypeSnafu {
                            name: name.clone(),
                            expected: field.field_type,
                        }
                    );
                }
            }
        }
        Ok(())
    }
}

/// One parameter in a workflow or task schema.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InputField {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl FieldType {
    #[must_use]
    pub fn matches(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Object => "object",
            FieldType::Array => "array",
        };
        f.write_str(name)
    }
}

/// One node in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStep {
    /// Unique within the workflow, including forEach bodies.
    pub id: String,
    /// Name of the [`TaskDefinition`] this step invokes.
    pub task_ref: String,
    /// Field name to template string or literal value.
    #[serde(default)]
    pub input: IndexMap<String, Value>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Template evaluated in full-expression mode; falsy skips the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_each: Option<ForEachSpec>,
    /// Per-step timeout in milliseconds; the engine default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Opaque retry policy, passed through to the executor untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<Value>,
}

/// Fan-out of a sub-plan over a sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForEachSpec {
    /// Template yielding the sequence to iterate.
    #[serde(rename = "in")]
    pub in_: String,
    /// Run iterations one at a time instead of concurrently.
    #[serde(default)]
    pub sequential: bool,
    /// Sub-plan executed once per element, inside a fresh frame.
    #[serde(default)]
    pub body: Vec<TaskStep>,
}

/// Reusable task descriptor. The engine never interprets `kind` or `spec`;
/// both are handed to the executor as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    pub name: String,
    /// `http`, `transform`, or any extension tag an executor understands.
    pub kind: String,
    #[serde(default)]
    pub input_schema: IndexMap<String, InputField>,
    #[serde(default)]
    pub output_schema: IndexMap<String, InputField>,
    /// Execution spec (URL/method/headers for `http`, query expression for
    /// `transform`, anything for extension kinds).
    #[serde(default)]
    pub spec: Value,
}
