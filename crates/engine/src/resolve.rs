//! # Parameter Resolution
//!
//! Rewrites a step's declared parameters by substituting `${source.selector}`
//! references against the per-run [`RunContext`].
//!
//! - A value that is exactly one reference is replaced by the referenced JSON
//!   value, preserving its native type.
//! - A reference embedded in a larger string is stringified and concatenated.
//! - Arrays and objects are resolved recursively; other literals pass through.
//!
//! Resolution performs no I/O and is deterministic for a given context.
//!
//! ```rust
//! use autoflow_engine::resolve::{RunContext, resolve_value};
//! use serde_json::json;
//!
//! let mut context = RunContext::new(json!({"name": "Ada"}));
//! context.record_output(1, json!({"id": 42}));
//!
//! let resolved = resolve_value(&json!({"body": "${steps.1.output.id}", "greeting": "hi ${trigger.name}"}), &context)?;
//! assert_eq!(resolved, json!({"body": 42, "greeting": "hi Ada"}));
//! # Ok::<(), autoflow_engine::resolve::ResolutionError>(())
//! ```

use std::collections::BTreeMap;

use autoflow_types::ProviderResult;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::templates::{Reference, ReferenceSource, exact_reference, parse_reference_expression, template_spans};

/// Reference that cannot be satisfied from the current context.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("unresolved reference ${{{expression}}}: step {step} has not executed in this run")]
    StepNotExecuted { expression: String, step: u32 },
    #[error("unresolved reference ${{{expression}}}: path '{path}' does not exist")]
    MissingPath { expression: String, path: String },
    #[error("unresolved reference ${{{expression}}}: unknown source (expected trigger, steps or loop)")]
    UnknownSource { expression: String },
    #[error("invalid reference ${{{expression}}}: {reason}")]
    InvalidReference { expression: String, reason: String },
    #[error("unresolved reference ${{{expression}}}: loop values are only available inside a loop body")]
    OutsideLoop { expression: String },
    #[error("loop items must resolve to an array, got {found}")]
    NotAnArray { found: String },
}

/// Per-run context: the trigger input plus each executed step's result.
///
/// Created fresh for every run and discarded when the run completes.
#[derive(Debug, Default, Clone)]
pub struct RunContext {
    /// Trigger input the run was started with.
    pub trigger: Value,
    /// Step entries keyed by order; each entry is `{output, message, metadata}`.
    pub steps: BTreeMap<u32, Value>,
    /// `{item, index}` of the current iteration; present only while a loop body executes.
    pub loop_frame: Option<Value>,
}

impl RunContext {
    pub fn new(trigger: Value) -> Self {
        Self {
            trigger,
            steps: BTreeMap::new(),
            loop_frame: None,
        }
    }

    /// Record a provider result under the step's order.
    pub fn record_result(&mut self, order: u32, result: &ProviderResult) {
        self.steps.insert(
            order,
            step_entry(result.output.clone(), result.message.clone(), result.metadata.clone()),
        );
    }

    /// Record a bare output value under the step's order.
    pub fn record_output(&mut self, order: u32, output: Value) {
        self.steps.insert(order, step_entry(output, String::new(), Map::new()));
    }

    /// Expose `item` at `index` to `${loop.*}` references.
    pub fn enter_loop_iteration(&mut self, item: Value, index: usize) {
        let mut frame = Map::new();
        frame.insert("item".into(), item);
        frame.insert("index".into(), Value::from(index));
        self.loop_frame = Some(Value::Object(frame));
    }

    /// Remove the loop frame once the loop finishes.
    pub fn exit_loop(&mut self) {
        self.loop_frame = None;
    }
}

fn step_entry(output: Value, message: String, metadata: Map<String, Value>) -> Value {
    let mut entry = Map::new();
    entry.insert("output".into(), output);
    entry.insert("message".into(), Value::String(message));
    entry.insert("metadata".into(), Value::Object(metadata));
    Value::Object(entry)
}

/// Resolve every parameter of a step.
pub fn resolve_params(params: &IndexMap<String, Value>, context: &RunContext) -> Result<Map<String, Value>, ResolutionError> {
    let mut resolved = Map::new();
    for (name, value) in params {
        resolved.insert(name.clone(), resolve_value(value, context)?);
    }
    Ok(resolved)
}

/// Recursively resolve all references in a JSON value.
pub fn resolve_value(value: &Value, context: &RunContext) -> Result<Value, ResolutionError> {
    match value {
        Value::String(text) => resolve_string(text, context),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(item, context))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(object) => {
            let mut resolved = Map::new();
            for (key, nested) in object {
                resolved.insert(key.clone(), resolve_value(nested, context)?);
            }
            Ok(Value::Object(resolved))
        }
        _ => Ok(value.clone()),
    }
}

fn resolve_string(text: &str, context: &RunContext) -> Result<Value, ResolutionError> {
    if let Some(expression) = exact_reference(text) {
        let reference = parse_reference_expression(expression)?;
        return lookup_reference(&reference, context).cloned();
    }

    let spans = template_spans(text);
    if spans.is_empty() {
        return Ok(Value::String(text.to_string()));
    }

    let mut output = String::with_capacity(text.len());
    let mut cursor = 0usize;
    for span in spans {
        output.push_str(&text[cursor..span.start]);
        let reference = parse_reference_expression(span.expression)?;
        output.push_str(&format_json_value(lookup_reference(&reference, context)?));
        cursor = span.end;
    }
    output.push_str(&text[cursor..]);
    Ok(Value::String(output))
}

/// Resolve a loop step's `items` declaration to the array it iterates.
pub fn resolve_loop_items(items: &Value, context: &RunContext) -> Result<Vec<Value>, ResolutionError> {
    match resolve_value(items, context)? {
        Value::Array(items) => Ok(items),
        other => Err(ResolutionError::NotAnArray {
            found: json_type_name(&other).to_string(),
        }),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Look up a parsed reference, failing when the step has not run or the path is absent.
pub fn lookup_reference<'a>(reference: &Reference, context: &'a RunContext) -> Result<&'a Value, ResolutionError> {
    let root = reference_root(reference, context)?;
    select_path(root, &reference.path).ok_or_else(|| ResolutionError::MissingPath {
        expression: reference.expression.clone(),
        path: reference.path.join("."),
    })
}

/// Like [`lookup_reference`] but a missing path yields `null`.
///
/// Unexecuted steps and loop references outside a loop remain errors.
pub fn lookup_reference_or_null(reference: &Reference, context: &RunContext) -> Result<Value, ResolutionError> {
    let root = reference_root(reference, context)?;
    Ok(select_path(root, &reference.path).cloned().unwrap_or(Value::Null))
}

fn reference_root<'a>(reference: &Reference, context: &'a RunContext) -> Result<&'a Value, ResolutionError> {
    match reference.source {
        ReferenceSource::Trigger => Ok(&context.trigger),
        ReferenceSource::Step(order) => context.steps.get(&order).ok_or_else(|| ResolutionError::StepNotExecuted {
            expression: reference.expression.clone(),
            step: order,
        }),
        ReferenceSource::Loop => match &context.loop_frame {
            Some(_) if reference.path.is_empty() => Err(ResolutionError::InvalidReference {
                expression: reference.expression.clone(),
                reason: "use loop.item or loop.index".into(),
            }),
            Some(frame) => Ok(frame),
            None => Err(ResolutionError::OutsideLoop {
                expression: reference.expression.clone(),
            }),
        },
    }
}

/// Select a nested value by path segments; numeric segments index arrays.
pub fn select_path<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut current = value;
    for segment in path {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Formats a JSON value for embedding in a string.
///
/// Strings are unquoted, `null` becomes empty, and everything else is JSON encoded.
pub fn format_json_value(value: &Value) -> String {
    match value {
        Value::String(string_value) => string_value.clone(),
        Value::Number(number_value) => number_value.to_string(),
        Value::Bool(boolean_value) => boolean_value.to_string(),
        Value::Null => String::new(),
        other_value => other_value.to_string(),
    }
}
