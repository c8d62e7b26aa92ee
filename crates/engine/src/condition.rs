//! Condition expressions for `condition` steps.
//!
//! Supported syntax:
//! - logical `||`, `&&`, leading `!`, and parentheses;
//! - comparisons `==`, `!=`, `>`, `>=`, `<`, `<=`;
//! - `left.includes(right)` for arrays and strings;
//! - bare operands evaluated for truthiness.
//!
//! Operands are JSON literals, single-quoted strings, or references written
//! either as `${steps.1.output.ok}` or bare `steps.1.output.ok`. A reference
//! to a missing path evaluates to `null`; a reference to a step that has not
//! executed is a [`ResolutionError`].

use std::cmp::Ordering;

use serde_json::Value;
use thiserror::Error;

use crate::resolve::{ResolutionError, RunContext, format_json_value, lookup_reference_or_null};
use crate::templates::{exact_reference, is_reference_expression, parse_reference_expression};

/// Failure to evaluate a condition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConditionError {
    #[error("invalid condition '{expression}': {reason}")]
    Syntax { expression: String, reason: String },
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparison {
    Equal,
    NotEqual,
    GreaterOrEqual,
    LessOrEqual,
    Greater,
    Less,
}

impl Comparison {
    const ALL: [(&'static str, Comparison); 6] = [
        ("!=", Comparison::NotEqual),
        ("==", Comparison::Equal),
        (">=", Comparison::GreaterOrEqual),
        ("<=", Comparison::LessOrEqual),
        (">", Comparison::Greater),
        ("<", Comparison::Less),
    ];
}

/// Normalizes a condition string by trimming and unwrapping a whole-expression `${...}`.
pub fn normalize_condition_expression(raw_expression: &str) -> String {
    let trimmed = raw_expression.trim();
    exact_reference(trimmed).unwrap_or(trimmed).to_string()
}

/// Validates syntax without evaluating any reference.
pub fn validate_condition_expression(expression: &str) -> Result<(), ConditionError> {
    let normalized = normalize_condition_expression(expression);
    walk(&normalized, &mut |operand| validate_operand(operand, &normalized))
}

/// Evaluates a condition expression against the run context.
pub fn eval_condition(expression: &str, context: &RunContext) -> Result<bool, ConditionError> {
    let normalized = normalize_condition_expression(expression);
    evaluate_node(&normalized, &normalized, context)
}

fn evaluate_node(expression: &str, whole: &str, context: &RunContext) -> Result<bool, ConditionError> {
    let trimmed = strip_outer_parentheses(expression.trim());
    if trimmed.is_empty() {
        return Err(syntax(whole, "expression cannot be empty"));
    }

    if let Some(parts) = split_expression(trimmed, "||") {
        for part in parts {
            if evaluate_node(part, whole, context)? {
                return Ok(true);
            }
        }
        return Ok(false);
    }
    if let Some(parts) = split_expression(trimmed, "&&") {
        for part in parts {
            if !evaluate_node(part, whole, context)? {
                return Ok(false);
            }
        }
        return Ok(true);
    }

    let (negations, inner) = strip_leading_negations(trimmed);
    if negations > 0 {
        let value = evaluate_node(inner, whole, context)?;
        return Ok(if negations % 2 == 1 { !value } else { value });
    }

    if let Some(index) = find_top_level_operator(inner, ".includes(") {
        let (left, right) = split_includes(inner, index, whole)?;
        let haystack = resolve_operand(left, whole, context)?;
        let needle = resolve_operand(right, whole, context)?;
        return Ok(includes(&haystack, &needle));
    }

    for (operator, comparison) in Comparison::ALL {
        if let Some(position) = find_top_level_operator(inner, operator) {
            let left = inner[..position].trim();
            let right = inner[position + operator.len()..].trim();
            if left.is_empty() || right.is_empty() {
                return Err(syntax(whole, "comparison must include both left and right operands"));
            }
            let left_value = resolve_operand(left, whole, context)?;
            let right_value = resolve_operand(right, whole, context)?;
            return Ok(compare(&left_value, &right_value, comparison));
        }
    }

    Ok(is_truthy(&resolve_operand(inner, whole, context)?))
}

/// Walks the expression tree, calling `on_operand` for each operand.
fn walk(expression: &str, on_operand: &mut dyn FnMut(&str) -> Result<(), ConditionError>) -> Result<(), ConditionError> {
    let trimmed = strip_outer_parentheses(expression.trim());
    if trimmed.is_empty() {
        return Err(syntax(expression, "expression cannot be empty"));
    }
    for operator in ["||", "&&"] {
        if let Some(parts) = split_expression(trimmed, operator) {
            for part in parts {
                walk(part, on_operand)?;
            }
            return Ok(());
        }
    }
    let (negations, inner) = strip_leading_negations(trimmed);
    if negations > 0 {
        return walk(inner, on_operand);
    }
    if let Some(index) = find_top_level_operator(inner, ".includes(") {
        let (left, right) = split_includes(inner, index, expression)?;
        on_operand(left)?;
        return on_operand(right);
    }
    for (operator, _) in Comparison::ALL {
        if let Some(position) = find_top_level_operator(inner, operator) {
            let left = inner[..position].trim();
            let right = inner[position + operator.len()..].trim();
            if left.is_empty() || right.is_empty() {
                return Err(syntax(expression, "comparison must include both left and right operands"));
            }
            on_operand(left)?;
            return on_operand(right);
        }
    }
    on_operand(inner)
}

fn split_includes<'a>(inner: &'a str, index: usize, whole: &str) -> Result<(&'a str, &'a str), ConditionError> {
    let left = inner[..index].trim();
    let right = inner[index + ".includes(".len()..].trim();
    let right = right
        .strip_suffix(')')
        .ok_or_else(|| syntax(whole, "includes expression is missing ')'"))?
        .trim();
    if left.is_empty() || right.is_empty() {
        return Err(syntax(whole, "includes expression is missing an argument"));
    }
    Ok((left, right))
}

fn validate_operand(operand: &str, whole: &str) -> Result<(), ConditionError> {
    let trimmed = operand.trim();
    let inner = exact_reference(trimmed).unwrap_or(trimmed);
    if parse_literal(inner).is_some() {
        return Ok(());
    }
    if is_reference_expression(inner) {
        parse_reference_expression(inner)?;
        return Ok(());
    }
    Err(syntax(
        whole,
        &format!("unsupported operand '{trimmed}'; use a JSON literal, a quoted string, or a trigger/steps/loop reference"),
    ))
}

fn resolve_operand(operand: &str, whole: &str, context: &RunContext) -> Result<Value, ConditionError> {
    let trimmed = operand.trim();
    let inner = exact_reference(trimmed).unwrap_or(trimmed);
    if let Some(literal) = parse_literal(inner) {
        return Ok(literal);
    }
    if is_reference_expression(inner) {
        let reference = parse_reference_expression(inner)?;
        return Ok(lookup_reference_or_null(&reference, context)?);
    }
    Err(syntax(whole, &format!("unsupported operand '{trimmed}'")))
}

fn parse_literal(expression: &str) -> Option<Value> {
    if let Some(quoted) = expression.strip_prefix('\'').and_then(|rest| rest.strip_suffix('\'')) {
        return Some(Value::String(quoted.to_string()));
    }
    if looks_like_json_literal(expression) {
        return serde_json::from_str::<Value>(expression).ok();
    }
    None
}

fn looks_like_json_literal(expression: &str) -> bool {
    let starts_like_number = expression
        .chars()
        .next()
        .map(|character| character == '-' || character.is_ascii_digit())
        .unwrap_or(false);
    expression.starts_with('[')
        || expression.starts_with('{')
        || expression.starts_with('"')
        || expression == "null"
        || expression == "true"
        || expression == "false"
        || starts_like_number
}

fn includes(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|item| loosely_equal(item, needle)),
        Value::String(text) => text.contains(&format_json_value(needle)),
        Value::Object(map) => map.contains_key(&format_json_value(needle)),
        _ => false,
    }
}

fn compare(left: &Value, right: &Value, comparison: Comparison) -> bool {
    match comparison {
        Comparison::Equal => loosely_equal(left, right),
        Comparison::NotEqual => !loosely_equal(left, right),
        ordered => {
            let Some(ordering) = order_values(left, right) else {
                return false;
            };
            match ordered {
                Comparison::Greater => ordering == Ordering::Greater,
                Comparison::GreaterOrEqual => ordering != Ordering::Less,
                Comparison::Less => ordering == Ordering::Less,
                Comparison::LessOrEqual => ordering != Ordering::Greater,
                Comparison::Equal | Comparison::NotEqual => false,
            }
        }
    }
}

/// Equality that lets `"42" == 42` and `"true" == true` hold.
fn loosely_equal(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    if let (Some(left_number), Some(right_number)) = (as_number(left), as_number(right)) {
        return left_number == right_number;
    }
    match (left, right) {
        (Value::String(text), other @ (Value::Bool(_) | Value::Number(_)))
        | (other @ (Value::Bool(_) | Value::Number(_)), Value::String(text)) => *text == format_json_value(other),
        _ => false,
    }
}

fn order_values(left: &Value, right: &Value) -> Option<Ordering> {
    if let (Some(left_number), Some(right_number)) = (as_number(left), as_number(right)) {
        return left_number.partial_cmp(&right_number);
    }
    match (left, right) {
        (Value::String(left_text), Value::String(right_text)) => Some(left_text.cmp(right_text)),
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Truthiness: `null`, `false`, `0`, empty strings/arrays/objects and the
/// strings `"false"`/`"0"` are false; everything else is true.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => {
            let trimmed = text.trim();
            !(trimmed.is_empty() || trimmed.eq_ignore_ascii_case("false") || trimmed == "0")
        }
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn syntax(expression: &str, reason: &str) -> ConditionError {
    ConditionError::Syntax {
        expression: expression.to_string(),
        reason: reason.to_string(),
    }
}

fn strip_outer_parentheses(expression: &str) -> &str {
    let mut current = expression.trim();
    while current.starts_with('(') && current.ends_with(')') && closing_paren_index(current) == Some(current.len() - 1) {
        current = current[1..current.len() - 1].trim();
    }
    current
}

fn closing_paren_index(expression: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_double_quote = false;
    let mut in_single_quote = false;
    for (index, character) in expression.char_indices() {
        match character {
            '"' if !in_single_quote => in_double_quote = !in_double_quote,
            '\'' if !in_double_quote => in_single_quote = !in_single_quote,
            '(' if !in_single_quote && !in_double_quote => depth += 1,
            ')' if !in_single_quote && !in_double_quote => {
                depth -= 1;
                if depth == 0 {
                    return Some(index);
                }
            }
            _ => {}
        }
    }
    None
}

fn split_expression<'a>(expression: &'a str, operator: &str) -> Option<Vec<&'a str>> {
    let mut parts = Vec::new();
    let mut start = 0usize;
    let length = expression.len();

    while start < length {
        if let Some(relative_index) = find_top_level_operator(&expression[start..], operator) {
            let absolute_index = start + relative_index;
            parts.push(expression[start..absolute_index].trim());
            start = absolute_index + operator.len();
        } else {
            parts.push(expression[start..].trim());
            break;
        }
    }

    if parts.len() > 1 { Some(parts) } else { None }
}

fn strip_leading_negations(expression: &str) -> (usize, &str) {
    let mut count = 0usize;
    let mut remainder = expression.trim_start();
    while let Some(stripped) = remainder.strip_prefix('!') {
        if stripped.starts_with('=') {
            break;
        }
        count += 1;
        remainder = stripped.trim_start();
    }
    (count, remainder)
}

fn find_top_level_operator(expression: &str, operator: &str) -> Option<usize> {
    let mut in_single_quote = false;
    let mut in_double_quote = false;
    let mut depth = 0i32;

    for (index, character) in expression.char_indices() {
        match character {
            '\'' if !in_double_quote => {
                in_single_quote = !in_single_quote;
                continue;
            }
            '"' if !in_single_quote => {
                in_double_quote = !in_double_quote;
                continue;
            }
            '(' | '[' | '{' if !in_single_quote && !in_double_quote => {
                depth += 1;
                continue;
            }
            ')' | ']' | '}' if !in_single_quote && !in_double_quote => {
                if depth > 0 {
                    depth -= 1;
                }
                continue;
            }
            _ => {}
        }

        if !in_single_quote && !in_double_quote && depth == 0 && expression[index..].starts_with(operator) {
            return Some(index);
        }
    }

    None
}
