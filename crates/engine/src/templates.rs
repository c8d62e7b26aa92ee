//! Reference expression parsing.
//!
//! Step parameters may embed `${source.selector}` references. The source is
//! `trigger`, `steps.<order>` or, inside a loop body, `loop`. Selectors are
//! dot/bracket paths such as `output.items[0].id` or `output.items.0.id`.

use crate::resolve::ResolutionError;

/// Fields of a step entry that may be addressed explicitly.
const STEP_RECORD_FIELDS: [&str; 3] = ["output", "message", "metadata"];

/// Where a reference reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceSource {
    /// The run's trigger input.
    Trigger,
    /// The recorded result of the step with this order.
    Step(u32),
    /// The current loop iteration frame.
    Loop,
}

/// Parsed `${source.selector}` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub source: ReferenceSource,
    /// Path segments applied to the source value. For step sources the first
    /// segment is always `output`, `message` or `metadata`.
    pub path: Vec<String>,
    /// Expression text without the `${` `}` delimiters.
    pub expression: String,
}

/// If `value` is exactly one `${...}` reference, returns its inner expression.
///
/// Surrounding whitespace counts as literal text, so `" ${a} "` is not exact.
pub fn exact_reference(value: &str) -> Option<&str> {
    let inner = value.strip_prefix("${")?.strip_suffix('}')?;
    if inner.contains("${") || inner.contains('}') {
        return None;
    }
    Some(inner.trim())
}

/// Located `${...}` occurrence inside a string.
///
/// An unterminated `${` ends the scan; the remaining text is a literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TemplateSpan<'a> {
    /// Byte offset of `$`.
    pub start: usize,
    /// Byte offset one past the closing `}`.
    pub end: usize,
    pub expression: &'a str,
}

pub(crate) fn template_spans(value: &str) -> Vec<TemplateSpan<'_>> {
    let mut spans = Vec::new();
    let mut offset = 0usize;

    while let Some(relative_start) = value[offset..].find("${") {
        let start = offset + relative_start;
        let after_start = &value[start + 2..];
        let Some(relative_end) = after_start.find('}') else {
            break;
        };
        let expression = after_start[..relative_end].trim();
        let end = start + 2 + relative_end + 1;
        spans.push(TemplateSpan { start, end, expression });
        offset = end;
    }

    spans
}

/// Returns true when `expression` starts with a supported reference root.
pub fn is_reference_expression(expression: &str) -> bool {
    let trimmed = expression.trim();
    ["trigger", "steps", "loop"].iter().any(|root| {
        trimmed == *root || trimmed.starts_with(&format!("{root}.")) || trimmed.starts_with(&format!("{root}["))
    })
}

/// Parses a reference expression such as `steps.2.output.items[0].id`.
///
/// Supports:
/// - `trigger`, `trigger.field`, `trigger.items[0]`
/// - `steps.3`, `steps.3.output.id`, `steps.3.id` (implicit `output`)
/// - `steps.3.metadata.status_code`, `steps.3.message`
/// - `loop.item`, `loop.item.name`, `loop.index`
pub fn parse_reference_expression(expression: &str) -> Result<Reference, ResolutionError> {
    let trimmed = expression.trim();
    let invalid = |reason: &str| ResolutionError::InvalidReference {
        expression: trimmed.to_string(),
        reason: reason.to_string(),
    };

    if trimmed.is_empty() {
        return Err(invalid("empty reference"));
    }

    let segments = split_path_segments(trimmed).ok_or_else(|| invalid("malformed selector path"))?;
    let mut segments = segments.into_iter();
    let root = segments.next().unwrap_or_default();

    match root.as_str() {
        "trigger" => Ok(Reference {
            source: ReferenceSource::Trigger,
            path: segments.collect(),
            expression: trimmed.to_string(),
        }),
        "loop" => Ok(Reference {
            source: ReferenceSource::Loop,
            path: segments.collect(),
            expression: trimmed.to_string(),
        }),
        "steps" => {
            let order_segment = segments.next().ok_or_else(|| invalid("missing step order after 'steps'"))?;
            let order = order_segment
                .parse::<u32>()
                .ok()
                .filter(|order| *order > 0)
                .ok_or_else(|| invalid("step order must be a positive integer"))?;
            let mut path: Vec<String> = segments.collect();
            if path.first().is_none_or(|first| !STEP_RECORD_FIELDS.contains(&first.as_str())) {
                path.insert(0, "output".to_string());
            }
            Ok(Reference {
                source: ReferenceSource::Step(order),
                path,
                expression: trimmed.to_string(),
            })
        }
        _ => Err(ResolutionError::UnknownSource {
            expression: trimmed.to_string(),
        }),
    }
}

/// Splits a selector into segments, accepting both `a.b[0]` and `a.b.0`.
pub fn split_path_segments(path: &str) -> Option<Vec<String>> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars().peekable();

    while let Some(character) = chars.next() {
        match character {
            '.' => {
                if current.is_empty() {
                    return None;
                }
                segments.push(std::mem::take(&mut current));
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
                let mut inner = String::new();
                let mut closed = false;
                for next_character in chars.by_ref() {
                    if next_character == ']' {
                        closed = true;
                        break;
                    }
                    inner.push(next_character);
                }
                let inner = inner.trim();
                if !closed || inner.is_empty() {
                    return None;
                }
                segments.push(inner.trim_matches(['"', '\'']).to_string());
                if chars.peek() == Some(&'.') {
                    chars.next();
                    if chars.peek().is_none() {
                        return None;
                    }
                }
            }
            character if character.is_whitespace() => return None,
            _ => current.push(character),
        }
    }

    if !current.is_empty() {
        segments.push(current);
    }
    if segments.is_empty() { None } else { Some(segments) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_spans_find_each_reference() {
        let text = "Hello ${trigger.name}, item ${ steps.2.output.id }!";
        let spans = template_spans(text);
        let expressions: Vec<&str> = spans.iter().map(|span| span.expression).collect();
        assert_eq!(expressions, vec!["trigger.name", "steps.2.output.id"]);
        assert_eq!(&text[spans[0].start..spans[0].end], "${trigger.name}");
    }

    #[test]
    fn unterminated_reference_is_ignored() {
        assert!(template_spans("cost is ${trigger.amount").is_empty());
    }

    #[test]
    fn exact_reference_requires_whole_value() {
        assert_eq!(exact_reference("${steps.1.output.id}"), Some("steps.1.output.id"));
        assert_eq!(exact_reference("id=${steps.1.output.id}"), None);
        assert_eq!(exact_reference("${a}${b}"), None);
        assert_eq!(exact_reference(" ${steps.1.output.id} "), None);
        assert_eq!(exact_reference("${ steps.1.output.id }"), Some("steps.1.output.id"));
    }

    #[test]
    fn parse_step_reference_supports_dot_index() {
        let reference = parse_reference_expression("steps.2.output.items.0.id").expect("parsed");
        assert_eq!(reference.source, ReferenceSource::Step(2));
        assert_eq!(reference.path, vec!["output", "items", "0", "id"]);
    }

    #[test]
    fn parse_step_reference_supports_bracket_index() {
        let reference = parse_reference_expression("steps.2.output.items[0].id").expect("parsed");
        assert_eq!(reference.path, vec!["output", "items", "0", "id"]);
    }

    #[test]
    fn parse_step_reference_defaults_to_output() {
        let reference = parse_reference_expression("steps.4.id").expect("parsed");
        assert_eq!(reference.path, vec!["output", "id"]);
        let whole = parse_reference_expression("steps.4").expect("parsed");
        assert_eq!(whole.path, vec!["output"]);
        let metadata = parse_reference_expression("steps.4.metadata.status_code").expect("parsed");
        assert_eq!(metadata.path, vec!["metadata", "status_code"]);
    }

    #[test]
    fn parse_trigger_and_loop_references() {
        let trigger = parse_reference_expression("trigger.body.users[1]").expect("parsed");
        assert_eq!(trigger.source, ReferenceSource::Trigger);
        assert_eq!(trigger.path, vec!["body", "users", "1"]);
        let item = parse_reference_expression("loop.item.email").expect("parsed");
        assert_eq!(item.source, ReferenceSource::Loop);
        assert_eq!(item.path, vec!["item", "email"]);
    }

    #[test]
    fn rejects_unknown_sources_and_bad_orders() {
        assert!(matches!(
            parse_reference_expression("env.HOME"),
            Err(ResolutionError::UnknownSource { .. })
        ));
        assert!(matches!(
            parse_reference_expression("steps.first.output"),
            Err(ResolutionError::InvalidReference { .. })
        ));
        assert!(matches!(
            parse_reference_expression("steps.0.output"),
            Err(ResolutionError::InvalidReference { .. })
        ));
        assert!(matches!(
            parse_reference_expression("trigger..x"),
            Err(ResolutionError::InvalidReference { .. })
        ));
    }
}
