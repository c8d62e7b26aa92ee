//! Structural plan validation.
//!
//! These checks run before any step executes so a malformed plan fails as a
//! configuration error without touching providers.

use thiserror::Error;

use super::{ExecutionPlan, PlanStep, StepKind};

/// Structural problem detected in a plan.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlanValidationError {
    #[error("plan has no steps")]
    Empty,
    #[error("step orders must form a dense 1..{expected_len} sequence; found {found} at position {position}")]
    NonDenseOrder { position: usize, found: u32, expected_len: usize },
    #[error("step {order}: {reason}")]
    InvalidStep { order: u32, reason: String },
}

/// Validate a plan's structure.
///
/// Checks that:
/// - orders appear as `1..N` in ascending sequence with no gaps or duplicates;
/// - action steps name a provider and an action;
/// - condition steps carry an expression and guard only steps inside the plan;
/// - loop steps declare `items` and are followed by an action step to repeat.
pub fn validate_plan(plan: &ExecutionPlan) -> Result<(), PlanValidationError> {
    if plan.steps.is_empty() {
        return Err(PlanValidationError::Empty);
    }

    for (position, step) in plan.steps.iter().enumerate() {
        let expected = position as u32 + 1;
        if step.order != expected {
            return Err(PlanValidationError::NonDenseOrder {
                position: position + 1,
                found: step.order,
                expected_len: plan.steps.len(),
            });
        }
    }

    for (position, step) in plan.steps.iter().enumerate() {
        validate_step(step, plan.steps.get(position + 1), plan.steps.len())?;
    }
    Ok(())
}

fn validate_step(step: &PlanStep, successor: Option<&PlanStep>, step_count: usize) -> Result<(), PlanValidationError> {
    let invalid = |reason: &str| PlanValidationError::InvalidStep {
        order: step.order,
        reason: reason.to_string(),
    };

    match step.kind {
        StepKind::Action => {
            if step.provider.trim().is_empty() {
                return Err(invalid("action step is missing a provider"));
            }
            if step.action.trim().is_empty() {
                return Err(invalid("action step is missing an action"));
            }
        }
        StepKind::Condition => {
            let expression = step.condition_expression().unwrap_or_default();
            if expression.trim().is_empty() {
                return Err(invalid("condition step requires a string 'expression' parameter"));
            }
            let span = step.guarded_span();
            if span == 0 {
                return Err(invalid("condition must guard at least one step"));
            }
            if step.order as usize + span as usize > step_count {
                return Err(invalid("condition guards steps beyond the end of the plan"));
            }
        }
        StepKind::Loop => {
            if step.loop_items().is_none() {
                return Err(invalid("loop step requires an 'items' parameter"));
            }
            match successor {
                Some(body) if body.kind == StepKind::Action => {}
                Some(_) => return Err(invalid("loop body must be an action step")),
                None => return Err(invalid("loop step has no following step to repeat")),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan(steps: serde_json::Value) -> ExecutionPlan {
        serde_json::from_value(json!({"id": "p", "user_id": "u", "status": "approved", "steps": steps})).expect("plan")
    }

    #[test]
    fn accepts_dense_action_plan() {
        let plan = plan(json!([
            {"order": 1, "provider": "http", "action": "get"},
            {"order": 2, "provider": "http", "action": "post"}
        ]));
        assert_eq!(validate_plan(&plan), Ok(()));
    }

    #[test]
    fn rejects_gaps_in_order() {
        let plan = plan(json!([
            {"order": 1, "provider": "http", "action": "get"},
            {"order": 3, "provider": "http", "action": "post"}
        ]));
        assert!(matches!(
            validate_plan(&plan),
            Err(PlanValidationError::NonDenseOrder { position: 2, found: 3, .. })
        ));
    }

    #[test]
    fn rejects_condition_guarding_past_the_end() {
        let plan = plan(json!([
            {"order": 1, "type": "condition", "params": {"expression": "true", "guards": 2}},
            {"order": 2, "provider": "http", "action": "post"}
        ]));
        assert!(matches!(validate_plan(&plan), Err(PlanValidationError::InvalidStep { order: 1, .. })));
    }

    #[test]
    fn rejects_trailing_loop() {
        let plan = plan(json!([
            {"order": 1, "provider": "http", "action": "get"},
            {"order": 2, "type": "loop", "params": {"items": [1, 2]}}
        ]));
        assert!(matches!(validate_plan(&plan), Err(PlanValidationError::InvalidStep { order: 2, .. })));
    }

    #[test]
    fn rejects_empty_plan() {
        assert_eq!(validate_plan(&plan(json!([]))), Err(PlanValidationError::Empty));
    }
}
