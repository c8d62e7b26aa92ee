//! Plan walk: run lifecycle, condition and loop steps, skipped rows.

use autoflow_types::{Execution, ExecutionLog, ExecutionPlan, ExecutionStatus, LogStatus, PlanStep, StepKind, validate_plan};
use autoflow_util::{preview_json, redact_sensitive, truncate_preview};
use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::types::{Halt, StepError};
use super::{EngineError, ExecutionEngine, PreparedRun};
use crate::condition::{eval_condition, validate_condition_expression};
use crate::monitor::RunEvent;
use crate::resolve::{RunContext, resolve_loop_items};

/// Mutable state of one run. Never shared between runs.
pub(super) struct RunState<'a> {
    pub execution_id: Uuid,
    pub user_id: &'a str,
    pub context: RunContext,
    pub token: &'a CancellationToken,
}

impl ExecutionEngine {
    pub(super) async fn execute_run(&self, plan: &ExecutionPlan, trigger: Value, prepared: PreparedRun) -> Result<Execution, EngineError> {
        let PreparedRun { mut execution, token } = prepared;

        advance(&mut execution, ExecutionStatus::Running);
        execution.started_at = Some(Utc::now());
        self.inner.recorder.record_execution(&execution).await?;
        self.inner.monitor.emit(RunEvent::RunStarted {
            execution_id: execution.id,
            plan_id: plan.id.clone(),
        });
        info!(execution_id = %execution.id, plan = %plan.label(), steps = plan.steps.len(), "run started");

        let mut state = RunState {
            execution_id: execution.id,
            user_id: &plan.user_id,
            context: RunContext::new(trigger),
            token: &token,
        };
        let outcome = match preflight(plan) {
            Ok(()) => self.walk_steps(plan, &mut state).await,
            Err(error) => Err(Halt::Failed(error)),
        };

        let internal = match outcome {
            Ok(()) => {
                advance(&mut execution, ExecutionStatus::Success);
                None
            }
            Err(Halt::Failed(step_error)) => {
                advance(&mut execution, ExecutionStatus::Failed);
                execution.error_message = Some(redact_sensitive(&step_error.to_string()));
                execution.error_code = Some(step_error.error_code());
                None
            }
            Err(Halt::Internal(engine_error)) => {
                advance(&mut execution, ExecutionStatus::Failed);
                execution.error_message = Some(redact_sensitive(&engine_error.to_string()));
                Some(engine_error)
            }
        };
        execution.finished_at = Some(Utc::now());

        if let Some(engine_error) = internal {
            // Best effort; the original failure is what the caller must see.
            if let Err(record_error) = self.inner.recorder.record_execution(&execution).await {
                error!(execution_id = %execution.id, error = %record_error, "failed to record aborted run");
            }
            error!(execution_id = %execution.id, error = %engine_error, "run aborted by internal error");
            return Err(engine_error);
        }

        self.inner.recorder.record_execution(&execution).await?;
        self.inner.monitor.emit(RunEvent::RunFinished {
            execution_id: execution.id,
            status: execution.status,
            error_message: execution.error_message.clone(),
        });
        match execution.status {
            ExecutionStatus::Success => info!(execution_id = %execution.id, duration_ms = ?execution.duration_ms(), "run succeeded"),
            _ => warn!(
                execution_id = %execution.id,
                error_code = ?execution.error_code,
                error = %execution.error_message.as_deref().unwrap_or_default(),
                "run failed"
            ),
        }
        Ok(execution)
    }

    async fn walk_steps(&self, plan: &ExecutionPlan, state: &mut RunState<'_>) -> Result<(), Halt> {
        let mut steps: Vec<&PlanStep> = plan.steps.iter().collect();
        steps.sort_by_key(|step| step.order);

        let mut index = 0usize;
        while index < steps.len() {
            if state.token.is_cancelled() {
                info!(execution_id = %state.execution_id, next_step = steps[index].order, "run cancelled before step");
                return Err(StepError::Cancelled.into());
            }

            let step = steps[index];
            match step.kind {
                StepKind::Condition => {
                    if self.evaluate_condition(step, state).await? {
                        index += 1;
                    } else {
                        index = self.skip_guarded(&steps, index, state).await?;
                    }
                }
                StepKind::Loop => {
                    let Some(body) = steps.get(index + 1).copied() else {
                        return Err(StepError::Configuration(format!("loop step {} has no body step", step.order)).into());
                    };
                    self.run_loop(step, body, state).await?;
                    index += 2;
                }
                StepKind::Action => {
                    match self.execute_action(step, state).await {
                        Ok(result) => state.context.record_result(step.order, &result),
                        Err(Halt::Failed(step_error)) if !step.is_required() => {
                            warn!(
                                execution_id = %state.execution_id,
                                step = step.order,
                                error = %step_error,
                                "optional step failed; continuing"
                            );
                            state.context.record_output(step.order, Value::Null);
                        }
                        Err(halt) => return Err(halt),
                    }
                    index += 1;
                }
            }
        }
        Ok(())
    }

    async fn evaluate_condition(&self, step: &PlanStep, state: &mut RunState<'_>) -> Result<bool, Halt> {
        let expression = step.condition_expression().unwrap_or_default();
        match eval_condition(expression, &state.context) {
            Ok(passed) => {
                let mut row = new_row(state.execution_id, step, LogStatus::Success);
                row.output_preview = Some(passed.to_string());
                row.message = Some(format!("condition '{}' evaluated {passed}", redact_sensitive(expression)));
                self.append_row(row).await?;
                state.context.record_output(step.order, Value::Bool(passed));
                info!(execution_id = %state.execution_id, step = step.order, passed, "condition evaluated");
                Ok(passed)
            }
            Err(condition_error) => {
                let step_error = StepError::from(condition_error);
                self.append_row(failure_row(state.execution_id, step, &step_error)).await?;
                Err(step_error.into())
            }
        }
    }

    /// Write `skipped` rows for the steps guarded by the condition at `index`.
    /// Returns the index of the first step after the guarded span.
    async fn skip_guarded(&self, steps: &[&PlanStep], index: usize, state: &RunState<'_>) -> Result<usize, Halt> {
        let condition = steps[index];
        let mut cursor = index + 1;
        let mut remaining = condition.guarded_span();
        while remaining > 0 && cursor < steps.len() {
            // A guarded loop takes its body with it.
            let covered = if steps[cursor].kind == StepKind::Loop { 2 } else { 1 };
            for guarded in steps.iter().skip(cursor).take(covered) {
                let mut row = new_row(state.execution_id, guarded, LogStatus::Skipped);
                row.message = Some(format!("skipped: condition at step {} evaluated false", condition.order));
                self.append_row(row).await?;
                self.inner.monitor.emit(RunEvent::StepFinished {
                    execution_id: state.execution_id,
                    step: guarded.order,
                    status: LogStatus::Skipped,
                });
            }
            cursor += covered;
            remaining -= 1;
        }
        info!(execution_id = %state.execution_id, step = condition.order, skipped_until = cursor, "guarded steps skipped");
        Ok(cursor)
    }

    async fn run_loop(&self, loop_step: &PlanStep, body: &PlanStep, state: &mut RunState<'_>) -> Result<(), Halt> {
        self.inner.monitor.emit(RunEvent::StepStarted {
            execution_id: state.execution_id,
            step: loop_step.order,
            provider: step_provider(loop_step).to_string(),
            action: step_action(loop_step).to_string(),
        });

        let declared = loop_step.loop_items().cloned().unwrap_or(Value::Null);
        let items = match resolve_loop_items(&declared, &state.context) {
            Ok(items) => items,
            Err(resolution_error) => {
                let step_error = StepError::from(resolution_error);
                self.append_row(failure_row(state.execution_id, loop_step, &step_error)).await?;
                return Err(step_error.into());
            }
        };

        let mut row = new_row(state.execution_id, loop_step, LogStatus::Success);
        row.message = Some(format!("iterating {} item(s) with step {}", items.len(), body.order));
        self.append_row(row).await?;
        info!(execution_id = %state.execution_id, step = loop_step.order, items = items.len(), "loop started");

        let mut outputs = Vec::with_capacity(items.len());
        let mut failure = None;
        for (position, item) in items.into_iter().enumerate() {
            if state.token.is_cancelled() {
                return Err(StepError::Cancelled.into());
            }
            state.context.enter_loop_iteration(item, position);
            let outcome = self.execute_action(body, state).await;
            state.context.exit_loop();
            match outcome {
                Ok(result) => outputs.push(result.output),
                Err(Halt::Failed(step_error)) => {
                    warn!(
                        execution_id = %state.execution_id,
                        step = body.order,
                        iteration = position,
                        error = %step_error,
                        "loop iteration failed; aborting loop"
                    );
                    failure = Some(step_error);
                    break;
                }
                Err(internal) => return Err(internal),
            }
        }

        let collected = Value::Array(outputs);
        state.context.record_output(loop_step.order, collected.clone());
        state.context.record_output(body.order, collected);
        self.inner.monitor.emit(RunEvent::StepFinished {
            execution_id: state.execution_id,
            step: loop_step.order,
            status: if failure.is_some() { LogStatus::Error } else { LogStatus::Success },
        });

        match failure {
            Some(step_error) if body.is_required() => Err(step_error.into()),
            _ => Ok(()),
        }
    }

    /// Append a row after redacting and truncating free-text fields.
    pub(super) async fn append_row(&self, mut row: ExecutionLog) -> Result<(), Halt> {
        let limit = self.inner.settings.preview_chars;
        row.output_preview = row.output_preview.map(|preview| truncate_preview(&redact_sensitive(&preview), limit));
        row.error = row.error.map(|text| redact_sensitive(&text));
        self.inner.recorder.append_log(&row).await?;
        self.inner.monitor.emit(RunEvent::StepAttempt {
            execution_id: row.execution_id,
            step: row.step_number,
            attempt: row.attempt,
            status: row.status,
        });
        Ok(())
    }

    pub(super) fn preview(&self, value: &Value) -> Option<String> {
        preview_json(value, self.inner.settings.preview_chars)
    }
}

/// Structural checks that must pass before any step runs.
fn preflight(plan: &ExecutionPlan) -> Result<(), StepError> {
    validate_plan(plan).map_err(|error| StepError::Configuration(error.to_string()))?;
    for step in plan.steps.iter().filter(|step| step.kind == StepKind::Condition) {
        if let Some(expression) = step.condition_expression() {
            validate_condition_expression(expression).map_err(StepError::from)?;
        }
    }
    Ok(())
}

fn advance(execution: &mut Execution, next: ExecutionStatus) {
    if let Err(transition_error) = execution.transition(next) {
        error!(execution_id = %execution.id, error = %transition_error, "ignored invalid run transition");
    }
}

pub(super) fn step_provider(step: &PlanStep) -> &str {
    match (step.kind, step.provider.is_empty()) {
        (StepKind::Condition, true) => "condition",
        (StepKind::Loop, true) => "loop",
        _ => step.provider.as_str(),
    }
}

pub(super) fn step_action(step: &PlanStep) -> &str {
    match (step.kind, step.action.is_empty()) {
        (StepKind::Condition, true) => "evaluate",
        (StepKind::Loop, true) => "iterate",
        _ => step.action.as_str(),
    }
}

pub(super) fn new_row(execution_id: Uuid, step: &PlanStep, status: LogStatus) -> ExecutionLog {
    ExecutionLog {
        execution_id,
        step_number: step.order,
        attempt: 0,
        provider: step_provider(step).to_string(),
        action: step_action(step).to_string(),
        status,
        latency_ms: 0,
        output_preview: None,
        error: None,
        message: None,
        timestamp: Utc::now(),
    }
}

/// `error` row for failures that happen before any provider attempt.
pub(super) fn failure_row(execution_id: Uuid, step: &PlanStep, step_error: &StepError) -> ExecutionLog {
    let mut row = new_row(execution_id, step, LogStatus::Error);
    row.error = Some(step_error.to_string());
    row
}
