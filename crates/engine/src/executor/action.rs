//! Action steps: resolve, fetch credentials, invoke with timeout and retries.

use std::time::Duration;

use autoflow_types::{LogStatus, PlanStep, ProviderErrorKind, ProviderResult};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::run::{RunState, failure_row, new_row};
use super::types::{Halt, StepError};
use super::ExecutionEngine;
use crate::credentials::{CredentialStore, Credentials};
use crate::monitor::RunEvent;
use crate::provider::invoke_handler;
use crate::resolve::resolve_params;

impl ExecutionEngine {
    /// Run one action step (or one loop iteration of it) to a terminal outcome.
    ///
    /// Every attempt writes a log row: `retrying` for failures that will be
    /// retried, then a final `success`, `error` or `timeout` row. Failures
    /// before the first attempt write a single `error` row with attempt 0.
    pub(super) async fn execute_action(&self, step: &PlanStep, state: &RunState<'_>) -> Result<ProviderResult, Halt> {
        let execution_id = state.execution_id;
        let provider = step.provider.as_str();
        let action = step.action.as_str();
        self.inner.monitor.emit(RunEvent::StepStarted {
            execution_id,
            step: step.order,
            provider: provider.to_string(),
            action: action.to_string(),
        });
        info!(execution_id = %execution_id, step = step.order, provider = %provider, action = %action, "step execution started");

        let handler = match self.inner.registry.handler(provider) {
            Ok(handler) => handler,
            Err(not_found) => return Err(self.fail_before_attempt(step, state, StepError::Configuration(not_found.to_string())).await),
        };

        let params = match resolve_params(&step.params, &state.context) {
            Ok(params) => params,
            Err(resolution_error) => return Err(self.fail_before_attempt(step, state, resolution_error.into()).await),
        };

        let required = handler.required_credentials(action);
        let credentials = match self.inner.credentials.for_step(state.user_id, provider, &required) {
            Ok(credentials) => credentials,
            Err(credential_error) => return Err(self.fail_before_attempt(step, state, credential_error.into()).await),
        };

        let policy = self.inner.settings.retry.with_overrides(step.on_error.as_ref());
        let timeout = step
            .on_error
            .as_ref()
            .and_then(|policy| policy.timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(self.inner.settings.provider_timeout);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let started = Instant::now();
            let result = match tokio::time::timeout(timeout, invoke_handler(handler.as_ref(), provider, action, &params, &credentials)).await {
                Ok(result) => result,
                Err(_) => ProviderResult::failure(
                    ProviderErrorKind::Timeout,
                    format!("provider '{provider}' did not answer '{action}' within {} ms", timeout.as_millis()),
                ),
            };
            let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            let Some(kind) = result.failure_kind() else {
                let mut row = new_row(execution_id, step, LogStatus::Success);
                row.attempt = attempt;
                row.latency_ms = latency_ms;
                row.output_preview = self.preview(&result.output);
                row.message = Some(result.message.clone()).filter(|message| !message.is_empty());
                self.append_row(row).await?;
                self.inner.monitor.emit(RunEvent::StepFinished {
                    execution_id,
                    step: step.order,
                    status: LogStatus::Success,
                });
                info!(execution_id = %execution_id, step = step.order, attempt, latency_ms, "step execution succeeded");
                return Ok(result);
            };

            let message = result.error_text();
            if policy.should_retry(kind, attempt) {
                let mut row = new_row(execution_id, step, LogStatus::Retrying);
                row.attempt = attempt;
                row.latency_ms = latency_ms;
                row.error = Some(message.clone());
                self.append_row(row).await?;

                let delay = policy.delay_for(attempt);
                warn!(
                    execution_id = %execution_id,
                    step = step.order,
                    attempt,
                    kind = ?kind,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "step attempt failed; retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = state.token.cancelled() => return Err(StepError::Cancelled.into()),
                }
                continue;
            }

            let status = if kind == ProviderErrorKind::Timeout { LogStatus::Timeout } else { LogStatus::Error };
            let mut row = new_row(execution_id, step, status);
            row.attempt = attempt;
            row.latency_ms = latency_ms;
            row.output_preview = self.preview(&result.output);
            row.error = Some(message.clone());
            self.append_row(row).await?;
            self.inner.monitor.emit(RunEvent::StepFinished {
                execution_id,
                step: step.order,
                status,
            });
            warn!(execution_id = %execution_id, step = step.order, attempt, kind = ?kind, "step execution failed");

            if kind == ProviderErrorKind::Authentication {
                invalidate_supplied(self.inner.credentials.as_ref(), state.user_id, provider, &credentials);
            }
            return Err(StepError::Provider {
                kind,
                message,
                attempts: attempt,
            }
            .into());
        }
    }

    async fn fail_before_attempt(&self, step: &PlanStep, state: &RunState<'_>, step_error: StepError) -> Halt {
        warn!(
            execution_id = %state.execution_id,
            step = step.order,
            class = ?step_error.class(),
            error = %step_error,
            "step execution failed before invoking provider"
        );
        if let Err(halt) = self.append_row(failure_row(state.execution_id, step, &step_error)).await {
            return halt;
        }
        self.inner.monitor.emit(RunEvent::StepFinished {
            execution_id: state.execution_id,
            step: step.order,
            status: LogStatus::Error,
        });
        Halt::Failed(step_error)
    }
}

/// Mark every credential handed to a provider that rejected it as invalid.
fn invalidate_supplied(store: &dyn CredentialStore, user_id: &str, provider: &str, credentials: &Credentials) {
    for kind in credentials.kinds() {
        match store.invalidate(user_id, provider, kind) {
            Ok(()) => debug!(provider = %provider, kind = %kind, "credential invalidated after authentication failure"),
            Err(error) => warn!(provider = %provider, kind = %kind, error = %error, "failed to invalidate credential"),
        }
    }
}
