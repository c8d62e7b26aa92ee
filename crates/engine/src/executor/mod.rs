//! Execution engine: drives an approved plan step by step.
//!
//! - `ExecutionEngine::run` executes a plan to completion on the caller's task
//! - `ExecutionEngine::spawn` records the pending run and executes it in the background
//! - `ExecutionEngine::cancel` stops a run before its next step, retry or iteration
//!
//! Steps of one run execute strictly in ascending `order`. Separate runs share
//! nothing mutable except the injected stores, so the engine can be cloned
//! freely and driven from many tasks at once.

mod action;
mod retry;
mod run;
mod types;

pub use retry::RetryPolicy;
pub use types::{EngineError, StepError, StepErrorClass};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use autoflow_types::{Execution, ExecutionPlan, RunSource};
use autoflow_util::{DEFAULT_PREVIEW_CHARS, EngineConfig};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::credentials::CredentialStore;
use crate::monitor::RunMonitor;
use crate::provider::ProviderRegistry;
use crate::recorder::ExecutionRecorder;

/// Tunables shared by every run of one engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub retry: RetryPolicy,
    /// Per-attempt provider deadline; a step's `on_error.timeout_ms` overrides it.
    pub provider_timeout: Duration,
    /// Characters kept in `output_preview`.
    pub preview_chars: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            provider_timeout: Duration::from_secs(30),
            preview_chars: DEFAULT_PREVIEW_CHARS,
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            retry: RetryPolicy::from_settings(&config.retry),
            provider_timeout: config.provider_timeout(),
            preview_chars: config.output_preview_chars,
        }
    }
}

struct EngineInner {
    registry: Arc<ProviderRegistry>,
    credentials: Arc<dyn CredentialStore>,
    recorder: Arc<dyn ExecutionRecorder>,
    monitor: RunMonitor,
    settings: EngineSettings,
    active: Mutex<HashMap<Uuid, CancellationToken>>,
}

/// Cloneable handle to the shared engine state.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("providers", &self.inner.registry.providers())
            .field("settings", &self.inner.settings)
            .field("active_runs", &self.inner.active.lock().len())
            .finish()
    }
}

/// Tracked asynchronous run started by [`ExecutionEngine::spawn`].
#[derive(Debug)]
pub struct RunHandle {
    pub execution_id: Uuid,
    join: JoinHandle<Result<Execution, EngineError>>,
}

impl RunHandle {
    /// Wait for the run to finish.
    pub async fn wait(self) -> Result<Execution, EngineError> {
        self.join.await.map_err(|error| EngineError::Join(error.to_string()))?
    }
}

/// A recorded `pending` run plus its cancellation token.
pub(crate) struct PreparedRun {
    execution: Execution,
    token: CancellationToken,
}

impl ExecutionEngine {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        credentials: Arc<dyn CredentialStore>,
        recorder: Arc<dyn ExecutionRecorder>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                registry,
                credentials,
                recorder,
                monitor: RunMonitor::default(),
                settings,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.inner.registry
    }

    pub fn recorder(&self) -> &Arc<dyn ExecutionRecorder> {
        &self.inner.recorder
    }

    pub fn monitor(&self) -> &RunMonitor {
        &self.inner.monitor
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    /// Execute `plan` with `trigger` as input and return the finished run.
    ///
    /// Step failures yield `Ok` with a `failed` execution. `Err` means the
    /// plan was not runnable or the run could not be recorded.
    pub async fn run(&self, plan: &ExecutionPlan, trigger: Value, source: RunSource) -> Result<Execution, EngineError> {
        let prepared = self.prepare(plan, source).await?;
        self.drive(plan, trigger, prepared).await
    }

    /// Record a `pending` run and execute it on a background task.
    pub async fn spawn(&self, plan: ExecutionPlan, trigger: Value, source: RunSource) -> Result<RunHandle, EngineError> {
        let prepared = self.prepare(&plan, source).await?;
        let execution_id = prepared.execution.id;
        let engine = self.clone();
        let join = tokio::spawn(async move { engine.drive(&plan, trigger, prepared).await });
        Ok(RunHandle { execution_id, join })
    }

    /// Request cancellation of an active run. Returns false when the run is unknown or finished.
    pub fn cancel(&self, execution_id: Uuid) -> bool {
        match self.inner.active.lock().get(&execution_id) {
            Some(token) => {
                token.cancel();
                info!(execution_id = %execution_id, "run cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Ids of runs that have been dispatched and not yet finished.
    pub fn active_runs(&self) -> Vec<Uuid> {
        self.inner.active.lock().keys().copied().collect()
    }

    async fn prepare(&self, plan: &ExecutionPlan, source: RunSource) -> Result<PreparedRun, EngineError> {
        if !plan.is_runnable() {
            let reason = if plan.enabled {
                format!("plan status is {:?}, expected Approved", plan.status)
            } else {
                "plan is disabled".to_string()
            };
            warn!(plan_id = %plan.id, reason = %reason, "rejected run dispatch");
            return Err(EngineError::NotRunnable {
                plan_id: plan.id.clone(),
                reason,
            });
        }

        let execution = Execution::pending(&plan.id, &plan.user_id, source);
        self.inner.recorder.record_execution(&execution).await?;
        let token = CancellationToken::new();
        self.inner.active.lock().insert(execution.id, token.clone());
        info!(execution_id = %execution.id, plan_id = %plan.id, source = ?source, "run dispatched");
        Ok(PreparedRun { execution, token })
    }

    async fn drive(&self, plan: &ExecutionPlan, trigger: Value, prepared: PreparedRun) -> Result<Execution, EngineError> {
        let execution_id = prepared.execution.id;
        let outcome = self.execute_run(plan, trigger, prepared).await;
        self.inner.active.lock().remove(&execution_id);
        outcome
    }
}
