//! Handing triggered plans to the execution engine.

use std::sync::Arc;

use async_trait::async_trait;
use autoflow_engine::{EngineError, ExecutionEngine, PlanRepository};
use autoflow_types::RunSource;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

/// Receipt for a dispatched run. The run itself continues in the background.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchTicket {
    pub execution_id: Uuid,
    pub plan_id: String,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("plan '{0}' not found")]
    PlanNotFound(String),

    #[error("plan '{plan_id}' cannot run: {reason}")]
    NotRunnable { plan_id: String, reason: String },

    #[error(transparent)]
    Engine(EngineError),
}

impl DispatchError {
    /// Whether the plan itself is the problem, as opposed to the engine.
    pub fn is_plan_rejection(&self) -> bool {
        matches!(self, DispatchError::PlanNotFound(_) | DispatchError::NotRunnable { .. })
    }
}

impl From<EngineError> for DispatchError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::NotRunnable { plan_id, reason } => DispatchError::NotRunnable { plan_id, reason },
            other => DispatchError::Engine(other),
        }
    }
}

/// Starts a run of a stored plan.
#[async_trait]
pub trait RunDispatcher: Send + Sync {
    async fn dispatch(&self, plan_id: &str, trigger: Value, source: RunSource) -> Result<DispatchTicket, DispatchError>;
}

/// [`RunDispatcher`] backed by an [`ExecutionEngine`] and a plan repository.
#[derive(Clone)]
pub struct EngineDispatcher {
    engine: ExecutionEngine,
    plans: Arc<dyn PlanRepository>,
}

impl EngineDispatcher {
    pub fn new(engine: ExecutionEngine, plans: Arc<dyn PlanRepository>) -> Self {
        Self { engine, plans }
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }
}

#[async_trait]
impl RunDispatcher for EngineDispatcher {
    async fn dispatch(&self, plan_id: &str, trigger: Value, source: RunSource) -> Result<DispatchTicket, DispatchError> {
        let plan = self
            .plans
            .plan(plan_id)
            .ok_or_else(|| DispatchError::PlanNotFound(plan_id.to_string()))?;
        let handle = self.engine.spawn(plan, trigger, source).await?;
        let execution_id = handle.execution_id;
        info!(plan_id = %plan_id, execution_id = %execution_id, source = ?source, "triggered run dispatched");

        tokio::spawn(async move {
            if let Err(run_error) = handle.wait().await {
                error!(execution_id = %execution_id, error = %run_error, "triggered run aborted");
            }
        });

        Ok(DispatchTicket {
            execution_id,
            plan_id: plan_id.to_string(),
        })
    }
}
