//! Inbound webhook dispatch.

use std::sync::Arc;

use autoflow_types::{RunSource, normalize_webhook_path};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::dispatch::{DispatchError, DispatchTicket, RunDispatcher};
use crate::store::{JobStore, JobStoreError};

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("no webhook registered at '/{0}'")]
    NotFound(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Resolves webhook paths to plans and dispatches them.
#[derive(Clone)]
pub struct WebhookRouter {
    store: Arc<dyn JobStore>,
    dispatcher: Arc<dyn RunDispatcher>,
}

impl WebhookRouter {
    pub fn new(store: Arc<dyn JobStore>, dispatcher: Arc<dyn RunDispatcher>) -> Self {
        Self { store, dispatcher }
    }

    /// Dispatch the plan bound to `path` with `payload` as its trigger input.
    pub async fn handle(&self, path: &str, payload: Value) -> Result<DispatchTicket, WebhookError> {
        let path = normalize_webhook_path(path);
        let Some(job) = self.store.job_for_webhook(&path).await? else {
            warn!(path = %path, "webhook request for unknown path");
            return Err(WebhookError::NotFound(path));
        };
        let ticket = self.dispatcher.dispatch(&job.plan_id, payload, RunSource::Webhook).await?;
        info!(path = %path, plan_id = %job.plan_id, execution_id = %ticket.execution_id, "webhook accepted");
        Ok(ticket)
    }
}
