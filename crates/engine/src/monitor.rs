//! Live run events for observers such as the CLI or a UI bridge.
//!
//! Events are best effort: a lagging or absent subscriber never slows a run.

use autoflow_types::{ExecutionStatus, LogStatus};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

const DEFAULT_CAPACITY: usize = 256;

/// Progress notification emitted while a run executes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        execution_id: Uuid,
        plan_id: String,
    },
    StepStarted {
        execution_id: Uuid,
        step: u32,
        provider: String,
        action: String,
    },
    StepAttempt {
        execution_id: Uuid,
        step: u32,
        attempt: u32,
        status: LogStatus,
    },
    StepFinished {
        execution_id: Uuid,
        step: u32,
        status: LogStatus,
    },
    RunFinished {
        execution_id: Uuid,
        status: ExecutionStatus,
        error_message: Option<String>,
    },
}

impl RunEvent {
    pub fn execution_id(&self) -> Uuid {
        match self {
            Self::RunStarted { execution_id, .. }
            | Self::StepStarted { execution_id, .. }
            | Self::StepAttempt { execution_id, .. }
            | Self::StepFinished { execution_id, .. }
            | Self::RunFinished { execution_id, .. } => *execution_id,
        }
    }
}

/// Broadcast hub for [`RunEvent`]s.
#[derive(Debug, Clone)]
pub struct RunMonitor {
    sender: broadcast::Sender<RunEvent>,
}

impl Default for RunMonitor {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl RunMonitor {
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    pub(crate) fn emit(&self, event: RunEvent) {
        // No receivers is fine.
        let _ = self.sender.send(event);
    }
}
