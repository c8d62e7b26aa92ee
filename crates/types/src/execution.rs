//! Run records and per-attempt log rows emitted by the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

/// How a run was started.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunSource {
    #[default]
    Manual,
    Webhook,
    Schedule,
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
}

impl ExecutionStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Success | Self::Failed => 2,
        }
    }
}

/// Machine-readable classification of a failed run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorCode {
    Configuration,
    Credential,
    Resolution,
    Provider,
    Cancelled,
}

/// Rejected status change.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("execution cannot move from {from:?} to {to:?}")]
pub struct InvalidTransition {
    pub from: ExecutionStatus,
    pub to: ExecutionStatus,
}

/// One concrete run of a plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Execution {
    pub id: Uuid,
    pub plan_id: String,
    pub user_id: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub source: RunSource,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_code: Option<ExecutionErrorCode>,
}

impl Execution {
    /// Create a `pending` run for the given plan and owner.
    pub fn pending(plan_id: impl Into<String>, user_id: impl Into<String>, source: RunSource) -> Self {
        Self {
            id: Uuid::new_v4(),
            plan_id: plan_id.into(),
            user_id: user_id.into(),
            status: ExecutionStatus::Pending,
            source,
            started_at: None,
            finished_at: None,
            error_message: None,
            error_code: None,
        }
    }

    /// Move to `next`, rejecting resurrection from a terminal status and backwards moves.
    pub fn transition(&mut self, next: ExecutionStatus) -> Result<(), InvalidTransition> {
        if self.status.is_terminal() || next.rank() <= self.status.rank() {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Wall-clock duration for finished runs.
    pub fn duration_ms(&self) -> Option<i64> {
        let started = self.started_at?;
        let finished = self.finished_at?;
        Some((finished - started).num_milliseconds())
    }
}

/// Outcome recorded for a single step attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Success,
    Error,
    Retrying,
    Timeout,
    Skipped,
}

/// Append-only row describing one step attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionLog {
    pub execution_id: Uuid,
    pub step_number: u32,
    /// 1-based attempt number; zero for rows written without invoking a provider.
    #[serde(default)]
    pub attempt: u32,
    pub provider: String,
    pub action: String,
    pub status: LogStatus,
    pub latency_ms: u64,
    #[serde(default)]
    pub output_preview: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate run statistics for one user.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionStats {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Percentage of finished runs that succeeded, 0.0 when nothing finished.
    pub success_rate: f64,
    /// Mean duration of finished runs in milliseconds.
    pub average_duration_ms: Option<f64>,
}

impl ExecutionStats {
    /// Compute statistics over a user's runs.
    pub fn from_executions<'a>(executions: impl IntoIterator<Item = &'a Execution>) -> Self {
        let mut stats = Self::default();
        let mut total_duration = 0i64;
        let mut timed = 0u64;
        for execution in executions {
            stats.total += 1;
            match execution.status {
                ExecutionStatus::Success => stats.succeeded += 1,
                ExecutionStatus::Failed => stats.failed += 1,
                _ => {}
            }
            if let Some(duration) = execution.duration_ms() {
                total_duration += duration;
                timed += 1;
            }
        }
        let finished = stats.succeeded + stats.failed;
        if finished > 0 {
            stats.success_rate = stats.succeeded as f64 * 100.0 / finished as f64;
        }
        if timed > 0 {
            stats.average_duration_ms = Some(total_duration as f64 / timed as f64);
        }
        stats
    }
}

/// Snapshot of a step result kept in the run context.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub output: JsonValue,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, JsonValue>,
}
