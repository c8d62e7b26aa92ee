//! Durable trigger rows owned by the scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Trigger configuration persisted with a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobTrigger {
    Cron { expression: String, timezone: String },
    Webhook { path: String },
}

/// One scheduled or webhook-bound plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduledJob {
    pub id: Uuid,
    pub plan_id: String,
    pub user_id: String,
    pub trigger: JobTrigger,
    /// Next due instant; `None` for webhook jobs.
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl ScheduledJob {
    /// Whether the sweep should dispatch this job at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active && matches!(self.trigger, JobTrigger::Cron { .. }) && self.next_run_at.is_some_and(|next| next <= now)
    }

    /// Webhook path, if this is a webhook job.
    pub fn webhook_path(&self) -> Option<&str> {
        match &self.trigger {
            JobTrigger::Webhook { path } => Some(path.as_str()),
            JobTrigger::Cron { .. } => None,
        }
    }
}

/// Normalize a webhook path so `/a/b/`, `a/b` and `a/b/` share one key.
pub fn normalize_webhook_path(path: &str) -> String {
    path.trim().trim_matches('/').to_string()
}
