//! Execution plan schema shared by the engine, the scheduler and the CLI.
//!
//! A plan is produced upstream by the planner and is treated as read-only by
//! every consumer in this workspace. Step parameters preserve authoring order
//! (via `IndexMap`) so resolved payloads and logs stay stable across runs.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub mod validation;

pub use validation::{PlanValidationError, validate_plan};

/// Default timezone applied to schedule triggers that omit one.
pub const DEFAULT_TIMEZONE: &str = "UTC";

/// Approved, ordered description of an automation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionPlan {
    /// Stable plan identifier.
    pub id: String,
    /// Owner of the plan. Credentials are always looked up for this user.
    pub user_id: String,
    /// Human-readable name surfaced in logs.
    #[serde(default)]
    pub name: Option<String>,
    /// Lifecycle status; only `approved` plans are runnable.
    #[serde(default)]
    pub status: PlanStatus,
    /// How the plan is started.
    #[serde(default)]
    pub trigger: PlanTrigger,
    /// Disabled plans are never dispatched, whatever their trigger.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Steps executed strictly in ascending `order`.
    #[serde(default)]
    pub steps: Vec<PlanStep>,
}

impl ExecutionPlan {
    /// Returns true when the plan may be dispatched.
    pub fn is_runnable(&self) -> bool {
        self.enabled && self.status == PlanStatus::Approved
    }

    /// Display label used in logs.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }
}

fn default_enabled() -> bool {
    true
}

/// Lifecycle status of a plan.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Draft,
    Approved,
    Rejected,
    Archived,
}

/// Mechanism that starts a run of the plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlanTrigger {
    /// Started on demand by a caller.
    #[default]
    Manual,
    /// Started by an inbound request on the given path.
    Webhook { path: String },
    /// Started by the scheduler sweep.
    Schedule {
        cron: String,
        #[serde(default = "default_timezone")]
        timezone: String,
    },
}

fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}

/// One unit of work within a plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanStep {
    /// 1-based execution position, unique within the plan.
    pub order: u32,
    /// Provider capability key. Unused by condition and loop steps.
    #[serde(default)]
    pub provider: String,
    /// Action invoked on the provider.
    #[serde(default, alias = "action_id")]
    pub action: String,
    /// Parameter values: literals or `${source.selector}` references.
    #[serde(default)]
    pub params: IndexMap<String, JsonValue>,
    /// Control-flow role of the step.
    #[serde(default, rename = "type")]
    pub kind: StepKind,
    /// Optional per-step retry and failure overrides.
    #[serde(default)]
    pub on_error: Option<StepErrorPolicy>,
}

impl PlanStep {
    /// Whether a failure of this step aborts the run.
    pub fn is_required(&self) -> bool {
        !self.on_error.as_ref().is_some_and(|policy| policy.continue_on_failure)
    }

    /// Condition expression for `condition` steps.
    pub fn condition_expression(&self) -> Option<&str> {
        self.params.get("expression").and_then(JsonValue::as_str)
    }

    /// Number of following steps skipped when the condition is false.
    pub fn guarded_span(&self) -> u32 {
        self.params
            .get("guards")
            .and_then(JsonValue::as_u64)
            .map(|span| span as u32)
            .unwrap_or(1)
    }

    /// Declared iteration source for `loop` steps.
    pub fn loop_items(&self) -> Option<&JsonValue> {
        self.params.get("items")
    }
}

/// Control-flow role of a step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    #[default]
    Action,
    Condition,
    Loop,
}

/// Per-step override of the engine's retry policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepErrorPolicy {
    /// Total attempts including the first one.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Delay before the first retry; doubled on each later retry.
    #[serde(default)]
    pub backoff_base_ms: Option<u64>,
    /// Upper bound on a single retry delay.
    #[serde(default)]
    pub backoff_max_ms: Option<u64>,
    /// Per-attempt provider timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// When true the run keeps going after this step fails.
    #[serde(default)]
    pub continue_on_failure: bool,
}
