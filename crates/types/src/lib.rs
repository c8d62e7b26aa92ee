//! Shared data model for the autoflow workspace.
//!
//! Plans and steps come from the planner, executions and logs are written by
//! the engine, credentials are owned by the credential store, and scheduled
//! jobs by the scheduler. Everything here is plain serde data.

pub mod credential;
pub mod execution;
pub mod plan;
pub mod provider;
pub mod schedule;

pub use credential::Credential;
pub use execution::{
    Execution, ExecutionErrorCode, ExecutionLog, ExecutionStats, ExecutionStatus, InvalidTransition, LogStatus, RunSource, StepRecord,
};
pub use plan::{
    DEFAULT_TIMEZONE, ExecutionPlan, PlanStatus, PlanStep, PlanTrigger, PlanValidationError, StepErrorPolicy, StepKind, validate_plan,
};
pub use provider::{ProviderErrorKind, ProviderResult};
pub use schedule::{JobTrigger, ScheduledJob, normalize_webhook_path};
