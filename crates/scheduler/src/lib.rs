//! Trigger layer for autoflow plans.
//!
//! Two trigger kinds start runs without a human in the loop:
//!
//! - **Schedule**: [`ScheduledJob`](autoflow_types::ScheduledJob) rows with a
//!   cron expression and time zone. A [`Scheduler`] sweeps the [`JobStore`]
//!   on an interval, claims each due job with a compare-and-swap on
//!   `next_run_at`, and hands the plan to a [`RunDispatcher`].
//! - **Webhook**: a registered path. [`WebhookRouter`] maps an inbound
//!   request to its plan and dispatches it with the request body as trigger
//!   input; [`WebhookServer`] exposes the router over HTTP.
//!
//! [`sync_plan_trigger`] keeps the job table aligned with a plan's trigger,
//! `status` and `enabled` flag.

mod cron;
mod dispatch;
mod http;
mod scheduler;
pub mod store;
mod webhook;

pub use cron::{CronSchedule, ScheduleError};
pub use dispatch::{DispatchError, DispatchTicket, EngineDispatcher, RunDispatcher};
pub use http::{RunningWebhookServer, WebhookServer};
pub use scheduler::{RunningScheduler, Scheduler, SchedulerDiagnostic, SweepReport, sync_plan_trigger};
pub use store::{FileJobStore, JobStore, JobStoreError, MemoryJobStore};
pub use webhook::{WebhookError, WebhookRouter};
