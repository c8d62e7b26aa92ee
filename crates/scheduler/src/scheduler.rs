//! Cron sweep lifecycle and trigger synchronisation.

use std::sync::Arc;

use autoflow_types::{ExecutionPlan, JobTrigger, PlanTrigger, RunSource, ScheduledJob, normalize_webhook_path};
use autoflow_util::SchedulerSettings;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cron::{CronSchedule, ScheduleError};
use crate::dispatch::{DispatchTicket, RunDispatcher};
use crate::store::JobStore;

/// Align the job table with `plan`'s trigger.
///
/// Runnable plans (`approved` and `enabled`) get an active schedule or webhook
/// job. Plans that are not runnable have their job deactivated; plans with a
/// manual trigger have their job removed. An unchanged, still-active cron job
/// keeps its `next_run_at` so an overdue occurrence survives a restart.
pub async fn sync_plan_trigger(
    store: &dyn JobStore,
    plan: &ExecutionPlan,
    now: DateTime<Utc>,
) -> Result<Option<ScheduledJob>, ScheduleError> {
    let existing = store.job_for_plan(&plan.id).await?;

    let trigger = match &plan.trigger {
        PlanTrigger::Manual => {
            if store.remove(&plan.id).await? {
                info!(plan_id = %plan.id, "removed trigger for manual plan");
            }
            return Ok(None);
        }
        _ if !plan.is_runnable() => {
            if store.deactivate(&plan.id).await? {
                info!(plan_id = %plan.id, enabled = plan.enabled, status = ?plan.status, "deactivated trigger");
            }
            return Ok(None);
        }
        PlanTrigger::Schedule { cron, timezone } => JobTrigger::Cron {
            expression: cron.trim().to_string(),
            timezone: timezone.trim().to_string(),
        },
        PlanTrigger::Webhook { path } => {
            let path = normalize_webhook_path(path);
            if let Some(bound) = store.job_for_webhook(&path).await?
                && bound.plan_id != plan.id
            {
                return Err(ScheduleError::WebhookPathConflict {
                    path,
                    plan_id: bound.plan_id,
                });
            }
            JobTrigger::Webhook { path }
        }
    };

    let next_run_at = match &trigger {
        JobTrigger::Cron { expression, timezone } => {
            let carried = existing
                .as_ref()
                .filter(|job| job.is_active && job.trigger == trigger)
                .and_then(|job| job.next_run_at);
            match carried {
                Some(next) => Some(next),
                None => Some(CronSchedule::parse(expression, timezone)?.next_after(now)?),
            }
        }
        JobTrigger::Webhook { .. } => None,
    };

    let job = ScheduledJob {
        id: existing.as_ref().map(|job| job.id).unwrap_or_else(Uuid::new_v4),
        plan_id: plan.id.clone(),
        user_id: plan.user_id.clone(),
        trigger,
        next_run_at,
        last_run_at: existing.and_then(|job| job.last_run_at),
        is_active: true,
    };
    store.upsert(job.clone()).await?;
    debug!(plan_id = %plan.id, job_id = %job.id, next_run_at = ?job.next_run_at, "synchronised trigger");
    Ok(Some(job))
}

/// Sweep outcome that did not produce a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchedulerDiagnostic {
    /// The plan could not run; its job was deactivated.
    MissedRun {
        job_id: Uuid,
        plan_id: String,
        scheduled_for: DateTime<Utc>,
        reason: String,
    },
    /// The engine failed to accept the run.
    DispatchFailed {
        job_id: Uuid,
        plan_id: String,
        scheduled_for: DateTime<Utc>,
        error: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub dispatched: Vec<DispatchTicket>,
    pub diagnostics: Vec<SchedulerDiagnostic>,
}

/// Periodic cron sweeper.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    dispatcher: Arc<dyn RunDispatcher>,
    settings: SchedulerSettings,
    holder: String,
}

impl Scheduler {
    pub fn new(store: Arc<dyn JobStore>, dispatcher: Arc<dyn RunDispatcher>, settings: SchedulerSettings) -> Self {
        Self {
            store,
            dispatcher,
            settings,
            holder: format!("scheduler-{}", Uuid::new_v4()),
        }
    }

    /// Lease holder name of this instance.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Load active jobs and start sweeping. The first sweep runs immediately.
    pub async fn start(self) -> Result<RunningScheduler, ScheduleError> {
        let active = self.store.active_jobs().await?;
        let overdue = active.iter().filter(|job| job.is_due(Utc::now())).count();
        info!(
            holder = %self.holder,
            active_jobs = active.len(),
            overdue_jobs = overdue,
            interval_secs = self.settings.sweep_interval().as_secs(),
            "scheduler starting"
        );

        let cancellation_token = CancellationToken::new();
        let scheduler = Arc::new(self);
        let sweep_handle = tokio::spawn(sweep_loop(Arc::clone(&scheduler), cancellation_token.child_token()));
        Ok(RunningScheduler {
            scheduler,
            cancellation_token,
            sweep_handle,
        })
    }

    /// Sweep once if this instance holds the lease.
    pub async fn tick(&self, now: DateTime<Utc>) -> Option<SweepReport> {
        match self.store.acquire_lease(&self.holder, self.settings.lease_ttl(), now).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(holder = %self.holder, "sweep skipped; lease held elsewhere");
                return None;
            }
            Err(lease_error) => {
                error!(holder = %self.holder, error = %lease_error, "failed to acquire sweeper lease");
                return None;
            }
        }
        match self.sweep(now).await {
            Ok(report) => {
                if !report.dispatched.is_empty() || !report.diagnostics.is_empty() {
                    info!(
                        dispatched = report.dispatched.len(),
                        diagnostics = report.diagnostics.len(),
                        "sweep finished"
                    );
                }
                Some(report)
            }
            Err(sweep_error) => {
                error!(error = %sweep_error, "sweep failed");
                None
            }
        }
    }

    /// Dispatch every active cron job due at `now`.
    ///
    /// Each job is claimed before dispatch, so a failed dispatch is reported
    /// rather than retried on the next sweep.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, ScheduleError> {
        let mut report = SweepReport::default();

        for job in self.store.active_jobs().await? {
            if !job.is_due(now) {
                continue;
            }
            let (JobTrigger::Cron { expression, timezone }, Some(scheduled_for)) = (&job.trigger, job.next_run_at) else {
                continue;
            };

            let next = match CronSchedule::parse(expression, timezone).and_then(|schedule| schedule.next_after(now)) {
                Ok(next) => next,
                Err(schedule_error) => {
                    warn!(job_id = %job.id, plan_id = %job.plan_id, error = %schedule_error, "deactivating job with unusable schedule");
                    self.store.deactivate(&job.plan_id).await?;
                    report.diagnostics.push(SchedulerDiagnostic::MissedRun {
                        job_id: job.id,
                        plan_id: job.plan_id.clone(),
                        scheduled_for,
                        reason: schedule_error.to_string(),
                    });
                    continue;
                }
            };

            if !self.store.claim(job.id, scheduled_for, next, now).await? {
                debug!(job_id = %job.id, "job already claimed by another sweeper");
                continue;
            }

            let trigger = json!({
                "job_id": job.id,
                "scheduled_for": scheduled_for,
            });
            match self.dispatcher.dispatch(&job.plan_id, trigger, RunSource::Schedule).await {
                Ok(ticket) => {
                    debug!(job_id = %job.id, execution_id = %ticket.execution_id, next_run_at = %next, "scheduled run dispatched");
                    report.dispatched.push(ticket);
                }
                Err(dispatch_error) if dispatch_error.is_plan_rejection() => {
                    warn!(job_id = %job.id, plan_id = %job.plan_id, error = %dispatch_error, "missed scheduled run");
                    self.store.deactivate(&job.plan_id).await?;
                    report.diagnostics.push(SchedulerDiagnostic::MissedRun {
                        job_id: job.id,
                        plan_id: job.plan_id.clone(),
                        scheduled_for,
                        reason: dispatch_error.to_string(),
                    });
                }
                Err(dispatch_error) => {
                    error!(job_id = %job.id, plan_id = %job.plan_id, error = %dispatch_error, "scheduled dispatch failed");
                    report.diagnostics.push(SchedulerDiagnostic::DispatchFailed {
                        job_id: job.id,
                        plan_id: job.plan_id.clone(),
                        scheduled_for,
                        error: dispatch_error.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }
}

async fn sweep_loop(scheduler: Arc<Scheduler>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(scheduler.settings.sweep_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                scheduler.tick(Utc::now()).await;
            }
        }
    }
    if let Err(release_error) = scheduler.store.release_lease(&scheduler.holder).await {
        warn!(holder = %scheduler.holder, error = %release_error, "failed to release sweeper lease");
    }
    info!(holder = %scheduler.holder, "scheduler stopped");
}

/// Handle for a started [`Scheduler`].
pub struct RunningScheduler {
    scheduler: Arc<Scheduler>,
    cancellation_token: CancellationToken,
    sweep_handle: JoinHandle<()>,
}

impl RunningScheduler {
    pub fn holder(&self) -> &str {
        self.scheduler.holder()
    }

    /// Stop sweeping, release the lease and wait for the loop to exit.
    pub async fn stop(self) -> anyhow::Result<()> {
        self.cancellation_token.cancel();
        self.sweep_handle
            .await
            .map_err(|join_error| anyhow::anyhow!("scheduler task failed: {join_error}"))
    }
}
