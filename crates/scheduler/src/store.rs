//! Durable job table and the sweeper lease.
//!
//! Every mutation of `next_run_at` goes through [`JobStore::claim`], a
//! compare-and-swap on the value the sweeper observed. Two sweepers that see
//! the same due job therefore dispatch it once.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use autoflow_types::{JobTrigger, ScheduledJob, normalize_webhook_path};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("job store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("job store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("job store worker failed: {0}")]
    Worker(String),
}

/// Persistence for scheduled jobs. One job per plan.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Every stored job, active or not.
    async fn jobs(&self) -> Result<Vec<ScheduledJob>, JobStoreError>;

    async fn active_jobs(&self) -> Result<Vec<ScheduledJob>, JobStoreError> {
        Ok(self.jobs().await?.into_iter().filter(|job| job.is_active).collect())
    }

    async fn job_for_plan(&self, plan_id: &str) -> Result<Option<ScheduledJob>, JobStoreError> {
        Ok(self.jobs().await?.into_iter().find(|job| job.plan_id == plan_id))
    }

    /// Active webhook job bound to `path`, compared after normalization.
    async fn job_for_webhook(&self, path: &str) -> Result<Option<ScheduledJob>, JobStoreError> {
        let wanted = normalize_webhook_path(path);
        Ok(self
            .active_jobs()
            .await?
            .into_iter()
            .find(|job| job.webhook_path().is_some_and(|bound| normalize_webhook_path(bound) == wanted)))
    }

    /// Insert or replace the job of `job.plan_id`.
    async fn upsert(&self, job: ScheduledJob) -> Result<(), JobStoreError>;

    /// Mark the plan's job inactive. Returns false when there was no active job.
    async fn deactivate(&self, plan_id: &str) -> Result<bool, JobStoreError>;

    /// Delete the plan's job. Returns false when there was none.
    async fn remove(&self, plan_id: &str) -> Result<bool, JobStoreError>;

    /// Advance `next_run_at` from `expected_next` to `new_next`, stamping
    /// `last_run_at = now`. Returns false when the job is gone, inactive, or
    /// another sweeper already moved it.
    async fn claim(
        &self,
        job_id: Uuid,
        expected_next: DateTime<Utc>,
        new_next: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError>;

    /// Take or renew the sweeper lease. Returns false while another holder's
    /// lease is unexpired.
    async fn acquire_lease(&self, holder: &str, ttl: Duration, now: DateTime<Utc>) -> Result<bool, JobStoreError>;

    async fn release_lease(&self, holder: &str) -> Result<(), JobStoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct Lease {
    holder: String,
    expires_at: DateTime<Utc>,
}

/// Serialized job table shared by both store implementations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct JobTable {
    #[serde(default)]
    jobs: Vec<ScheduledJob>,
    #[serde(default)]
    lease: Option<Lease>,
}

impl JobTable {
    fn upsert(&mut self, job: ScheduledJob) {
        match self.jobs.iter_mut().find(|existing| existing.plan_id == job.plan_id) {
            Some(existing) => *existing = job,
            None => self.jobs.push(job),
        }
    }

    fn deactivate(&mut self, plan_id: &str) -> bool {
        match self.jobs.iter_mut().find(|job| job.plan_id == plan_id && job.is_active) {
            Some(job) => {
                job.is_active = false;
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, plan_id: &str) -> bool {
        let before = self.jobs.len();
        self.jobs.retain(|job| job.plan_id != plan_id);
        self.jobs.len() != before
    }

    fn claim(&mut self, job_id: Uuid, expected_next: DateTime<Utc>, new_next: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let Some(job) = self.jobs.iter_mut().find(|job| job.id == job_id) else {
            return false;
        };
        if !job.is_active || !matches!(job.trigger, JobTrigger::Cron { .. }) || job.next_run_at != Some(expected_next) {
            return false;
        }
        job.next_run_at = Some(new_next);
        job.last_run_at = Some(now);
        true
    }

    fn acquire_lease(&mut self, holder: &str, ttl: Duration, now: DateTime<Utc>) -> bool {
        if let Some(lease) = &self.lease
            && lease.holder != holder
            && lease.expires_at > now
        {
            return false;
        }
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        self.lease = Some(Lease {
            holder: holder.to_string(),
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        });
        true
    }

    fn release_lease(&mut self, holder: &str) {
        if self.lease.as_ref().is_some_and(|lease| lease.holder == holder) {
            self.lease = None;
        }
    }
}

/// Process-local job store.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    table: Mutex<JobTable>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn jobs(&self) -> Result<Vec<ScheduledJob>, JobStoreError> {
        Ok(self.table.lock().jobs.clone())
    }

    async fn upsert(&self, job: ScheduledJob) -> Result<(), JobStoreError> {
        self.table.lock().upsert(job);
        Ok(())
    }

    async fn deactivate(&self, plan_id: &str) -> Result<bool, JobStoreError> {
        Ok(self.table.lock().deactivate(plan_id))
    }

    async fn remove(&self, plan_id: &str) -> Result<bool, JobStoreError> {
        Ok(self.table.lock().remove(plan_id))
    }

    async fn claim(
        &self,
        job_id: Uuid,
        expected_next: DateTime<Utc>,
        new_next: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        Ok(self.table.lock().claim(job_id, expected_next, new_next, now))
    }

    async fn acquire_lease(&self, holder: &str, ttl: Duration, now: DateTime<Utc>) -> Result<bool, JobStoreError> {
        Ok(self.table.lock().acquire_lease(holder, ttl, now))
    }

    async fn release_lease(&self, holder: &str) -> Result<(), JobStoreError> {
        self.table.lock().release_lease(holder);
        Ok(())
    }
}

/// JSON file job store.
///
/// Each operation takes an exclusive OS lock on `<path>.lock`, re-reads the
/// file, applies its change and writes it back through a temporary file. Any
/// number of schedulers and processes on one host may share the same path.
/// File work runs on the blocking pool.
#[derive(Debug, Clone)]
pub struct FileJobStore {
    file: JobFile,
}

impl FileJobStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, JobStoreError> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| JobStoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = JobFile {
            lock_path: path.with_extension("json.lock"),
            path,
        };
        {
            let _lock = file.lock(LockMode::Shared)?;
            file.read()?;
        }
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        &self.file.path
    }

    async fn update<T, F>(&self, change: F) -> Result<T, JobStoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut JobTable) -> T + Send + 'static,
    {
        let file = self.file.clone();
        run_blocking(move || {
            let _lock = file.lock(LockMode::Exclusive)?;
            let mut table = file.read()?;
            let outcome = change(&mut table);
            file.write(&table)?;
            Ok(outcome)
        })
        .await
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn jobs(&self) -> Result<Vec<ScheduledJob>, JobStoreError> {
        let file = self.file.clone();
        run_blocking(move || {
            let _lock = file.lock(LockMode::Shared)?;
            Ok(file.read()?.jobs)
        })
        .await
    }

    async fn upsert(&self, job: ScheduledJob) -> Result<(), JobStoreError> {
        self.update(move |table| table.upsert(job)).await
    }

    async fn deactivate(&self, plan_id: &str) -> Result<bool, JobStoreError> {
        let plan_id = plan_id.to_string();
        self.update(move |table| table.deactivate(&plan_id)).await
    }

    async fn remove(&self, plan_id: &str) -> Result<bool, JobStoreError> {
        let plan_id = plan_id.to_string();
        self.update(move |table| table.remove(&plan_id)).await
    }

    async fn claim(
        &self,
        job_id: Uuid,
        expected_next: DateTime<Utc>,
        new_next: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        self.update(move |table| table.claim(job_id, expected_next, new_next, now)).await
    }

    async fn acquire_lease(&self, holder: &str, ttl: Duration, now: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let holder = holder.to_string();
        self.update(move |table| table.acquire_lease(&holder, ttl, now)).await
    }

    async fn release_lease(&self, holder: &str) -> Result<(), JobStoreError> {
        let holder = holder.to_string();
        self.update(move |table| table.release_lease(&holder)).await
    }
}

#[derive(Debug, Clone, Copy)]
enum LockMode {
    Shared,
    Exclusive,
}

/// Paths of the job file and its lock file.
#[derive(Debug, Clone)]
struct JobFile {
    path: PathBuf,
    lock_path: PathBuf,
}

impl JobFile {
    /// Block until the lock is held. Released when the returned handle drops.
    fn lock(&self, mode: LockMode) -> Result<File, JobStoreError> {
        let io_error = |source| JobStoreError::Io {
            path: self.lock_path.clone(),
            source,
        };
        let handle = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(io_error)?;
        match mode {
            LockMode::Shared => handle.lock_shared(),
            LockMode::Exclusive => handle.lock(),
        }
        .map_err(io_error)?;
        Ok(handle)
    }

    fn read(&self) -> Result<JobTable, JobStoreError> {
        match fs::read_to_string(&self.path) {
            Ok(text) if text.trim().is_empty() => Ok(JobTable::default()),
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(error) if error.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "job file not found; starting empty");
                Ok(JobTable::default())
            }
            Err(source) => Err(JobStoreError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn write(&self, table: &JobTable) -> Result<(), JobStoreError> {
        let serialized = serde_json::to_string_pretty(table)?;
        let temporary = self.path.with_extension("json.tmp");
        fs::write(&temporary, serialized).map_err(|source| JobStoreError::Io {
            path: temporary.clone(),
            source,
        })?;
        fs::rename(&temporary, &self.path).map_err(|source| JobStoreError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

async fn run_blocking<T, F>(work: F) -> Result<T, JobStoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, JobStoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|error| JobStoreError::Worker(error.to_string()))?
}
