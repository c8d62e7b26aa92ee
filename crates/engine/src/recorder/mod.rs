//! Execution log sink.
//!
//! The engine is the only writer. Run snapshots are upserted by id; log rows
//! are append-only and kept in the order they were written.

mod jsonl;

pub use jsonl::JsonlRecorder;

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use autoflow_types::{Execution, ExecutionLog, ExecutionStats, ExecutionStatus};
use parking_lot::Mutex;
use thiserror::Error;
use uuid::Uuid;

/// Persistence failure while recording a run.
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("recorder I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("recorder serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Destination for run records and per-attempt log rows.
#[async_trait]
pub trait ExecutionRecorder: Send + Sync {
    /// Insert or replace the snapshot for `execution.id`.
    async fn record_execution(&self, execution: &Execution) -> Result<(), RecorderError>;

    /// Append one attempt row.
    async fn append_log(&self, log: &ExecutionLog) -> Result<(), RecorderError>;

    async fn execution(&self, id: Uuid) -> Result<Option<Execution>, RecorderError>;

    /// Log rows of one run in append order.
    async fn logs(&self, execution_id: Uuid) -> Result<Vec<ExecutionLog>, RecorderError>;

    /// Runs owned by `user_id`, oldest first.
    async fn executions_for_user(&self, user_id: &str) -> Result<Vec<Execution>, RecorderError>;

    async fn failed_executions(&self, user_id: &str) -> Result<Vec<Execution>, RecorderError> {
        Ok(self
            .executions_for_user(user_id)
            .await?
            .into_iter()
            .filter(|execution| execution.status == ExecutionStatus::Failed)
            .collect())
    }

    async fn stats(&self, user_id: &str) -> Result<ExecutionStats, RecorderError> {
        let executions = self.executions_for_user(user_id).await?;
        Ok(ExecutionStats::from_executions(&executions))
    }
}

#[derive(Debug, Default)]
struct MemoryTables {
    /// Insertion order of run ids.
    order: Vec<Uuid>,
    executions: HashMap<Uuid, Execution>,
    logs: HashMap<Uuid, Vec<ExecutionLog>>,
}

/// In-process recorder used by tests and one-shot CLI runs.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    tables: Mutex<MemoryTables>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionRecorder for MemoryRecorder {
    async fn record_execution(&self, execution: &Execution) -> Result<(), RecorderError> {
        let mut tables = self.tables.lock();
        if tables.executions.insert(execution.id, execution.clone()).is_none() {
            tables.order.push(execution.id);
        }
        Ok(())
    }

    async fn append_log(&self, log: &ExecutionLog) -> Result<(), RecorderError> {
        self.tables.lock().logs.entry(log.execution_id).or_default().push(log.clone());
        Ok(())
    }

    async fn execution(&self, id: Uuid) -> Result<Option<Execution>, RecorderError> {
        Ok(self.tables.lock().executions.get(&id).cloned())
    }

    async fn logs(&self, execution_id: Uuid) -> Result<Vec<ExecutionLog>, RecorderError> {
        Ok(self.tables.lock().logs.get(&execution_id).cloned().unwrap_or_default())
    }

    async fn executions_for_user(&self, user_id: &str) -> Result<Vec<Execution>, RecorderError> {
        let tables = self.tables.lock();
        Ok(tables
            .order
            .iter()
            .filter_map(|id| tables.executions.get(id))
            .filter(|execution| execution.user_id == user_id)
            .cloned()
            .collect())
    }
}
