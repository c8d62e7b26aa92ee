//! Append-only JSON lines recorder.
//!
//! Layout under the root directory:
//! - `executions.jsonl`: one run snapshot per line; the last line for an id wins
//! - `logs/<execution_id>.jsonl`: attempt rows for one run

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use autoflow_types::{Execution, ExecutionLog};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;
use uuid::Uuid;

use super::{ExecutionRecorder, RecorderError};

const EXECUTIONS_FILE: &str = "executions.jsonl";
const LOGS_DIR: &str = "logs";

/// File-backed recorder that never rewrites existing lines.
///
/// Appends to `executions.jsonl` are serialized; log appends only wait on
/// other writers of the same execution's file.
#[derive(Debug)]
pub struct JsonlRecorder {
    root: PathBuf,
    executions_lock: AsyncMutex<()>,
    log_locks: parking_lot::Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl JsonlRecorder {
    /// Create the directory layout under `root` if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, RecorderError> {
        let root = root.into();
        let logs = root.join(LOGS_DIR);
        std::fs::create_dir_all(&logs).map_err(|source| RecorderError::Io { path: logs, source })?;
        Ok(Self {
            root,
            executions_lock: AsyncMutex::new(()),
            log_locks: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn executions_path(&self) -> PathBuf {
        self.root.join(EXECUTIONS_FILE)
    }

    fn log_path(&self, execution_id: Uuid) -> PathBuf {
        self.root.join(LOGS_DIR).join(format!("{execution_id}.jsonl"))
    }

    fn log_lock(&self, execution_id: Uuid) -> Arc<AsyncMutex<()>> {
        self.log_locks.lock().entry(execution_id).or_default().clone()
    }

    /// Forget the execution's lock once no other append holds it.
    fn release_log_lock(&self, execution_id: Uuid, lock: Arc<AsyncMutex<()>>) {
        let mut locks = self.log_locks.lock();
        drop(lock);
        if locks.get(&execution_id).is_some_and(|entry| Arc::strong_count(entry) == 1) {
            locks.remove(&execution_id);
        }
    }

    /// Latest snapshot per id, in first-seen order.
    async fn latest_snapshots(&self) -> Result<Vec<Execution>, RecorderError> {
        let mut order = Vec::new();
        let mut latest: HashMap<Uuid, Execution> = HashMap::new();
        for execution in read_lines::<Execution>(&self.executions_path()).await? {
            if latest.insert(execution.id, execution.clone()).is_none() {
                order.push(execution.id);
            }
        }
        Ok(order.into_iter().filter_map(|id| latest.remove(&id)).collect())
    }
}

#[async_trait]
impl ExecutionRecorder for JsonlRecorder {
    async fn record_execution(&self, execution: &Execution) -> Result<(), RecorderError> {
        let _guard = self.executions_lock.lock().await;
        append_line(&self.executions_path(), execution).await
    }

    async fn append_log(&self, log: &ExecutionLog) -> Result<(), RecorderError> {
        let lock = self.log_lock(log.execution_id);
        let appended = {
            let _guard = lock.lock().await;
            append_line(&self.log_path(log.execution_id), log).await
        };
        self.release_log_lock(log.execution_id, lock);
        appended
    }

    async fn execution(&self, id: Uuid) -> Result<Option<Execution>, RecorderError> {
        Ok(read_lines::<Execution>(&self.executions_path())
            .await?
            .into_iter()
            .rev()
            .find(|execution| execution.id == id))
    }

    async fn logs(&self, execution_id: Uuid) -> Result<Vec<ExecutionLog>, RecorderError> {
        read_lines(&self.log_path(execution_id)).await
    }

    async fn executions_for_user(&self, user_id: &str) -> Result<Vec<Execution>, RecorderError> {
        Ok(self
            .latest_snapshots()
            .await?
            .into_iter()
            .filter(|execution| execution.user_id == user_id)
            .collect())
    }
}

async fn append_line<T: Serialize>(path: &Path, record: &T) -> Result<(), RecorderError> {
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    let io_error = |source| RecorderError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = OpenOptions::new().create(true).append(true).open(path).await.map_err(io_error)?;
    file.write_all(line.as_bytes()).await.map_err(io_error)?;
    file.flush().await.map_err(io_error)
}

/// Read every parseable line; a torn trailing line is skipped with a warning.
async fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, RecorderError> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(RecorderError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let mut records = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            Err(error) => warn!(path = %path.display(), line = index + 1, error = %error, "skipping unreadable record"),
        }
    }
    Ok(records)
}
