//! Durable task state.
//!
//! The state machine saves a [`TaskRecord`] after every transition and the
//! orchestrator saves the final [`RunReport`]. Saves are idempotent per task
//! id: a later save replaces the earlier record.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clog_debug;
use crate::core::execution::{ExecutionAttempt, ExecutionResult};
use crate::core::task::{ExecutionId, TaskId, TaskState};
use crate::error::{Error, Result};
use crate::orchestration::report::RunReport;

/// Snapshot of one task at one transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub execution_id: ExecutionId,
    pub task_id: TaskId,
    pub state: TaskState,
    pub attempts: Vec<ExecutionAttempt>,
    /// Attempt whose worker output is saved while its QC verdict is pending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_progress: Option<ExecutionAttempt>,
    /// Set once the task is terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save_task(&self, record: &TaskRecord) -> Result<()>;
    async fn save_report(&self, report: &RunReport) -> Result<()>;
}

/// In-process store. Keeps the latest record per task plus every state it
/// was saved in.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    records: HashMap<(ExecutionId, TaskId), TaskRecord>,
    transitions: HashMap<(ExecutionId, TaskId), Vec<TaskState>>,
    reports: Vec<RunReport>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task(&self, execution_id: &ExecutionId, task_id: &TaskId) -> Option<TaskRecord> {
        self.lock()
            .records
            .get(&(*execution_id, task_id.clone()))
            .cloned()
    }

    /// States the task was saved in, oldest first.
    pub fn transitions(&self, execution_id: &ExecutionId, task_id: &TaskId) -> Vec<TaskState> {
        self.lock()
            .transitions
            .get(&(*execution_id, task_id.clone()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn task_count(&self) -> usize {
        self.lock().records.len()
    }

    pub fn reports(&self) -> Vec<RunReport> {
        self.lock().reports.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn save_task(&self, record: &TaskRecord) -> Result<()> {
        let key = (record.execution_id, record.task_id.clone());
        let mut inner = self.lock();
        inner
            .transitions
            .entry(key.clone())
            .or_default()
            .push(record.state);
        inner.records.insert(key, record.clone());
        Ok(())
    }

    async fn save_report(&self, report: &RunReport) -> Result<()> {
        let mut inner = self.lock();
        inner
            .reports
            .retain(|r| r.execution_id != report.execution_id);
        inner.reports.push(report.clone());
        Ok(())
    }
}

/// One pretty-printed JSON file per task under `<root>/<execution_id>/tasks/`,
/// plus `<root>/<execution_id>/report.json` for the run.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, execution_id: &ExecutionId) -> PathBuf {
        self.root.join(execution_id.to_string())
    }

    pub fn task_path(&self, execution_id: &ExecutionId, task_id: &TaskId) -> PathBuf {
        self.run_dir(execution_id)
            .join("tasks")
            .join(format!("{}.json", encode_file_stem(task_id.as_str())))
    }

    pub fn report_path(&self, execution_id: &ExecutionId) -> PathBuf {
        self.run_dir(execution_id).join("report.json")
    }

    pub async fn load_task(&self, execution_id: &ExecutionId, task_id: &TaskId) -> Result<TaskRecord> {
        let contents = tokio::fs::read_to_string(self.task_path(execution_id, task_id)).await?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub async fn load_report(&self, execution_id: &ExecutionId) -> Result<RunReport> {
        let contents = tokio::fs::read_to_string(self.report_path(execution_id)).await?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Write via a temp file and rename so readers never see a partial file.
    async fn write_atomic(&self, path: &Path, contents: String) -> Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| Error::Store(format!("no parent directory for {}", path.display())))?;
        tokio::fs::create_dir_all(dir).await?;

        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, contents).await?;
        tokio::fs::rename(&temp_path, path).await?;
        clog_debug!("JsonFileStore: wrote {}", path.display());
        Ok(())
    }
}

/// Task ids are author-supplied. Bytes outside `[A-Za-z0-9_.-]` and a
/// leading `.` are written as `%XX`, so every id maps to its own file
/// inside the run directory.
fn encode_file_stem(id: &str) -> String {
    let mut stem = String::with_capacity(id.len());
    for (i, byte) in id.bytes().enumerate() {
        let keep = byte.is_ascii_alphanumeric()
            || byte == b'-'
            || byte == b'_'
            || (byte == b'.' && i > 0);
        if keep {
            stem.push(char::from(byte));
        } else {
            stem.push('%');
            stem.push_str(&hex::encode_upper([byte]));
        }
    }
    stem
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn save_task(&self, record: &TaskRecord) -> Result<()> {
        let contents = serde_json::to_string_pretty(record)?;
        let path = self.task_path(&record.execution_id, &record.task_id);
        self.write_atomic(&path, contents).await
    }

    async fn save_report(&self, report: &RunReport) -> Result<()> {
        let contents = serde_json::to_string_pretty(report)?;
        let path = self.report_path(&report.execution_id);
        self.write_atomic(&path, contents).await
    }
}
