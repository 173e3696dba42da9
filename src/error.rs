use thiserror::Error;

use crate::core::task::{TaskId, TaskState};

/// Reasons a task set is rejected before any task starts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Task set is empty")]
    Empty,

    #[error("Duplicate task id: {0}")]
    DuplicateTask(TaskId),

    #[error("Task {0} depends on itself")]
    SelfDependency(TaskId),

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("Task {task} is missing required field '{field}'")]
    MissingField { task: TaskId, field: &'static str },

    #[error("Circular or unresolvable dependency among tasks: {}", join_ids(.ids))]
    CircularDependency { ids: Vec<TaskId> },
}

impl ValidationError {
    /// Task ids this error is about.
    pub fn task_ids(&self) -> Vec<&TaskId> {
        match self {
            ValidationError::Empty => Vec::new(),
            ValidationError::DuplicateTask(id) | ValidationError::SelfDependency(id) => vec![id],
            ValidationError::UnknownDependency { task, .. }
            | ValidationError::MissingField { task, .. } => vec![task],
            ValidationError::CircularDependency { ids } => ids.iter().collect(),
        }
    }
}

fn join_ids(ids: &[TaskId]) -> String {
    ids.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution {execution_id} cancelled: {reason}")]
    Cancelled {
        execution_id: String,
        reason: String,
    },

    #[error("Agent binary not found: {0}")]
    AgentBinaryNotFound(String),

    #[error("Agent invocation failed ({role}): {message}")]
    Invocation { role: String, message: String },

    #[error("Invalid rate limit {0}: use -1 for unlimited or a positive requests-per-hour value")]
    InvalidRateLimit(i64),

    #[error("State store error: {0}")]
    Store(String),

    #[error("Unsupported task file format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid task state transition for {task}: {from} -> {to}")]
    InvalidTransition {
        task: TaskId,
        from: TaskState,
        to: TaskState,
    },
}

impl Error {
    /// Whether this error is a run-level cancellation that must never be retried.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
