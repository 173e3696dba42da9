//! Structured run report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::execution::{ExecutionResult, Usage};
use crate::core::task::{ExecutionId, TaskId};

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every task passed.
    Succeeded,
    /// At least one task failed; later batches were not started.
    Failed,
    /// The cancellation scope fired.
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What happened to one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded { result: Box<ExecutionResult> },
    Failed { result: Box<ExecutionResult> },
    /// A dependency batch failed first.
    NotStarted,
    /// The run was cancelled before this task finished.
    Cancelled,
    /// The engine hit an internal error while running this task.
    Aborted { error: String },
}

impl TaskOutcome {
    pub fn from_result(result: ExecutionResult) -> Self {
        if result.is_success() {
            TaskOutcome::Succeeded {
                result: Box::new(result),
            }
        } else {
            TaskOutcome::Failed {
                result: Box::new(result),
            }
        }
    }

    pub fn result(&self) -> Option<&ExecutionResult> {
        match self {
            TaskOutcome::Succeeded { result } | TaskOutcome::Failed { result } => Some(result),
            TaskOutcome::NotStarted | TaskOutcome::Cancelled | TaskOutcome::Aborted { .. } => {
                None
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TaskOutcome::Succeeded { .. } => "succeeded",
            TaskOutcome::Failed { .. } => "failed",
            TaskOutcome::NotStarted => "not_started",
            TaskOutcome::Cancelled => "cancelled",
            TaskOutcome::Aborted { .. } => "aborted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(flatten)]
    pub outcome: TaskOutcome,
}

/// Final report of one run. Tasks are listed in input order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub execution_id: ExecutionId,
    pub status: RunStatus,
    /// Batch plan as task ids, in execution order.
    pub batches: Vec<Vec<TaskId>>,
    pub tasks: Vec<TaskReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn outcome(&self, task_id: &TaskId) -> Option<&TaskOutcome> {
        self.tasks
            .iter()
            .find(|t| &t.task_id == task_id)
            .map(|t| &t.outcome)
    }

    /// Ids whose outcome has the given label, in input order.
    pub fn ids_with(&self, label: &str) -> Vec<&TaskId> {
        self.tasks
            .iter()
            .filter(|t| t.outcome.label() == label)
            .map(|t| &t.task_id)
            .collect()
    }

    /// Usage summed over every finished task.
    pub fn total_usage(&self) -> Usage {
        self.tasks
            .iter()
            .filter_map(|t| t.outcome.result())
            .fold(Usage::default(), |mut total, r| {
                total.worker_invocations += r.usage.worker_invocations;
                total.qc_invocations += r.usage.qc_invocations;
                total.tool_calls += r.usage.tool_calls;
                total.estimated_tokens += r.usage.estimated_tokens;
                total.requests += r.usage.requests;
                total
            })
    }

    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }
}
