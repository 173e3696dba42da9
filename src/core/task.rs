//! Task data model for the execution DAG.
//!
//! A `TaskDefinition` is the immutable input unit: what to run, who runs it,
//! who verifies it and what it depends on. `TaskState` is the lifecycle a
//! definition moves through while the engine drives it.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Retries granted to a task that does not say otherwise (three attempts total).
pub const DEFAULT_MAX_RETRIES: u32 = 2;

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// Identifier of a task within one task set.
///
/// Ids are author-supplied strings (`"task-1.2"`), unique within a set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for one top-level run.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    /// Create a new unique execution identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ExecutionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A single unit of work handed to the engine.
///
/// Everything except `max_retries` must be supplied explicitly; the engine
/// rejects incomplete definitions instead of filling gaps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Unique identifier within the task set.
    pub id: TaskId,
    /// Short human-readable label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Ids of tasks that must finish before this one starts.
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// Cohort number; tasks in one dependency layer are split by this value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<u32>,
    /// Role the worker invocation runs as.
    pub worker_role: String,
    /// Role the verification invocation runs as. No role means no QC step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qc_role: Option<String>,
    /// Criteria the QC step checks the worker output against.
    #[serde(default)]
    pub verification_criteria: Vec<String>,
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// The prompt handed to the worker on the first attempt.
    pub prompt_body: String,
    /// Caller's estimate of tool calls per worker invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_tool_calls: Option<u32>,
}

impl TaskDefinition {
    /// Create a definition with no dependencies, no QC and default retries.
    pub fn new(id: impl Into<TaskId>, worker_role: &str, prompt_body: &str) -> Self {
        Self {
            id: id.into(),
            title: None,
            dependencies: Vec::new(),
            parallel_group: None,
            worker_role: worker_role.to_string(),
            qc_role: None,
            verification_criteria: Vec::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            prompt_body: prompt_body.to_string(),
            estimated_tool_calls: None,
        }
    }

    pub fn with_dependencies<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_qc(mut self, qc_role: &str, criteria: &[&str]) -> Self {
        self.qc_role = Some(qc_role.to_string());
        self.verification_criteria = criteria.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_parallel_group(mut self, group: u32) -> Self {
        self.parallel_group = Some(group);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_estimated_tool_calls(mut self, estimate: u32) -> Self {
        self.estimated_tool_calls = Some(estimate);
        self
    }

    /// Total attempts this task may take.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Display label: the title when present, otherwise the id.
    pub fn label(&self) -> &str {
        self.title.as_deref().unwrap_or(self.id.as_str())
    }

    /// Check the fields the engine cannot run without.
    pub fn validate_fields(&self) -> std::result::Result<(), ValidationError> {
        let missing = |field| ValidationError::MissingField {
            task: self.id.clone(),
            field,
        };
        if self.id.as_str().trim().is_empty() {
            return Err(missing("id"));
        }
        if self.worker_role.trim().is_empty() {
            return Err(missing("worker_role"));
        }
        if self.prompt_body.trim().is_empty() {
            return Err(missing("prompt_body"));
        }
        if matches!(&self.qc_role, Some(role) if role.trim().is_empty()) {
            return Err(missing("qc_role"));
        }
        if self.dependencies.contains(&self.id) {
            return Err(ValidationError::SelfDependency(self.id.clone()));
        }
        Ok(())
    }
}

/// Lifecycle state of one task inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Not yet started.
    #[default]
    Pending,
    /// Worker invocation in flight.
    WorkerRunning,
    /// Worker output recorded, verification not started.
    #[serde(rename = "awaiting_qc")]
    AwaitingQC,
    /// Verification invocation in flight.
    #[serde(rename = "qc_running")]
    QCRunning,
    /// Verification passed (or worker succeeded with no QC configured).
    Passed,
    /// Attempt failed; another attempt follows.
    Retrying,
    /// All attempts exhausted.
    Failed,
}

impl TaskState {
    /// Whether a task in this state will not move again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Passed | TaskState::Failed)
    }

    /// Whether moving from `self` to `target` is a legal step.
    pub fn can_transition(&self, target: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, target),
            (Pending, WorkerRunning)
                | (WorkerRunning, AwaitingQC)
                | (WorkerRunning, Passed)
                | (WorkerRunning, Retrying)
                | (WorkerRunning, Failed)
                | (AwaitingQC, QCRunning)
                | (QCRunning, Passed)
                | (QCRunning, Retrying)
                | (QCRunning, Failed)
                | (Retrying, WorkerRunning)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::WorkerRunning => write!(f, "worker_running"),
            TaskState::AwaitingQC => write!(f, "awaiting_qc"),
            TaskState::QCRunning => write!(f, "qc_running"),
            TaskState::Passed => write!(f, "passed"),
            TaskState::Retrying => write!(f, "retrying"),
            TaskState::Failed => write!(f, "failed"),
        }
    }
}
