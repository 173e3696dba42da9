//! Core domain models for cadre.
//!
//! This module contains the fundamental data structures used throughout
//! the engine: task definitions and lifecycle states, execution records,
//! and the dependency DAG that produces execution batches.

pub mod dag;
pub mod execution;
pub mod task;

pub use dag::{plan_batches, Batch, TaskDAG};
pub use execution::{
    BreakerReport, ExecutionAttempt, ExecutionResult, ExecutionStatus, Postmortem, QcVerdict,
    RecurringIssue, Usage,
};
pub use task::{ExecutionId, TaskDefinition, TaskId, TaskState, DEFAULT_MAX_RETRIES};
