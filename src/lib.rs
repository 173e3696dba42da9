pub mod config;
pub mod core;
pub mod error;
pub mod input;
pub mod log;
pub mod orchestration;
pub mod util;

pub use config::Config;
pub use crate::core::{
    plan_batches, Batch, ExecutionId, ExecutionResult, ExecutionStatus, QcVerdict,
    TaskDefinition, TaskId, TaskState,
};
pub use error::{Error, Result, ValidationError};
pub use orchestration::{
    AgentInvoker, CancellationScope, Orchestrator, RateGate, RunReport, RunStatus, TaskRunner,
};
