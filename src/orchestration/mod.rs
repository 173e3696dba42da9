//! Orchestration layer for cadre.
//!
//! Leaf components (rate gate, cancellation scope, circuit breaker) are
//! composed by the per-task state machine, which the batch orchestrator
//! fans out over each batch of the dependency plan.

pub mod agent;
pub mod breaker;
pub mod cancel;
pub mod feedback;
pub mod gate;
pub mod machine;
pub mod orchestrator;
pub mod report;
pub mod store;

pub use agent::{AgentInvoker, CommandInvoker, Invocation, InvocationKind, InvocationOutput};
pub use breaker::{BreakerConfig, CircuitBreaker};
pub use cancel::{CancellationScope, CleanupId, ScopeRegistry};
pub use feedback::{
    build_qc_prompt, build_retry_prompt, parse_verdict, synthesize_postmortem,
    DEFAULT_QC_OUTPUT_LIMIT,
};
pub use gate::{GatePermit, GateRegistry, GateStats, Quota, RateGate};
pub use machine::TaskRunner;
pub use orchestrator::Orchestrator;
pub use report::{RunReport, RunStatus, TaskOutcome, TaskReport};
pub use store::{JsonFileStore, MemoryStore, StateStore, TaskRecord};
