//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scripted agent invoker keyed by task and invocation kind
//! - Predefined task sets
//! - Building orchestrators over memory or file stores

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::time::Instant;

use cadre::core::{TaskDefinition, TaskId};
use cadre::orchestration::{
    AgentInvoker, Invocation, InvocationKind, InvocationOutput, MemoryStore, Orchestrator,
    RateGate, StateStore, TaskRunner,
};
use cadre::{Error, Result};

/// One scripted answer.
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Fail(String),
    /// Never returns; only cancellation ends the call.
    Hang,
}

impl Reply {
    pub fn text(s: &str) -> Self {
        Reply::Text(s.to_string())
    }

    pub fn verdict(passed: bool, score: u8, feedback: &str) -> Self {
        let issues: Vec<&str> = if passed { Vec::new() } else { vec![feedback] };
        Reply::Text(
            serde_json::json!({
                "passed": passed,
                "score": score,
                "feedback": feedback,
                "issues": issues,
            })
            .to_string(),
        )
    }
}

/// A call the invoker received.
#[derive(Debug, Clone)]
pub struct Call {
    pub task_id: TaskId,
    pub kind: InvocationKind,
    pub attempt: u32,
    pub prompt: String,
    pub at: Instant,
}

/// Invoker that answers from per-(task, kind) queues.
///
/// With an empty queue a worker echoes `output of <task>` and QC passes.
pub struct ScriptedInvoker {
    replies: Mutex<HashMap<(TaskId, InvocationKind), VecDeque<Reply>>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn script(&self, task: &str, kind: InvocationKind, replies: Vec<Reply>) {
        self.replies
            .lock()
            .unwrap()
            .entry((TaskId::from(task), kind))
            .or_default()
            .extend(replies);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, task: &str, kind: InvocationKind) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.task_id.as_str() == task && c.kind == kind)
            .collect()
    }

    pub fn called(&self, task: &str) -> bool {
        self.calls().iter().any(|c| c.task_id.as_str() == task)
    }

    /// Polls until `task` has been called at least once.
    pub async fn wait_for(&self, task: &str) {
        while !self.called(task) {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl AgentInvoker for ScriptedInvoker {
    async fn invoke(&self, invocation: Invocation) -> Result<InvocationOutput> {
        self.calls.lock().unwrap().push(Call {
            task_id: invocation.task_id.clone(),
            kind: invocation.kind,
            attempt: invocation.attempt,
            prompt: invocation.prompt.clone(),
            at: Instant::now(),
        });

        let reply = self
            .replies
            .lock()
            .unwrap()
            .get_mut(&(invocation.task_id.clone(), invocation.kind))
            .and_then(VecDeque::pop_front);

        match reply {
            Some(Reply::Text(text)) => Ok(InvocationOutput::text(text)),
            Some(Reply::Fail(message)) => Err(Error::Invocation {
                role: invocation.role,
                message,
            }),
            Some(Reply::Hang) => std::future::pending().await,
            None => match invocation.kind {
                InvocationKind::Worker => Ok(InvocationOutput::text(format!(
                    "output of {}",
                    invocation.task_id
                ))),
                InvocationKind::Qc => Ok(InvocationOutput::text(
                    r#"{"passed": true, "score": 95, "feedback": "looks good"}"#,
                )),
            },
        }
    }
}

/// A task with a QC step and the given retry budget.
pub fn checked_task(id: &str, deps: &[&str], max_retries: u32) -> TaskDefinition {
    TaskDefinition::new(id, "coder", &format!("Implement {}", id))
        .with_dependencies(deps.iter().copied())
        .with_qc("reviewer", &["compiles", "has tests"])
        .with_max_retries(max_retries)
}

/// A worker-only task.
pub fn plain_task(id: &str, deps: &[&str]) -> TaskDefinition {
    TaskDefinition::new(id, "coder", &format!("Implement {}", id))
        .with_dependencies(deps.iter().copied())
}

/// A, B independent; C needs both; D needs C.
pub fn fan_in_tasks(max_retries: u32) -> Vec<TaskDefinition> {
    vec![
        checked_task("A", &[], max_retries),
        checked_task("B", &[], max_retries),
        checked_task("C", &["A", "B"], max_retries),
        checked_task("D", &["C"], max_retries),
    ]
}

/// Orchestrator over an unlimited gate and a memory store.
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub invoker: Arc<ScriptedInvoker>,
    pub store: Arc<MemoryStore>,
    pub gate: Arc<RateGate>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_gate(Arc::new(RateGate::unlimited("llm")))
    }

    pub fn with_gate(gate: Arc<RateGate>) -> Self {
        let invoker = Arc::new(ScriptedInvoker::new());
        let store = Arc::new(MemoryStore::new());
        let orchestrator = orchestrator_over(invoker.clone(), gate.clone(), store.clone());
        Self {
            orchestrator,
            invoker,
            store,
            gate,
        }
    }
}

pub fn orchestrator_over(
    invoker: Arc<ScriptedInvoker>,
    gate: Arc<RateGate>,
    store: Arc<dyn StateStore>,
) -> Orchestrator {
    Orchestrator::new(TaskRunner::new(invoker, gate, store))
}
