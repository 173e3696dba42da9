//! Worker -> QC -> Retry state machine.
//!
//! A [`TaskRunner`] drives one task through its attempts:
//!
//! ```text
//! Pending -> WorkerRunning -> AwaitingQC -> QCRunning -> Passed
//!                 ^                              |
//!                 +--------- Retrying <----------+-> Failed
//! ```
//!
//! Without a QC role the worker result alone decides the attempt. Every
//! transition is validated and saved to the state store before the next
//! one starts. Task-level failures (worker or QC raising, unparseable
//! verdicts, breaker trips) stay inside the machine; only cancellation
//! escapes as an error.

use std::sync::Arc;

use chrono::Utc;
use tokio::time::Instant;

use crate::core::execution::{
    BreakerReport, ExecutionAttempt, ExecutionResult, ExecutionStatus, QcVerdict, Usage,
};
use crate::core::task::{ExecutionId, TaskDefinition, TaskId, TaskState};
use crate::error::{Error, Result};
use crate::orchestration::agent::{AgentInvoker, Invocation, InvocationKind};
use crate::orchestration::breaker::{BreakerConfig, CircuitBreaker};
use crate::orchestration::cancel::CancellationScope;
use crate::orchestration::feedback::{
    build_qc_prompt, build_retry_prompt, parse_verdict, synthesize_postmortem,
    unparseable_verdict, DEFAULT_QC_OUTPUT_LIMIT,
};
use crate::orchestration::gate::RateGate;
use crate::orchestration::store::{StateStore, TaskRecord};
use crate::util::estimate_tokens;
use crate::{clog, clog_debug, clog_warn};

/// Current state of one task plus its attempt history, persisted on every move.
struct Progress<'a> {
    store: &'a dyn StateStore,
    execution_id: ExecutionId,
    task_id: TaskId,
    state: TaskState,
    attempts: Vec<ExecutionAttempt>,
    /// Current attempt once its worker output exists and QC is pending.
    in_progress: Option<ExecutionAttempt>,
}

impl<'a> Progress<'a> {
    fn new(store: &'a dyn StateStore, execution_id: ExecutionId, task_id: TaskId) -> Self {
        Self {
            store,
            execution_id,
            task_id,
            state: TaskState::Pending,
            attempts: Vec::new(),
            in_progress: None,
        }
    }

    async fn enter(&mut self, next: TaskState) -> Result<()> {
        self.move_to(next)?;
        self.persist(None).await;
        Ok(())
    }

    async fn finish(&mut self, next: TaskState, result: &ExecutionResult) -> Result<()> {
        self.move_to(next)?;
        self.persist(Some(result)).await;
        Ok(())
    }

    fn move_to(&mut self, next: TaskState) -> Result<()> {
        if !self.state.can_transition(next) {
            return Err(Error::InvalidTransition {
                task: self.task_id.clone(),
                from: self.state,
                to: next,
            });
        }
        clog_debug!("Task {}: {} -> {}", self.task_id, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Store failures are logged and do not stop the task.
    async fn persist(&self, result: Option<&ExecutionResult>) {
        let record = TaskRecord {
            execution_id: self.execution_id,
            task_id: self.task_id.clone(),
            state: self.state,
            attempts: self.attempts.clone(),
            in_progress: self.in_progress.clone(),
            result: result.cloned(),
            updated_at: Utc::now(),
        };
        if let Err(e) = self.store.save_task(&record).await {
            clog_warn!(
                "Task {}: failed to save state {}: {}",
                self.task_id,
                self.state,
                e
            );
        }
    }
}

/// Outcome of one gated, breaker-guarded agent call.
struct CallResult {
    /// Output (possibly truncated by the breaker) or the error text.
    outcome: std::result::Result<String, String>,
    report: BreakerReport,
    requests: u32,
}

/// Drives tasks through the Worker -> QC -> Retry protocol.
pub struct TaskRunner {
    invoker: Arc<dyn AgentInvoker>,
    gate: Arc<RateGate>,
    store: Arc<dyn StateStore>,
    breaker: BreakerConfig,
    qc_output_limit: usize,
}

impl TaskRunner {
    pub fn new(
        invoker: Arc<dyn AgentInvoker>,
        gate: Arc<RateGate>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            invoker,
            gate,
            store,
            breaker: BreakerConfig::default(),
            qc_output_limit: DEFAULT_QC_OUTPUT_LIMIT,
        }
    }

    pub fn with_breaker_config(mut self, config: BreakerConfig) -> Self {
        self.breaker = config;
        self
    }

    /// Characters of worker output forwarded to QC.
    pub fn with_qc_output_limit(mut self, limit: usize) -> Self {
        self.qc_output_limit = limit;
        self
    }

    pub fn gate(&self) -> &Arc<RateGate> {
        &self.gate
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Run `task` to a terminal state.
    ///
    /// Always yields an `ExecutionResult` for task-level outcomes, including
    /// failure after exhausting retries.
    ///
    /// # Errors
    ///
    /// `Error::Cancelled` if `scope` is cancelled; `Error::InvalidTransition`
    /// if the machine attempts an illegal move.
    pub async fn run(
        &self,
        task: &TaskDefinition,
        scope: &CancellationScope,
    ) -> Result<ExecutionResult> {
        scope.check()?;

        let started_at = Utc::now();
        let clock = Instant::now();
        let max_attempts = task.max_attempts();
        let mut progress = Progress::new(
            self.store.as_ref(),
            scope.execution_id(),
            task.id.clone(),
        );
        progress.persist(None).await;

        clog!(
            "Task {} started (worker={}, qc={}, max_attempts={})",
            task.label(),
            task.worker_role,
            task.qc_role.as_deref().unwrap_or("-"),
            max_attempts
        );

        let mut usage = Usage::default();
        let mut feedback_history: Vec<QcVerdict> = Vec::new();
        let mut last_output = String::new();

        for attempt_number in 1..=max_attempts {
            progress.enter(TaskState::WorkerRunning).await?;
            let attempt_started = Utc::now();
            let prompt = build_retry_prompt(&task.prompt_body, &feedback_history);

            let worker = self
                .call(task, InvocationKind::Worker, &task.worker_role, &prompt, attempt_number, scope)
                .await?;
            usage.worker_invocations += 1;
            usage.add_report(&worker.report);
            usage.requests += u64::from(worker.requests);

            let mut qc_breaker = None;
            let (worker_output, worker_error, verdict) = match worker.outcome {
                Err(message) => {
                    clog_warn!(
                        "Task {}: worker failed on attempt {}: {}",
                        task.id,
                        attempt_number,
                        message
                    );
                    let verdict = QcVerdict::synthetic_fail(
                        &format!("Worker invocation failed: {}", message),
                        &message,
                    );
                    (None, Some(message), Some(verdict))
                }
                Ok(output) => match &task.qc_role {
                    None => (Some(output), None, None),
                    Some(qc_role) => {
                        progress.in_progress = Some(ExecutionAttempt {
                            attempt_number,
                            worker_output: Some(output.clone()),
                            worker_error: None,
                            qc_verdict: None,
                            worker_breaker: worker.report.clone(),
                            qc_breaker: None,
                            prompt: prompt.clone(),
                            started_at: attempt_started,
                            finished_at: Utc::now(),
                        });
                        progress.enter(TaskState::AwaitingQC).await?;
                        progress.enter(TaskState::QCRunning).await?;

                        let qc_prompt = build_qc_prompt(task, &output, self.qc_output_limit);
                        let qc = self
                            .call(task, InvocationKind::Qc, qc_role, &qc_prompt, attempt_number, scope)
                            .await?;
                        usage.qc_invocations += 1;
                        usage.add_report(&qc.report);
                        usage.requests += u64::from(qc.requests);

                        let verdict = match &qc.outcome {
                            Ok(text) => parse_verdict(text).unwrap_or_else(|| {
                                clog_warn!("Task {}: QC output had no verdict", task.id);
                                unparseable_verdict(text)
                            }),
                            Err(message) => {
                                clog_warn!("Task {}: QC failed: {}", task.id, message);
                                QcVerdict::synthetic_fail(
                                    &format!("QC invocation failed: {}", message),
                                    message,
                                )
                            }
                        };
                        qc_breaker = Some(qc.report);
                        (Some(output), None, Some(verdict))
                    }
                },
            };

            if let Some(output) = &worker_output {
                last_output = output.clone();
            }

            let attempt = ExecutionAttempt {
                attempt_number,
                worker_output,
                worker_error,
                qc_verdict: verdict.clone(),
                worker_breaker: worker.report,
                qc_breaker,
                prompt,
                started_at: attempt_started,
                finished_at: Utc::now(),
            };
            let passed = attempt.passed();
            progress.in_progress = None;
            progress.attempts.push(attempt);

            if passed {
                clog!("Task {} passed on attempt {}", task.id, attempt_number);
                let result = assemble(
                    task,
                    ExecutionStatus::Success,
                    last_output,
                    &progress.attempts,
                    usage,
                    started_at,
                    clock,
                );
                progress.finish(TaskState::Passed, &result).await?;
                return Ok(result);
            }

            if let Some(verdict) = verdict {
                feedback_history.push(verdict);
            }
            if attempt_number < max_attempts {
                clog_debug!(
                    "Task {}: attempt {} failed, retrying",
                    task.id,
                    attempt_number
                );
                progress.enter(TaskState::Retrying).await?;
            }
        }

        let mut result = assemble(
            task,
            ExecutionStatus::Failure,
            last_output,
            &progress.attempts,
            usage,
            started_at,
            clock,
        );
        let postmortem = synthesize_postmortem(&progress.attempts);
        clog_warn!(
            "Task {} failed after {} attempt(s): {}",
            task.id,
            progress.attempts.len(),
            postmortem.root_cause
        );
        result.postmortem = Some(postmortem);
        progress.finish(TaskState::Failed, &result).await?;
        Ok(result)
    }

    /// One agent call through the gate, under a fresh breaker.
    ///
    /// Returns `Err` only for cancellation; invocation failures come back
    /// inside `CallResult`.
    async fn call(
        &self,
        task: &TaskDefinition,
        kind: InvocationKind,
        role: &str,
        prompt: &str,
        attempt: u32,
        scope: &CancellationScope,
    ) -> Result<CallResult> {
        let label = format!("{}#{}:{}", task.id, attempt, kind);
        let breaker = Arc::new(CircuitBreaker::new(
            &label,
            &self.breaker,
            task.estimated_tool_calls,
        ));

        // One request per turn; a worker estimated at n tool calls makes about n + 1.
        let estimate = match kind {
            InvocationKind::Worker => task.estimated_tool_calls.map_or(1, |n| n.saturating_add(1)),
            InvocationKind::Qc => 1,
        };
        let permit = self.gate.acquire(estimate, scope).await?;
        let reserved = permit.reserved();

        let invocation = Invocation {
            execution_id: scope.execution_id(),
            task_id: task.id.clone(),
            kind,
            attempt,
            role: role.to_string(),
            prompt: prompt.to_string(),
            breaker: Arc::clone(&breaker),
            cancel: scope.token(),
        };
        let invoker = Arc::clone(&self.invoker);
        let max_duration = breaker.max_duration();

        let outcome = scope
            .run(async move {
                let call = invoker.invoke(invocation);
                Ok(match max_duration {
                    Some(limit) => tokio::time::timeout(limit, call).await.ok(),
                    None => Some(call.await),
                })
            })
            .await?;

        match outcome {
            Some(Ok(out)) => {
                let tokens = out
                    .tokens
                    .unwrap_or_else(|| estimate_tokens(&[prompt, &out.output]));
                breaker.observe(out.tool_calls, out.messages, tokens);
                let requests = out.requests;
                permit.complete(requests);
                let (output, report) = breaker.finish(out.output);
                Ok(CallResult {
                    outcome: Ok(output),
                    report,
                    requests,
                })
            }
            Some(Err(e)) if e.is_cancelled() => Err(e),
            Some(Err(e)) => {
                drop(permit);
                breaker.observe(0, 0, estimate_tokens(&[prompt]));
                Ok(CallResult {
                    outcome: Err(e.to_string()),
                    report: breaker.evaluate(),
                    requests: reserved,
                })
            }
            None => {
                drop(permit);
                breaker.trip(&format!(
                    "invocation ran longer than {:?}",
                    breaker.max_duration().unwrap_or_default()
                ));
                let (output, report) = breaker.finish(String::new());
                Ok(CallResult {
                    outcome: Ok(output),
                    report,
                    requests: reserved,
                })
            }
        }
    }
}

fn assemble(
    task: &TaskDefinition,
    status: ExecutionStatus,
    output: String,
    attempts: &[ExecutionAttempt],
    usage: Usage,
    started_at: chrono::DateTime<Utc>,
    clock: Instant,
) -> ExecutionResult {
    ExecutionResult {
        task_id: task.id.clone(),
        status,
        output,
        attempts: attempts.to_vec(),
        duration_ms: clock.elapsed().as_millis() as u64,
        usage,
        circuit_breaker_triggered: attempts.iter().any(|a| a.circuit_breaker_triggered()),
        postmortem: None,
        started_at,
        finished_at: Utc::now(),
    }
}
