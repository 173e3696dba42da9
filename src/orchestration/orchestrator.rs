//! Batch orchestrator.
//!
//! Plans batches once, then runs them strictly in order. Tasks inside a
//! batch run concurrently and are all joined before the next batch starts.
//! A failed task lets its siblings finish but stops every later batch.
//! Cancellation aborts the run at the next suspension point.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;

use crate::core::dag::{plan_batches, Batch};
use crate::core::task::{ExecutionId, TaskDefinition, TaskId};
use crate::error::{Error, Result};
use crate::orchestration::cancel::{CancellationScope, ScopeRegistry};
use crate::orchestration::machine::TaskRunner;
use crate::orchestration::report::{RunReport, RunStatus, TaskOutcome, TaskReport};
use crate::{clog, clog_error, clog_warn};

pub struct Orchestrator {
    runner: TaskRunner,
    scopes: Arc<ScopeRegistry>,
}

impl Orchestrator {
    pub fn new(runner: TaskRunner) -> Self {
        Self {
            runner,
            scopes: Arc::new(ScopeRegistry::new()),
        }
    }

    /// Share a scope registry, e.g. with a signal handler.
    pub fn with_scopes(mut self, scopes: Arc<ScopeRegistry>) -> Self {
        self.scopes = scopes;
        self
    }

    pub fn scopes(&self) -> &Arc<ScopeRegistry> {
        &self.scopes
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.runner
    }

    /// Validate `tasks` and compute the batch plan without running anything.
    pub fn plan(&self, tasks: &[TaskDefinition]) -> Result<Vec<Batch>> {
        Ok(plan_batches(tasks)?)
    }

    /// Run `tasks` under a fresh execution id.
    pub async fn run(&self, tasks: &[TaskDefinition]) -> Result<RunReport> {
        let scope = self.scopes.create(ExecutionId::new());
        self.run_in_scope(tasks, &scope).await
    }

    /// Run `tasks` under `scope`, which is disposed when the run ends.
    ///
    /// # Errors
    ///
    /// `Error::Validation` if the task set is rejected (no task starts);
    /// `Error::Cancelled` if the scope is cancelled. A cancelled run still
    /// saves its partial report before returning.
    pub async fn run_in_scope(
        &self,
        tasks: &[TaskDefinition],
        scope: &CancellationScope,
    ) -> Result<RunReport> {
        let result = self.execute(tasks, scope).await;
        self.scopes.dispose(&scope.execution_id());
        scope.dispose();
        result
    }

    async fn execute(
        &self,
        tasks: &[TaskDefinition],
        scope: &CancellationScope,
    ) -> Result<RunReport> {
        let execution_id = scope.execution_id();
        let started_at = Utc::now();

        let batches = match plan_batches(tasks) {
            Ok(batches) => batches,
            Err(e) => {
                clog_error!("Run {}: rejected: {}", execution_id.short(), e);
                return Err(e.into());
            }
        };
        clog!(
            "Run {}: {} task(s) in {} batch(es)",
            execution_id.short(),
            tasks.len(),
            batches.len()
        );

        let mut outcomes: HashMap<TaskId, TaskOutcome> = HashMap::new();
        let mut status = RunStatus::Succeeded;
        let mut internal_error: Option<Error> = None;

        for batch in &batches {
            if scope.is_cancelled() {
                status = RunStatus::Cancelled;
                break;
            }

            clog!(
                "Run {}: batch {} ({} task(s)): {}",
                execution_id.short(),
                batch.index,
                batch.len(),
                batch
                    .tasks
                    .iter()
                    .map(|t| t.id.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );

            let results = join_all(batch.tasks.iter().map(|task| self.runner.run(task, scope))).await;

            let mut batch_failed = false;
            for (task, result) in batch.tasks.iter().zip(results) {
                let outcome = match result {
                    Ok(result) => {
                        batch_failed |= !result.is_success();
                        TaskOutcome::from_result(result)
                    }
                    Err(e) if e.is_cancelled() => {
                        status = RunStatus::Cancelled;
                        TaskOutcome::Cancelled
                    }
                    Err(e) => {
                        clog_error!("Run {}: task {} aborted: {}", execution_id.short(), task.id, e);
                        let outcome = TaskOutcome::Aborted {
                            error: e.to_string(),
                        };
                        internal_error.get_or_insert(e);
                        outcome
                    }
                };
                outcomes.insert(task.id.clone(), outcome);
            }

            if status == RunStatus::Cancelled || internal_error.is_some() {
                break;
            }
            if batch_failed {
                clog_warn!(
                    "Run {}: batch {} had failures; later batches will not start",
                    execution_id.short(),
                    batch.index
                );
                status = RunStatus::Failed;
                break;
            }
        }

        if scope.is_cancelled() {
            status = RunStatus::Cancelled;
        } else if internal_error.is_some() {
            status = RunStatus::Failed;
        }

        let report = RunReport {
            execution_id,
            status,
            batches: batches.iter().map(Batch::task_ids).collect(),
            tasks: tasks
                .iter()
                .map(|task| TaskReport {
                    task_id: task.id.clone(),
                    title: task.title.clone(),
                    outcome: outcomes
                        .remove(&task.id)
                        .unwrap_or(TaskOutcome::NotStarted),
                })
                .collect(),
            cancel_reason: scope.reason().map(str::to_string),
            started_at,
            finished_at: Utc::now(),
        };

        if let Err(e) = self.runner.store().save_report(&report).await {
            clog_warn!("Run {}: failed to save report: {}", execution_id.short(), e);
        }
        clog!(
            "Run {}: {} in {}ms",
            execution_id.short(),
            report.status,
            report.duration_ms()
        );

        if let Some(e) = internal_error {
            return Err(e);
        }
        if status == RunStatus::Cancelled {
            return Err(scope.cancelled_error());
        }
        Ok(report)
    }
}
