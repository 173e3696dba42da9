//! End-to-end workflow integration tests.
//!
//! These tests run whole task sets through the orchestrator with a
//! scripted invoker and check the resulting run report and stored state.

use cadre::core::{ExecutionStatus, TaskId, TaskState};
use cadre::orchestration::{InvocationKind, RunStatus, TaskOutcome};
use cadre::{Error, ValidationError};

use crate::fixtures::{checked_task, fan_in_tasks, plain_task, Harness, Reply};

fn ids(ids: &[&str]) -> Vec<TaskId> {
    ids.iter().map(|id| TaskId::from(*id)).collect()
}

/// Test: Failure stops later batches
/// Given A, B independent, C after both and D after C
/// When B fails verification on every attempt
/// Then A succeeds, B fails with a postmortem and C, D never start
#[tokio::test]
async fn test_failed_dependency_stops_downstream_batches() {
    let h = Harness::new();
    h.invoker.script(
        "B",
        InvocationKind::Qc,
        vec![
            Reply::verdict(false, 40, "missing tests"),
            Reply::verdict(false, 45, "missing tests"),
            Reply::verdict(false, 50, "missing tests"),
        ],
    );

    let report = h.orchestrator.run(&fan_in_tasks(2)).await.unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(
        report.batches,
        vec![ids(&["A", "B"]), ids(&["C"]), ids(&["D"])]
    );

    let a = report.outcome(&TaskId::from("A")).unwrap().result().unwrap();
    assert_eq!(a.status, ExecutionStatus::Success);
    assert_eq!(a.output, "output of A");

    let b = report.outcome(&TaskId::from("B")).unwrap().result().unwrap();
    assert_eq!(b.status, ExecutionStatus::Failure);
    assert_eq!(b.attempts.len(), 3);
    let postmortem = b.postmortem.as_ref().expect("failed task has a postmortem");
    assert_eq!(postmortem.score_trend, vec![40, 45, 50]);
    assert_eq!(postmortem.recurring_issues[0].issue, "missing tests");
    assert_eq!(postmortem.recurring_issues[0].occurrences, 3);

    assert_eq!(report.outcome(&TaskId::from("C")), Some(&TaskOutcome::NotStarted));
    assert_eq!(report.outcome(&TaskId::from("D")), Some(&TaskOutcome::NotStarted));
    assert!(!h.invoker.called("C"));
    assert!(!h.invoker.called("D"));

    assert_eq!(h.invoker.calls_for("B", InvocationKind::Worker).len(), 3);
    assert_eq!(h.invoker.calls_for("B", InvocationKind::Qc).len(), 3);
    assert_eq!(h.invoker.calls_for("A", InvocationKind::Worker).len(), 1);

    let stored = h.store.reports();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, RunStatus::Failed);
    assert_eq!(
        h.store.transitions(&report.execution_id, &TaskId::from("B")).last(),
        Some(&TaskState::Failed)
    );
}

/// Test: Retry feedback reaches the worker
/// Given a task whose first QC verdict fails with specific fixes
/// When the task is retried
/// Then the second worker prompt carries the verdict and the task passes
#[tokio::test]
async fn test_retry_prompt_carries_qc_feedback() {
    let h = Harness::new();
    h.invoker.script(
        "A",
        InvocationKind::Qc,
        vec![Reply::text(
            r#"{"passed": false, "score": 30, "feedback": "No error handling",
                "issues": ["unwrap on user input"], "required_fixes": ["return a Result"]}"#,
        )],
    );

    let report = h.orchestrator.run(&[checked_task("A", &[], 2)]).await.unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
    let workers = h.invoker.calls_for("A", InvocationKind::Worker);
    assert_eq!(workers.len(), 2);
    assert_eq!(workers[0].prompt, "Implement A");
    assert_eq!(workers[1].attempt, 2);
    assert!(workers[1].prompt.starts_with("Implement A"));
    assert!(workers[1].prompt.contains("## Previous attempts"));
    assert!(workers[1].prompt.contains("No error handling"));
    assert!(workers[1].prompt.contains("unwrap on user input"));
    assert!(workers[1].prompt.contains("return a Result"));

    let qc = h.invoker.calls_for("A", InvocationKind::Qc);
    assert!(qc[0].prompt.contains("output of A"));
    assert!(qc[0].prompt.contains("has tests"));
}

/// Test: Happy path across batches
/// Given the fan-in task set with default answers
/// When the run executes
/// Then every task succeeds and dependents start after their dependencies
#[tokio::test]
async fn test_all_batches_succeed_in_order() {
    let h = Harness::new();

    let report = h.orchestrator.run(&fan_in_tasks(0)).await.unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.ids_with("succeeded").len(), 4);

    let order: Vec<TaskId> = h
        .invoker
        .calls()
        .into_iter()
        .filter(|c| c.kind == InvocationKind::Worker)
        .map(|c| c.task_id)
        .collect();
    let pos = |id: &str| order.iter().position(|t| t.as_str() == id).unwrap();
    assert!(pos("C") > pos("A"));
    assert!(pos("C") > pos("B"));
    assert!(pos("D") > pos("C"));

    let usage = report.total_usage();
    assert_eq!(usage.worker_invocations, 4);
    assert_eq!(usage.qc_invocations, 4);
}

/// Test: Worker errors are retried without QC
/// Given a worker-only task whose first call raises
/// When the run executes
/// Then the second attempt succeeds and no QC call is made
#[tokio::test]
async fn test_worker_error_then_success() {
    let h = Harness::new();
    h.invoker.script(
        "A",
        InvocationKind::Worker,
        vec![Reply::Fail("rate limited upstream".to_string())],
    );

    let report = h.orchestrator.run(&[plain_task("A", &[])]).await.unwrap();

    let result = report.outcome(&TaskId::from("A")).unwrap().result().unwrap();
    assert!(result.is_success());
    assert_eq!(result.attempts.len(), 2);
    assert!(result.attempts[0]
        .worker_error
        .as_deref()
        .unwrap()
        .contains("rate limited upstream"));
    assert!(h.invoker.calls_for("A", InvocationKind::Qc).is_empty());
}

/// Test: Invalid task sets are rejected up front
/// Given a task depending on an unknown id
/// When the run executes
/// Then validation fails and no agent is called
#[tokio::test]
async fn test_unknown_dependency_rejected_before_start() {
    let h = Harness::new();
    let tasks = vec![plain_task("A", &[]), plain_task("B", &["Z"])];

    let err = h.orchestrator.run(&tasks).await.unwrap_err();

    assert!(matches!(
        err,
        Error::Validation(ValidationError::UnknownDependency { .. })
    ));
    assert!(h.invoker.calls().is_empty());
    assert!(h.store.reports().is_empty());
}
