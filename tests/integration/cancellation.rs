//! Cancellation integration tests.
//!
//! A run is aborted while an agent call is in flight; the run must stop
//! at that call, start nothing further and still leave a partial report.

use std::time::Duration;

use cadre::core::{ExecutionId, TaskId};
use cadre::orchestration::{InvocationKind, RunStatus, TaskOutcome};

use crate::fixtures::{plain_task, Harness, Reply};

/// Test: Cancel mid-run
/// Given A, then B (which hangs), then C
/// When the scope is cancelled while B is running
/// Then the run errors as cancelled, C never starts and the partial report is saved
#[tokio::test]
async fn test_cancel_while_task_in_flight() {
    let h = Harness::new();
    h.invoker.script("B", InvocationKind::Worker, vec![Reply::Hang]);
    let tasks = vec![
        plain_task("A", &[]),
        plain_task("B", &["A"]),
        plain_task("C", &["B"]),
    ];
    let scope = h.orchestrator.scopes().create(ExecutionId::new());

    let canceller = async {
        h.invoker.wait_for("B").await;
        assert!(scope.cancel("user abort"));
    };
    let (result, ()) = tokio::join!(h.orchestrator.run_in_scope(&tasks, &scope), canceller);

    let err = result.unwrap_err();
    assert!(err.is_cancelled());
    assert!(err.to_string().contains("user abort"));
    assert!(!h.invoker.called("C"));

    let reports = h.store.reports();
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.cancel_reason.as_deref(), Some("user abort"));
    assert_eq!(report.outcome(&TaskId::from("A")).unwrap().label(), "succeeded");
    assert_eq!(report.outcome(&TaskId::from("B")), Some(&TaskOutcome::Cancelled));
    assert_eq!(report.outcome(&TaskId::from("C")), Some(&TaskOutcome::NotStarted));

    assert_eq!(h.orchestrator.scopes().active_count(), 0);
}

/// Test: Cancel reaches every sibling
/// Given two independent tasks that both hang
/// When the scope is cancelled through the registry
/// Then both are reported cancelled and the cleanup callback fires once
#[tokio::test]
async fn test_cancel_aborts_all_siblings() {
    let h = Harness::new();
    h.invoker.script("A", InvocationKind::Worker, vec![Reply::Hang]);
    h.invoker.script("B", InvocationKind::Worker, vec![Reply::Hang]);
    let tasks = vec![plain_task("A", &[]), plain_task("B", &[])];

    let execution_id = ExecutionId::new();
    let scope = h.orchestrator.scopes().create(execution_id);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    scope
        .on_cancel(move || {
            let _ = tx.send(());
        })
        .unwrap();

    let scopes = h.orchestrator.scopes().clone();
    let canceller = async {
        h.invoker.wait_for("A").await;
        h.invoker.wait_for("B").await;
        assert!(scopes.cancel(&execution_id, "shutdown"));
    };
    let (result, ()) = tokio::join!(h.orchestrator.run_in_scope(&tasks, &scope), canceller);

    assert!(result.unwrap_err().is_cancelled());
    let report = &h.store.reports()[0];
    assert_eq!(report.ids_with("cancelled").len(), 2);
    assert!(rx.recv().await.is_some());
    assert!(rx.try_recv().is_err());
}

/// Test: Late cancel is a no-op
/// Given a run that already finished
/// When its scope is cancelled afterwards
/// Then nothing changes and the stored report still says succeeded
#[tokio::test]
async fn test_cancel_after_completion_is_ignored() {
    let h = Harness::new();
    let scope = h.orchestrator.scopes().create(ExecutionId::new());

    let report = tokio::time::timeout(
        Duration::from_secs(5),
        h.orchestrator.run_in_scope(&[plain_task("A", &[])], &scope),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
    assert!(!scope.cancel("too late"));
    assert_eq!(h.store.reports()[0].status, RunStatus::Succeeded);
}
