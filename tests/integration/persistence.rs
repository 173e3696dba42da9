//! Task files and persisted run state.
//!
//! A task set is loaded from disk, run against the JSON file store, and the
//! stored report and task records are read back.

use std::sync::Arc;

use tempfile::TempDir;

use cadre::core::{ExecutionStatus, TaskId, TaskState};
use cadre::input::load_tasks;
use cadre::orchestration::{InvocationKind, JsonFileStore, RateGate, RunStatus};

use crate::fixtures::{orchestrator_over, Reply, ScriptedInvoker};

const TASKS_TOML: &str = r#"
[[tasks]]
id = "schema"
title = "Design the schema"
worker_role = "architect"
prompt_body = "Design the tables"
qc_role = "reviewer"
verification_criteria = ["normalized", "indexed"]

[[tasks]]
id = "api"
worker_role = "coder"
prompt_body = "Write the handlers"
dependencies = ["schema"]
max_retries = 1
"#;

/// Test: Run from a task file with on-disk state
/// Given a TOML task file and a JSON file store
/// When the run finishes
/// Then the report and every task record can be read back from disk
#[tokio::test]
async fn test_task_file_run_persists_state() {
    let dir = TempDir::new().unwrap();
    let task_file = dir.path().join("tasks.toml");
    std::fs::write(&task_file, TASKS_TOML).unwrap();
    let tasks = load_tasks(&task_file).unwrap();
    assert_eq!(tasks.len(), 2);

    let invoker = Arc::new(ScriptedInvoker::new());
    invoker.script(
        "schema",
        InvocationKind::Qc,
        vec![Reply::verdict(false, 55, "no indexes"), Reply::verdict(true, 90, "ok")],
    );
    let store = Arc::new(JsonFileStore::new(dir.path().join("runs")));
    let orchestrator = orchestrator_over(
        invoker.clone(),
        Arc::new(RateGate::unlimited("llm")),
        store.clone(),
    );

    let report = orchestrator.run(&tasks).await.unwrap();
    assert_eq!(report.status, RunStatus::Succeeded);

    let stored = store.load_report(&report.execution_id).await.unwrap();
    assert_eq!(stored.status, RunStatus::Succeeded);
    assert_eq!(stored.tasks.len(), 2);
    assert_eq!(stored.tasks[0].title.as_deref(), Some("Design the schema"));
    assert_eq!(stored.batches, report.batches);

    let schema = store
        .load_task(&report.execution_id, &TaskId::from("schema"))
        .await
        .unwrap();
    assert_eq!(schema.state, TaskState::Passed);
    assert_eq!(schema.attempts.len(), 2);
    let result = schema.result.expect("terminal record carries the result");
    assert_eq!(result.status, ExecutionStatus::Success);
    assert!(result.attempts[1].prompt.contains("no indexes"));

    let api = store
        .load_task(&report.execution_id, &TaskId::from("api"))
        .await
        .unwrap();
    assert_eq!(api.state, TaskState::Passed);
    assert!(store.report_path(&report.execution_id).exists());
}

/// Test: Partial state survives a failed run
/// Given a task that never passes QC
/// When the run ends
/// Then its stored record is Failed and its dependent has no record
#[tokio::test]
async fn test_failed_run_leaves_no_record_for_unstarted_tasks() {
    let dir = TempDir::new().unwrap();
    let task_file = dir.path().join("tasks.toml");
    std::fs::write(&task_file, TASKS_TOML).unwrap();
    let mut tasks = load_tasks(&task_file).unwrap();
    tasks[0].max_retries = 0;

    let invoker = Arc::new(ScriptedInvoker::new());
    invoker.script(
        "schema",
        InvocationKind::Qc,
        vec![Reply::verdict(false, 10, "wrong database")],
    );
    let store = Arc::new(JsonFileStore::new(dir.path()));
    let orchestrator = orchestrator_over(
        invoker,
        Arc::new(RateGate::unlimited("llm")),
        store.clone(),
    );

    let report = orchestrator.run(&tasks).await.unwrap();
    assert_eq!(report.status, RunStatus::Failed);

    let schema = store
        .load_task(&report.execution_id, &TaskId::from("schema"))
        .await
        .unwrap();
    assert_eq!(schema.state, TaskState::Failed);
    assert!(schema.result.unwrap().postmortem.is_some());

    assert!(store
        .load_task(&report.execution_id, &TaskId::from("api"))
        .await
        .is_err());
    assert_eq!(
        store.load_report(&report.execution_id).await.unwrap().status,
        RunStatus::Failed
    );
}
