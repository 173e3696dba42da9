//! Shared rate gate integration tests.
//!
//! Every worker and QC call in a run goes through one gate. These tests run
//! on a paused clock so hour-long windows complete instantly.

use std::sync::Arc;
use std::time::Duration;

use cadre::orchestration::{InvocationKind, Quota, RateGate, RunStatus};

use crate::fixtures::{checked_task, plain_task, Harness};

fn offsets(h: &Harness, start: tokio::time::Instant) -> Vec<Duration> {
    let mut offsets: Vec<Duration> = h.invoker.calls().iter().map(|c| c.at - start).collect();
    offsets.sort();
    offsets
}

/// Test: Quota shared across a batch
/// Given four independent tasks and a gate allowing 3 requests per hour
/// When they run as one batch
/// Then calls are spaced by 20 minutes and the fourth waits for the window
#[tokio::test(start_paused = true)]
async fn test_batch_shares_hourly_quota() {
    let h = Harness::with_gate(Arc::new(RateGate::new("llm", Quota::PerHour(3))));
    let tasks: Vec<_> = ["A", "B", "C", "D"]
        .iter()
        .map(|id| plain_task(id, &[]))
        .collect();
    let start = tokio::time::Instant::now();

    let report = h.orchestrator.run(&tasks).await.unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
    let at = offsets(&h, start);
    assert_eq!(at.len(), 4);
    assert!(at[1] >= Duration::from_secs(1200));
    assert!(at[2] >= Duration::from_secs(2400));
    assert!(at[3] >= Duration::from_secs(3600));

    let stats = h.gate.stats();
    assert_eq!(stats.total_dispatched, 4);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.queued, 0);
}

/// Test: QC calls count against the quota
/// Given a checked task and a gate allowing 2 requests per hour
/// When the task runs
/// Then the QC call waits for the worker call's spacing
#[tokio::test(start_paused = true)]
async fn test_qc_call_is_throttled_too() {
    let h = Harness::with_gate(Arc::new(RateGate::new("llm", Quota::PerHour(2))));
    let start = tokio::time::Instant::now();

    let report = h.orchestrator.run(&[checked_task("A", &[], 0)]).await.unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
    let worker = &h.invoker.calls_for("A", InvocationKind::Worker)[0];
    let qc = &h.invoker.calls_for("A", InvocationKind::Qc)[0];
    assert_eq!(worker.at - start, Duration::ZERO);
    assert!(qc.at - worker.at >= Duration::from_secs(1800));
    assert_eq!(report.total_usage().requests, 2);
    assert_eq!(h.gate.stats().in_window, 2);
}

/// Test: Unlimited gate adds no delay
/// Given the default unlimited gate
/// When a batch of tasks runs
/// Then no simulated time passes
#[tokio::test(start_paused = true)]
async fn test_unlimited_gate_never_waits() {
    let h = Harness::new();
    let tasks: Vec<_> = (0..8).map(|i| plain_task(&format!("t{}", i), &[])).collect();
    let start = tokio::time::Instant::now();

    h.orchestrator.run(&tasks).await.unwrap();

    assert!(offsets(&h, start).iter().all(|d| *d == Duration::ZERO));
    assert_eq!(h.gate.quota(), Quota::Unlimited);
}

/// Test: Limit change while a run is throttled
/// Given a slow gate with waiters queued
/// When the limit is raised mid-run
/// Then the waiters are released early
#[tokio::test(start_paused = true)]
async fn test_raising_limit_releases_waiters() {
    let gate = Arc::new(RateGate::new("llm", Quota::PerHour(1)));
    let h = Harness::with_gate(gate.clone());
    let tasks: Vec<_> = ["A", "B", "C"].iter().map(|id| plain_task(id, &[])).collect();
    let start = tokio::time::Instant::now();

    let reconfigure = async {
        tokio::time::sleep(Duration::from_secs(60)).await;
        gate.set_limit(3600).unwrap();
    };
    let (report, ()) = tokio::join!(h.orchestrator.run(&tasks), reconfigure);

    assert_eq!(report.unwrap().status, RunStatus::Succeeded);
    let at = offsets(&h, start);
    assert!(at[2] < Duration::from_secs(3600));
    assert_eq!(gate.quota(), Quota::PerHour(3600));
}
