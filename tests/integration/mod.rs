//! Integration test suite for cadre.
//!
//! These tests drive whole runs through the orchestrator: batching,
//! the worker/QC/retry loop, the shared rate gate, cancellation and
//! persisted run state.
//!
//! # Test Categories
//!
//! - `workflow_e2e`: Full runs from task set to run report
//! - `cancellation`: Aborting runs mid-flight
//! - `rate_limiting`: Several tasks sharing one gate
//! - `persistence`: Task files on disk and the JSON state store
//!
//! # CI Compatibility
//!
//! Agents are scripted in-process; no agent binary is spawned.

mod fixtures;

mod workflow_e2e;
mod cancellation;
mod rate_limiting;
mod persistence;
