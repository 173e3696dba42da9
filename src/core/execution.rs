//! Records produced while a task executes.
//!
//! Attempts are appended once and never edited; a task's `ExecutionResult`
//! is assembled exactly once when it reaches a terminal state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::TaskId;

/// Structured outcome of one verification step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QcVerdict {
    /// Authoritative pass/fail.
    pub passed: bool,
    /// Advisory score, 0-100.
    pub score: u8,
    pub feedback: String,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub required_fixes: Vec<String>,
    /// True when the engine produced this verdict itself (QC raised, output
    /// unparseable, or worker failure) rather than reading it from a QC agent.
    #[serde(default)]
    pub synthetic: bool,
}

impl QcVerdict {
    pub fn pass(score: u8, feedback: &str) -> Self {
        Self {
            passed: true,
            score: score.min(100),
            feedback: feedback.to_string(),
            issues: Vec::new(),
            required_fixes: Vec::new(),
            synthetic: false,
        }
    }

    pub fn fail(score: u8, feedback: &str, issues: Vec<String>, required_fixes: Vec<String>) -> Self {
        Self {
            passed: false,
            score: score.min(100),
            feedback: feedback.to_string(),
            issues,
            required_fixes,
            synthetic: false,
        }
    }

    /// Failing verdict with score 0 that the engine substitutes for a missing one.
    pub fn synthetic_fail(feedback: &str, issue: &str) -> Self {
        Self {
            passed: false,
            score: 0,
            feedback: feedback.to_string(),
            issues: vec![issue.to_string()],
            required_fixes: Vec::new(),
            synthetic: true,
        }
    }
}

/// What the circuit breaker saw during one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerReport {
    pub tool_calls: u32,
    pub messages: u32,
    pub estimated_tokens: u64,
    /// Soft thresholds crossed (advisory only).
    #[serde(default)]
    pub warnings: Vec<String>,
    pub triggered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Resource usage accumulated across a task's invocations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub worker_invocations: u32,
    pub qc_invocations: u32,
    pub tool_calls: u64,
    pub estimated_tokens: u64,
    /// Downstream requests recorded against the rate gate.
    pub requests: u64,
}

impl Usage {
    pub fn add_report(&mut self, report: &BreakerReport) {
        self.tool_calls += u64::from(report.tool_calls);
        self.estimated_tokens += report.estimated_tokens;
    }
}

/// One worker (and optional QC) pass over a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    /// 1-based.
    pub attempt_number: u32,
    /// Full worker output, verbatim. `None` when the worker raised.
    pub worker_output: Option<String>,
    /// Error text when the worker raised.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_error: Option<String>,
    /// Verdict for this attempt. `None` only when no QC role is configured
    /// and the worker succeeded.
    pub qc_verdict: Option<QcVerdict>,
    pub worker_breaker: BreakerReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qc_breaker: Option<BreakerReport>,
    /// Prompt the worker received for this attempt.
    pub prompt: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionAttempt {
    pub fn passed(&self) -> bool {
        match &self.qc_verdict {
            Some(verdict) => verdict.passed,
            None => self.worker_error.is_none(),
        }
    }

    pub fn circuit_breaker_triggered(&self) -> bool {
        self.worker_breaker.triggered
            || self.qc_breaker.as_ref().is_some_and(|r| r.triggered)
    }
}

/// Terminal outcome of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failure,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Success => write!(f, "success"),
            ExecutionStatus::Failure => write!(f, "failure"),
        }
    }
}

/// Failure analysis over a task's whole attempt history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Postmortem {
    pub summary: String,
    pub root_cause: String,
    /// Issues reported by more than one attempt, most frequent first.
    pub recurring_issues: Vec<RecurringIssue>,
    /// QC score per attempt (0 for synthetic verdicts).
    pub score_trend: Vec<u8>,
    pub remediation: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringIssue {
    pub issue: String,
    pub occurrences: usize,
}

/// Final record for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: TaskId,
    pub status: ExecutionStatus,
    /// Output of the last successful worker call, verbatim.
    pub output: String,
    pub attempts: Vec<ExecutionAttempt>,
    pub duration_ms: u64,
    pub usage: Usage,
    pub circuit_breaker_triggered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postmortem: Option<Postmortem>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    pub fn final_verdict(&self) -> Option<&QcVerdict> {
        self.attempts.last().and_then(|a| a.qc_verdict.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(verdict: Option<QcVerdict>, worker_error: Option<&str>) -> ExecutionAttempt {
        ExecutionAttempt {
            attempt_number: 1,
            worker_output: worker_error.is_none().then(|| "out".to_string()),
            worker_error: worker_error.map(str::to_string),
            qc_verdict: verdict,
            worker_breaker: BreakerReport::default(),
            qc_breaker: None,
            prompt: "p".to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_verdict_score_clamped() {
        assert_eq!(QcVerdict::pass(150, "ok").score, 100);
    }

    #[test]
    fn test_synthetic_fail() {
        let v = QcVerdict::synthetic_fail("QC crashed", "timeout");
        assert!(!v.passed);
        assert_eq!(v.score, 0);
        assert!(v.synthetic);
        assert_eq!(v.issues, vec!["timeout".to_string()]);
    }

    #[test]
    fn test_attempt_passed_without_qc() {
        assert!(attempt(None, None).passed());
        assert!(!attempt(None, Some("boom")).passed());
    }

    #[test]
    fn test_attempt_passed_follows_verdict() {
        assert!(attempt(Some(QcVerdict::pass(90, "good")), None).passed());
        let failed = QcVerdict::fail(95, "high score but failed", vec![], vec![]);
        assert!(!attempt(Some(failed), None).passed());
    }

    #[test]
    fn test_attempt_breaker_flag() {
        let mut a = attempt(None, None);
        assert!(!a.circuit_breaker_triggered());
        a.qc_breaker = Some(BreakerReport {
            triggered: true,
            ..Default::default()
        });
        assert!(a.circuit_breaker_triggered());
    }

    #[test]
    fn test_usage_add_report() {
        let mut usage = Usage::default();
        usage.add_report(&BreakerReport {
            tool_calls: 4,
            estimated_tokens: 1000,
            ..Default::default()
        });
        assert_eq!(usage.tool_calls, 4);
        assert_eq!(usage.estimated_tokens, 1000);
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&ExecutionStatus::Failure).unwrap(),
            "\"failure\""
        );
        assert_eq!(ExecutionStatus::Success.to_string(), "success");
    }
}
