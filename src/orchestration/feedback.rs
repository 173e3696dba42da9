//! Prompt construction, verdict parsing and failure analysis.
//!
//! Everything here is a pure function over task definitions, outputs and
//! verdicts; none of it performs an agent call.

use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::core::execution::{ExecutionAttempt, Postmortem, QcVerdict, RecurringIssue};
use crate::core::task::TaskDefinition;
use crate::util::truncate_chars;

/// Default number of worker-output characters forwarded to QC.
pub const DEFAULT_QC_OUTPUT_LIMIT: usize = 15_000;

static FENCED_JSON_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(\{.*?\})\s*```").unwrap());

static VERDICT_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*\**VERDICT\**\s*:\s*\**\s*(PASS|FAIL)\b").unwrap());

static SCORE_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*\**SCORE\**\s*:\s*\**\s*(\d{1,3})").unwrap());

/// Worker prompt for a retry: the original prompt followed by every prior
/// verdict, verbatim, oldest first.
pub fn build_retry_prompt(original_prompt: &str, feedback_history: &[QcVerdict]) -> String {
    if feedback_history.is_empty() {
        return original_prompt.to_string();
    }

    let mut prompt = String::with_capacity(original_prompt.len() + 512);
    prompt.push_str(original_prompt.trim_end());
    prompt.push_str("\n\n## Previous attempts\n\n");
    prompt.push_str(&format!(
        "This task has been attempted {} time(s) without passing verification. \
         Address every point below in this attempt.\n",
        feedback_history.len()
    ));

    for (i, verdict) in feedback_history.iter().enumerate() {
        prompt.push_str(&format!(
            "\n### Attempt {} (score {}/100, {})\n",
            i + 1,
            verdict.score,
            if verdict.passed { "passed" } else { "failed" }
        ));
        prompt.push_str("Feedback:\n");
        prompt.push_str(&verdict.feedback);
        prompt.push('\n');
        push_list(&mut prompt, "Issues", &verdict.issues);
        push_list(&mut prompt, "Required fixes", &verdict.required_fixes);
    }

    prompt
}

fn push_list(out: &mut String, heading: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    out.push_str(heading);
    out.push_str(":\n");
    for item in items {
        out.push_str("- ");
        out.push_str(item);
        out.push('\n');
    }
}

/// QC prompt for one worker output. Only the first `output_limit`
/// characters of the output are forwarded.
pub fn build_qc_prompt(task: &TaskDefinition, worker_output: &str, output_limit: usize) -> String {
    let mut prompt = format!("Review the result of task {}", task.id);
    if let Some(title) = &task.title {
        prompt.push_str(&format!(": {}", title));
    }
    prompt.push_str("\n\n## Task\n");
    prompt.push_str(task.prompt_body.trim_end());
    prompt.push('\n');

    if !task.verification_criteria.is_empty() {
        prompt.push_str("\n## Verification criteria\n");
        for criterion in &task.verification_criteria {
            prompt.push_str("- ");
            prompt.push_str(criterion);
            prompt.push('\n');
        }
    }

    let prefix = truncate_chars(worker_output, output_limit);
    prompt.push_str("\n## Worker output\n");
    prompt.push_str(prefix);
    prompt.push('\n');
    if prefix.len() < worker_output.len() {
        prompt.push_str(&format!(
            "[output truncated: showing first {} of {} characters]\n",
            output_limit,
            worker_output.chars().count()
        ));
    }

    prompt.push_str(
        "\n## Response format\n\
         Respond with a single JSON object:\n\
         {\"passed\": true|false, \"score\": 0-100, \"feedback\": \"...\", \
         \"issues\": [\"...\"], \"required_fixes\": [\"...\"]}\n",
    );
    prompt
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    #[serde(alias = "pass")]
    passed: bool,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    feedback: Option<String>,
    #[serde(default)]
    issues: Vec<String>,
    #[serde(default, alias = "requiredFixes")]
    required_fixes: Vec<String>,
}

impl RawVerdict {
    fn into_verdict(self) -> QcVerdict {
        let score = match self.score {
            Some(s) if s.is_finite() => s.round().clamp(0.0, 100.0) as u8,
            _ if self.passed => 100,
            _ => 0,
        };
        QcVerdict {
            passed: self.passed,
            score,
            feedback: self.feedback.unwrap_or_default(),
            issues: self.issues,
            required_fixes: self.required_fixes,
            synthetic: false,
        }
    }
}

/// Read a verdict from QC output.
///
/// Tries, in order: the whole output as JSON, a fenced ```json block, the
/// outermost `{...}` span, then `VERDICT:`/`SCORE:` lines. Returns `None`
/// when none of them yields a verdict.
pub fn parse_verdict(output: &str) -> Option<QcVerdict> {
    let trimmed = output.trim();

    let mut candidates: Vec<&str> = vec![trimmed];
    if let Some(caps) = FENCED_JSON_RE.captures(trimmed) {
        if let Some(m) = caps.get(1) {
            candidates.push(m.as_str());
        }
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            candidates.push(&trimmed[start..=end]);
        }
    }

    for candidate in candidates {
        if let Ok(raw) = serde_json::from_str::<RawVerdict>(candidate) {
            return Some(raw.into_verdict());
        }
    }

    parse_verdict_lines(trimmed)
}

fn parse_verdict_lines(output: &str) -> Option<QcVerdict> {
    let verdict = VERDICT_LINE_RE.captures(output)?;
    let passed = verdict
        .get(1)
        .is_some_and(|m| m.as_str().eq_ignore_ascii_case("pass"));
    let score = SCORE_LINE_RE
        .captures(output)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u16>().ok())
        .map(|s| s.min(100) as u8)
        .unwrap_or(if passed { 100 } else { 0 });

    let feedback = output
        .lines()
        .filter(|line| !VERDICT_LINE_RE.is_match(line) && !SCORE_LINE_RE.is_match(line))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string();

    Some(if passed {
        QcVerdict::pass(score, &feedback)
    } else {
        QcVerdict::fail(score, &feedback, Vec::new(), Vec::new())
    })
}

/// Verdict to use when QC output carries none.
pub fn unparseable_verdict(output: &str) -> QcVerdict {
    QcVerdict::synthetic_fail(
        &format!(
            "QC output could not be parsed into a verdict: {}",
            truncate_chars(output.trim(), 500)
        ),
        "unparseable QC verdict",
    )
}

fn normalize_issue(issue: &str) -> String {
    issue
        .trim()
        .trim_end_matches(['.', '!', ';'])
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Failure analysis over a failed task's attempts. Deterministic; makes no
/// agent calls.
pub fn synthesize_postmortem(history: &[ExecutionAttempt]) -> Postmortem {
    let attempts = history.len();
    let worker_errors = history.iter().filter(|a| a.worker_error.is_some()).count();
    let breaker_trips = history
        .iter()
        .filter(|a| a.circuit_breaker_triggered())
        .count();

    let score_trend: Vec<u8> = history
        .iter()
        .map(|a| a.qc_verdict.as_ref().map(|v| v.score).unwrap_or(0))
        .collect();

    // issue -> (first wording seen, attempts reporting it, order first seen)
    let mut seen: BTreeMap<String, (String, usize, usize)> = BTreeMap::new();
    for attempt in history {
        let Some(verdict) = &attempt.qc_verdict else {
            continue;
        };
        let mut in_attempt = HashSet::new();
        for issue in &verdict.issues {
            let key = normalize_issue(issue);
            if key.is_empty() || !in_attempt.insert(key.clone()) {
                continue;
            }
            let order = seen.len();
            let entry = seen
                .entry(key)
                .or_insert_with(|| (issue.trim().to_string(), 0, order));
            entry.1 += 1;
        }
    }
    let mut recurring: Vec<(String, usize, usize)> = seen
        .into_values()
        .filter(|(_, count, _)| *count >= 2)
        .collect();
    recurring.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    let recurring_issues: Vec<RecurringIssue> = recurring
        .into_iter()
        .map(|(issue, occurrences, _)| RecurringIssue { issue, occurrences })
        .collect();

    let improving = score_trend.len() >= 2
        && score_trend.last() > score_trend.first();

    let root_cause = if attempts == 0 {
        "Task never ran".to_string()
    } else if worker_errors == attempts {
        let last = history
            .last()
            .and_then(|a| a.worker_error.as_deref())
            .unwrap_or("unknown error");
        format!("Worker failed on every attempt; last error: {}", last)
    } else if let Some(top) = recurring_issues.first() {
        format!(
            "Issue persisted across {} of {} attempts: {}",
            top.occurrences, attempts, top.issue
        )
    } else if breaker_trips > 0 {
        format!(
            "Circuit breaker tripped on {} of {} attempts; output was truncated",
            breaker_trips, attempts
        )
    } else if attempts >= 2 && !improving {
        "QC scores did not improve across attempts; feedback is not being applied".to_string()
    } else {
        "Each attempt failed verification for different reasons".to_string()
    };

    let mut remediation = Vec::new();
    let mut remediation_seen = HashSet::new();
    for verdict in history.iter().filter_map(|a| a.qc_verdict.as_ref()) {
        for fix in &verdict.required_fixes {
            if remediation_seen.insert(normalize_issue(fix)) {
                remediation.push(fix.trim().to_string());
            }
        }
    }
    for issue in &recurring_issues {
        let hint = format!("Resolve recurring issue: {}", issue.issue);
        if remediation_seen.insert(normalize_issue(&hint)) {
            remediation.push(hint);
        }
    }
    if worker_errors > 0 {
        remediation.push(format!(
            "Investigate worker failures ({} of {} attempts raised)",
            worker_errors, attempts
        ));
    }
    if breaker_trips > 0 {
        remediation.push(
            "Split the task or raise estimated_tool_calls; the circuit breaker cut output short"
                .to_string(),
        );
    }
    if remediation.is_empty() {
        remediation.push("Clarify the task prompt and verification criteria".to_string());
    }

    let trend = score_trend
        .iter()
        .map(u8::to_string)
        .collect::<Vec<_>>()
        .join(" -> ");
    let summary = format!(
        "Failed after {} attempt(s); QC scores {}",
        attempts,
        if trend.is_empty() { "n/a".to_string() } else { trend }
    );

    Postmortem {
        summary,
        root_cause,
        recurring_issues,
        score_trend,
        remediation,
    }
}
