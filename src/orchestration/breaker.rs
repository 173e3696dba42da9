//! Circuit breaker for a single worker or QC invocation.
//!
//! An invocation may loop through many tool round-trips. The breaker counts
//! tool calls, messages and an estimated token footprint; crossing a soft
//! threshold is only logged, crossing a hard one trips the breaker, which
//! truncates the output and flags the result instead of raising.
//!
//! Counters are shared with the invoker through [`Invocation`], so an agent
//! implementation can record as it goes and stop early once
//! [`CircuitBreaker::should_halt`] returns true. Totals the invoker reports
//! at the end are folded in with [`CircuitBreaker::observe`].
//!
//! [`Invocation`]: crate::orchestration::Invocation

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::core::execution::BreakerReport;
use crate::util::truncate_chars;
use crate::{clog_debug, clog_warn};

pub const SOFT_TOOL_CALLS: u32 = 30;
pub const SOFT_MESSAGES: u32 = 40;
pub const SOFT_TOKENS: u64 = 50_000;
pub const DEFAULT_TOOL_CALL_CEILING: u32 = 100;
pub const HARD_TOKENS: u64 = 80_000;
/// Messages may run to this multiple of the tool-call ceiling.
pub const MESSAGE_CEILING_FACTOR: u32 = 10;
/// Headroom applied to a caller-supplied tool-call estimate.
pub const ESTIMATE_HEADROOM: f64 = 1.5;
pub const DEFAULT_TRUNCATED_OUTPUT_CHARS: usize = 10_000;

/// Thresholds for the breaker. Loaded from the `[breaker]` config table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub soft_tool_calls: u32,
    pub soft_messages: u32,
    pub soft_tokens: u64,
    pub default_tool_call_ceiling: u32,
    pub message_ceiling_factor: u32,
    pub hard_tokens: u64,
    pub estimate_headroom: f64,
    /// Wall-clock ceiling per invocation, in seconds. Exceeding it trips the breaker.
    pub max_duration_secs: Option<u64>,
    /// Characters of output kept after a trip.
    pub truncated_output_chars: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            soft_tool_calls: SOFT_TOOL_CALLS,
            soft_messages: SOFT_MESSAGES,
            soft_tokens: SOFT_TOKENS,
            default_tool_call_ceiling: DEFAULT_TOOL_CALL_CEILING,
            message_ceiling_factor: MESSAGE_CEILING_FACTOR,
            hard_tokens: HARD_TOKENS,
            estimate_headroom: ESTIMATE_HEADROOM,
            max_duration_secs: None,
            truncated_output_chars: DEFAULT_TRUNCATED_OUTPUT_CHARS,
        }
    }
}

impl BreakerConfig {
    /// Hard tool-call ceiling: `estimate * headroom` rounded up, or the default.
    pub fn tool_call_ceiling(&self, estimate: Option<u32>) -> u32 {
        match estimate {
            Some(estimate) if estimate > 0 => {
                (f64::from(estimate) * self.estimate_headroom).ceil() as u32
            }
            _ => self.default_tool_call_ceiling,
        }
    }

    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration_secs.map(Duration::from_secs)
    }
}

/// Live guard for one invocation.
pub struct CircuitBreaker {
    label: String,
    config: BreakerConfig,
    tool_call_ceiling: u32,
    tool_calls: AtomicU32,
    messages: AtomicU32,
    tokens: AtomicU64,
    started: Instant,
    trip_reason: OnceLock<String>,
    warnings: Mutex<Vec<String>>,
}

impl CircuitBreaker {
    /// Create a breaker for one invocation. `estimate` is the caller's
    /// expected tool-call count, which replaces the default ceiling.
    pub fn new(label: &str, config: &BreakerConfig, estimate: Option<u32>) -> Self {
        Self {
            label: label.to_string(),
            tool_call_ceiling: config.tool_call_ceiling(estimate),
            config: config.clone(),
            tool_calls: AtomicU32::new(0),
            messages: AtomicU32::new(0),
            tokens: AtomicU64::new(0),
            started: Instant::now(),
            trip_reason: OnceLock::new(),
            warnings: Mutex::new(Vec::new()),
        }
    }

    pub fn tool_call_ceiling(&self) -> u32 {
        self.tool_call_ceiling
    }

    pub fn message_ceiling(&self) -> u32 {
        self.tool_call_ceiling
            .saturating_mul(self.config.message_ceiling_factor)
    }

    pub fn max_duration(&self) -> Option<Duration> {
        self.config.max_duration()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn record_tool_call(&self) {
        self.tool_calls.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_message(&self) {
        self.messages.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_tokens(&self, tokens: u64) {
        self.tokens.fetch_add(tokens, Ordering::SeqCst);
    }

    /// Fold in totals reported at the end of the invocation.
    ///
    /// Live counters and reported totals describe the same calls, so the
    /// larger of the two wins instead of adding them up.
    pub fn observe(&self, tool_calls: u32, messages: u32, tokens: u64) {
        self.tool_calls.fetch_max(tool_calls, Ordering::SeqCst);
        self.messages.fetch_max(messages, Ordering::SeqCst);
        self.tokens.fetch_max(tokens, Ordering::SeqCst);
    }

    /// Force a trip, e.g. when the wall-clock ceiling fires.
    pub fn trip(&self, reason: &str) {
        if self.trip_reason.set(reason.to_string()).is_ok() {
            clog_warn!("CircuitBreaker[{}]: tripped: {}", self.label, reason);
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.trip_reason.get().is_some()
    }

    pub fn trip_reason(&self) -> Option<&str> {
        self.trip_reason.get().map(String::as_str)
    }

    /// Evaluate all thresholds. Returns true once a hard threshold is crossed.
    ///
    /// Invokers poll this between tool round-trips and stop when it is true.
    pub fn should_halt(&self) -> bool {
        self.check_soft();

        if self.is_tripped() {
            return true;
        }

        let tool_calls = self.tool_calls.load(Ordering::SeqCst);
        let messages = self.messages.load(Ordering::SeqCst);
        let tokens = self.tokens.load(Ordering::SeqCst);

        let reason = if tool_calls > self.tool_call_ceiling {
            Some(format!(
                "tool calls {} exceeded ceiling {}",
                tool_calls, self.tool_call_ceiling
            ))
        } else if messages > self.message_ceiling() {
            Some(format!(
                "messages {} exceeded ceiling {}",
                messages,
                self.message_ceiling()
            ))
        } else if tokens > self.config.hard_tokens {
            Some(format!(
                "estimated tokens {} exceeded ceiling {}",
                tokens, self.config.hard_tokens
            ))
        } else {
            match self.max_duration() {
                Some(limit) if self.elapsed() > limit => {
                    Some(format!("invocation ran longer than {:?}", limit))
                }
                _ => None,
            }
        };

        match reason {
            Some(reason) => {
                self.trip(&reason);
                true
            }
            None => false,
        }
    }

    fn check_soft(&self) {
        let tool_calls = self.tool_calls.load(Ordering::SeqCst);
        let messages = self.messages.load(Ordering::SeqCst);
        let tokens = self.tokens.load(Ordering::SeqCst);

        if tool_calls > self.config.soft_tool_calls {
            self.warn_once(format!(
                "tool calls above {} ({})",
                self.config.soft_tool_calls, tool_calls
            ));
        }
        if messages > self.config.soft_messages {
            self.warn_once(format!(
                "messages above {} ({})",
                self.config.soft_messages, messages
            ));
        }
        if tokens > self.config.soft_tokens {
            self.warn_once(format!(
                "estimated tokens above {} ({})",
                self.config.soft_tokens, tokens
            ));
        }
    }

    /// Log a soft-threshold warning the first time its kind appears.
    fn warn_once(&self, warning: String) {
        let kind = warning.split(" above").next().unwrap_or_default().to_string();
        let mut warnings = self
            .warnings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if warnings.iter().any(|w| w.starts_with(&kind)) {
            return;
        }
        clog_warn!("CircuitBreaker[{}]: soft threshold: {}", self.label, warning);
        warnings.push(warning);
    }

    /// Evaluate thresholds once and snapshot the result.
    pub fn evaluate(&self) -> BreakerReport {
        if self.should_halt() {
            clog_debug!(
                "CircuitBreaker[{}]: halted: {}",
                self.label,
                self.trip_reason().unwrap_or_default()
            );
        }
        self.report()
    }

    pub fn report(&self) -> BreakerReport {
        BreakerReport {
            tool_calls: self.tool_calls.load(Ordering::SeqCst),
            messages: self.messages.load(Ordering::SeqCst),
            estimated_tokens: self.tokens.load(Ordering::SeqCst),
            warnings: self
                .warnings
                .lock()
                .map(|w| w.clone())
                .unwrap_or_else(|poisoned| poisoned.into_inner().clone()),
            triggered: self.is_tripped(),
            reason: self.trip_reason().map(str::to_string),
        }
    }

    /// Final evaluation for a finished invocation.
    ///
    /// When tripped, the output is cut to the configured length and a marker
    /// line naming the reason is appended, so the result is never empty.
    pub fn finish(&self, output: String) -> (String, BreakerReport) {
        let report = self.evaluate();

        if !report.triggered {
            clog_debug!(
                "CircuitBreaker[{}]: ok tool_calls={} messages={} tokens={}",
                self.label,
                report.tool_calls,
                report.messages,
                report.estimated_tokens
            );
            return (output, report);
        }

        let reason = report.reason.as_deref().unwrap_or("limit exceeded");
        let kept = truncate_chars(&output, self.config.truncated_output_chars);
        let mut truncated = String::with_capacity(kept.len() + reason.len() + 32);
        truncated.push_str(kept);
        if !truncated.is_empty() && !truncated.ends_with('\n') {
            truncated.push('\n');
        }
        truncated.push_str(&format!("[circuit breaker triggered: {}]", reason));
        (truncated, report)
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("label", &self.label)
            .field("tool_call_ceiling", &self.tool_call_ceiling)
            .field("tripped", &self.is_tripped())
            .finish()
    }
}
