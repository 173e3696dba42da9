//! Agent invocation seam.
//!
//! Every worker and QC call goes through an [`AgentInvoker`]. Invocations are
//! owned, self-contained values: the trait has no notion of a session or a
//! conversation, so nothing can leak from one call into the next.
//!
//! [`CommandInvoker`] is the production invoker. It runs an agent CLI in
//! headless mode once per call and parses its JSON result.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::core::task::{ExecutionId, TaskId};
use crate::error::{Error, Result};
use crate::orchestration::breaker::CircuitBreaker;
use crate::{clog_debug, clog_trace};

/// Which side of the Worker -> QC protocol a call serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationKind {
    Worker,
    Qc,
}

impl std::fmt::Display for InvocationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvocationKind::Worker => write!(f, "worker"),
            InvocationKind::Qc => write!(f, "qc"),
        }
    }
}

/// One agent call.
#[derive(Clone)]
pub struct Invocation {
    pub execution_id: ExecutionId,
    pub task_id: TaskId,
    pub kind: InvocationKind,
    /// 1-based attempt this call belongs to.
    pub attempt: u32,
    pub role: String,
    pub prompt: String,
    /// Live counters for this call. Invokers that can observe tool use
    /// should record into it and stop once `should_halt()` is true.
    pub breaker: Arc<CircuitBreaker>,
    /// Fires when the run is cancelled.
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("task_id", &self.task_id)
            .field("kind", &self.kind)
            .field("attempt", &self.attempt)
            .field("role", &self.role)
            .field("prompt_chars", &self.prompt.chars().count())
            .finish()
    }
}

/// What an invoker reports back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationOutput {
    pub output: String,
    #[serde(default)]
    pub tool_calls: u32,
    #[serde(default)]
    pub messages: u32,
    /// Token footprint if the agent reported one.
    #[serde(default)]
    pub tokens: Option<u64>,
    /// Downstream requests actually made (recorded against the rate gate).
    #[serde(default = "default_requests")]
    pub requests: u32,
}

fn default_requests() -> u32 {
    1
}

impl InvocationOutput {
    /// Plain text answer from a single request.
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            tool_calls: 0,
            messages: 1,
            tokens: None,
            requests: 1,
        }
    }

    pub fn with_tool_calls(mut self, tool_calls: u32) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    pub fn with_messages(mut self, messages: u32) -> Self {
        self.messages = messages;
        self
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn with_requests(mut self, requests: u32) -> Self {
        self.requests = requests;
        self
    }
}

/// Performs worker and QC calls.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, invocation: Invocation) -> Result<InvocationOutput>;
}

#[async_trait]
impl<T: AgentInvoker + ?Sized> AgentInvoker for Arc<T> {
    async fn invoke(&self, invocation: Invocation) -> Result<InvocationOutput> {
        (**self).invoke(invocation).await
    }
}

/// Internal struct for deserializing the agent CLI's JSON result.
#[derive(Debug, Deserialize)]
struct RawAgentResponse {
    subtype: Option<String>,
    #[serde(default)]
    is_error: bool,
    result: Option<String>,
    #[serde(default)]
    error: Option<String>,
    num_turns: Option<u32>,
    #[serde(default)]
    tool_calls: Option<u32>,
    #[serde(default)]
    usage: Option<RawUsage>,
}

#[derive(Debug, Deserialize)]
struct RawUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Runs an agent CLI once per invocation.
///
/// Command line: `<binary> <args...> --agent <role> --output-format json -p <prompt>`.
#[derive(Debug, Clone)]
pub struct CommandInvoker {
    binary: PathBuf,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandInvoker {
    /// Locate `command` on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns `Error::AgentBinaryNotFound` if it cannot be found.
    pub fn new(command: &str, args: Vec<String>) -> Result<Self> {
        let binary =
            which::which(command).map_err(|_| Error::AgentBinaryNotFound(command.to_string()))?;
        Ok(Self::with_binary(binary).with_args(args))
    }

    pub fn with_binary(binary: PathBuf) -> Self {
        Self {
            binary,
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn command(&self, invocation: &Invocation) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.args)
            .arg("--agent")
            .arg(&invocation.role)
            .arg("--output-format")
            .arg("json")
            .arg("-p")
            .arg(&invocation.prompt)
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    /// Parse the CLI's JSON result.
    ///
    /// Returns `Ok(None)` when `json_str` is not a result object at all.
    pub fn parse_json_response(role: &str, json_str: &str) -> Result<Option<InvocationOutput>> {
        let raw: RawAgentResponse = match serde_json::from_str(json_str.trim()) {
            Ok(raw) => raw,
            Err(_) => return Ok(None),
        };

        let failed = raw.is_error || raw.subtype.as_deref() == Some("error") || raw.error.is_some();
        if failed {
            let message = raw
                .error
                .or(raw.result)
                .unwrap_or_else(|| "agent reported an error".to_string());
            return Err(Error::Invocation {
                role: role.to_string(),
                message,
            });
        }

        let Some(output) = raw.result else {
            return Ok(None);
        };
        let messages = raw.num_turns.unwrap_or(1);
        Ok(Some(InvocationOutput {
            output,
            tool_calls: raw.tool_calls.unwrap_or(0),
            messages,
            tokens: raw.usage.map(|u| u.input_tokens + u.output_tokens),
            requests: messages.max(1),
        }))
    }
}

#[async_trait]
impl AgentInvoker for CommandInvoker {
    async fn invoke(&self, invocation: Invocation) -> Result<InvocationOutput> {
        clog_debug!(
            "CommandInvoker: {} {} for {} (attempt {})",
            invocation.kind,
            invocation.role,
            invocation.task_id,
            invocation.attempt
        );

        let mut cmd = self.command(&invocation);
        let output = tokio::select! {
            output = cmd.output() => output?,
            _ = invocation.cancel.cancelled() => {
                return Err(Error::Cancelled {
                    execution_id: invocation.execution_id.to_string(),
                    reason: "agent call aborted".to_string(),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        clog_trace!(
            "CommandInvoker: exit={:?} stdout={}B stderr={}B",
            output.status.code(),
            stdout.len(),
            stderr.len()
        );

        if let Some(parsed) = Self::parse_json_response(&invocation.role, &stdout)? {
            return Ok(parsed);
        }

        if !output.status.success() {
            let message = if stderr.trim().is_empty() {
                format!(
                    "agent exited with code {}",
                    output.status.code().unwrap_or(-1)
                )
            } else {
                stderr.trim().to_string()
            };
            return Err(Error::Invocation {
                role: invocation.role,
                message,
            });
        }

        Ok(InvocationOutput::text(stdout.trim()))
    }
}
